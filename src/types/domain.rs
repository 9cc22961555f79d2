//! Index domains: dense rectangles and unstructured element masks.
//!
//! A [`Domain`] is the index-space footprint of an allocation or a region.
//! Structured spaces are inclusive bounding rectangles in one to three
//! dimensions; unstructured spaces are element masks. The builder combines
//! domains (union for masks, convex hull for rectangles) and managers test
//! dominance against region domains.

use core::fmt;

/// An inclusive axis-aligned rectangle in `DIM` dimensions.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect<const DIM: usize> {
    /// Low corner (inclusive).
    pub lo: [i64; DIM],
    /// High corner (inclusive).
    pub hi: [i64; DIM],
}

impl<const DIM: usize> Rect<DIM> {
    /// Creates a rectangle from its corner points.
    #[must_use]
    pub const fn new(lo: [i64; DIM], hi: [i64; DIM]) -> Self {
        Self { lo, hi }
    }

    /// Returns true if the rectangle contains no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..DIM).any(|d| self.hi[d] < self.lo[d])
    }

    /// Number of points covered.
    #[must_use]
    pub fn volume(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (0..DIM)
            .map(|d| (self.hi[d] - self.lo[d] + 1) as usize)
            .product()
    }

    /// Returns true if every point of `other` lies inside `self`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        if other.is_empty() {
            return true;
        }
        if self.is_empty() {
            return false;
        }
        (0..DIM).all(|d| self.lo[d] <= other.lo[d] && other.hi[d] <= self.hi[d])
    }

    /// Smallest rectangle covering both inputs.
    #[must_use]
    pub fn convex_hull(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut lo = self.lo;
        let mut hi = self.hi;
        for d in 0..DIM {
            lo[d] = lo[d].min(other.lo[d]);
            hi[d] = hi[d].max(other.hi[d]);
        }
        Self { lo, hi }
    }
}

impl<const DIM: usize> fmt::Debug for Rect<DIM> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rect(")?;
        for d in 0..DIM {
            if d > 0 {
                write!(f, "x")?;
            }
            write!(f, "[{}..{}]", self.lo[d], self.hi[d])?;
        }
        write!(f, ")")
    }
}

/// A growable bit set of element indices for unstructured spaces.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ElementMask {
    words: Vec<u64>,
    span: usize,
}

impl ElementMask {
    /// Creates a mask spanning `span` element slots, all clear.
    #[must_use]
    pub fn new(span: usize) -> Self {
        Self {
            words: vec![0; span.div_ceil(64)],
            span,
        }
    }

    /// The number of element slots the mask spans.
    #[must_use]
    pub const fn span(&self) -> usize {
        self.span
    }

    /// The number of set elements.
    #[must_use]
    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Marks element `index` as present.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the span.
    pub fn set(&mut self, index: usize) {
        assert!(index < self.span, "element {index} outside span {}", self.span);
        self.words[index / 64] |= 1 << (index % 64);
    }

    /// Returns true if element `index` is present.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        index < self.span && (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    /// Adds every element of `other`, growing the span as needed.
    pub fn union_with(&mut self, other: &Self) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        self.span = self.span.max(other.span);
        for (word, &theirs) in self.words.iter_mut().zip(&other.words) {
            *word |= theirs;
        }
    }

    /// Returns true if every element of `other` is present in `self`.
    #[must_use]
    pub fn contains_all(&self, other: &Self) -> bool {
        for (index, &theirs) in other.words.iter().enumerate() {
            let ours = self.words.get(index).copied().unwrap_or(0);
            if theirs & !ours != 0 {
                return false;
            }
        }
        true
    }

    /// Raw word access for the wire codec.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Rebuilds a mask from its wire representation.
    #[must_use]
    pub fn from_words(span: usize, mut words: Vec<u64>) -> Self {
        words.resize(span.div_ceil(64), 0);
        Self { words, span }
    }
}

impl fmt::Debug for ElementMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ElementMask({}/{} set)",
            self.cardinality(),
            self.span
        )
    }
}

/// The index-space footprint of an allocation or region.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Domain {
    /// Dimension 0: an unstructured set of elements.
    Unstructured(ElementMask),
    /// Dimension 1 bounding rectangle.
    Rect1(Rect<1>),
    /// Dimension 2 bounding rectangle.
    Rect2(Rect<2>),
    /// Dimension 3 bounding rectangle.
    Rect3(Rect<3>),
}

impl Domain {
    /// The dimensionality tag: 0 for unstructured, 1..=3 for rectangles.
    #[must_use]
    pub const fn dim(&self) -> u8 {
        match self {
            Self::Unstructured(_) => 0,
            Self::Rect1(_) => 1,
            Self::Rect2(_) => 2,
            Self::Rect3(_) => 3,
        }
    }

    /// Number of element slots an allocation over this domain must cover.
    ///
    /// For unstructured spaces this is the span of the element mask, not its
    /// cardinality: allocations are sized for every slot the mask can name.
    #[must_use]
    pub fn volume(&self) -> usize {
        match self {
            Self::Unstructured(mask) => mask.span(),
            Self::Rect1(rect) => rect.volume(),
            Self::Rect2(rect) => rect.volume(),
            Self::Rect3(rect) => rect.volume(),
        }
    }

    /// Returns true if this domain covers every point of `other`.
    ///
    /// Dominance is only defined between domains of the same dimensionality;
    /// mismatched dimensions are never dominated.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unstructured(ours), Self::Unstructured(theirs)) => ours.contains_all(theirs),
            (Self::Rect1(ours), Self::Rect1(theirs)) => ours.dominates(theirs),
            (Self::Rect2(ours), Self::Rect2(theirs)) => ours.dominates(theirs),
            (Self::Rect3(ours), Self::Rect3(theirs)) => ours.dominates(theirs),
            _ => false,
        }
    }

    /// Combines two domains into the smallest covering domain.
    ///
    /// Unstructured domains take the element union; structured domains take
    /// the convex hull of the bounding rectangles.
    ///
    /// # Panics
    ///
    /// Panics if the dimensionalities differ; regions resolved into a single
    /// allocation must share an index tree.
    #[must_use]
    pub fn covering_union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Unstructured(ours), Self::Unstructured(theirs)) => {
                let mut mask = ours.clone();
                mask.union_with(theirs);
                Self::Unstructured(mask)
            }
            (Self::Rect1(ours), Self::Rect1(theirs)) => Self::Rect1(ours.convex_hull(theirs)),
            (Self::Rect2(ours), Self::Rect2(theirs)) => Self::Rect2(ours.convex_hull(theirs)),
            (Self::Rect3(ours), Self::Rect3(theirs)) => Self::Rect3(ours.convex_hull(theirs)),
            (ours, theirs) => panic!(
                "cannot combine domains of dimension {} and {}",
                ours.dim(),
                theirs.dim()
            ),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstructured(mask) => write!(f, "unstructured({})", mask.span()),
            Self::Rect1(rect) => write!(f, "{rect:?}"),
            Self::Rect2(rect) => write!(f, "{rect:?}"),
            Self::Rect3(rect) => write!(f, "{rect:?}"),
        }
    }
}
