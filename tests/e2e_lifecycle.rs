//! Lifecycle tests: reference edges, deletion, top views, eviction hints.

mod common;

use std::sync::Arc;

use common::{Cluster, TEST_MEMORY};
use regolith::gc::LifecycleState;
use regolith::types::{ContextUid, FieldId, GcPriority, MapperId, ProcessorId, ViewId};
use regolith::{DimensionKind, Event, InstanceBuilder, LayoutConstraintSet, PhysicalManager, Runtime};

fn build_manager(cluster: &Cluster) -> Arc<PhysicalManager> {
    let rt = cluster.node(0);
    let region = common::build_mirrored_region(cluster);
    let memory = rt.find_memory_manager(TEST_MEMORY).unwrap();
    let constraints = LayoutConstraintSet::normal(
        vec![FieldId(1), FieldId(2)],
        vec![DimensionKind::X, DimensionKind::Field],
    );
    let mut builder = InstanceBuilder::new(vec![region], constraints, memory);
    builder
        .create_physical_instance(rt, rt.forest())
        .expect("allocation fits")
}

fn acquire_release_cycle(rt: &Runtime, manager: &Arc<PhysicalManager>, deferred: Event) {
    manager.add_resource_refs(rt, 1);
    manager.add_valid_refs(rt, 1);
    manager.remove_valid_refs(rt, 1);
    manager.remove_resource_refs(rt, 1, deferred);
}

#[test]
fn state_machine_walks_both_colors() {
    let cluster = Cluster::new(1);
    let rt = cluster.node(0);
    let manager = build_manager(&cluster);

    assert_eq!(manager.lifecycle_state(), LifecycleState::InactiveInvalid);
    manager.add_resource_refs(rt, 1);
    assert_eq!(manager.lifecycle_state(), LifecycleState::ActiveInvalid);
    manager.add_valid_refs(rt, 1);
    assert_eq!(manager.lifecycle_state(), LifecycleState::ActiveValid);
    manager.remove_valid_refs(rt, 1);
    assert_eq!(manager.lifecycle_state(), LifecycleState::ActiveInvalid);

    let memory = manager.memory();
    let stats = memory.stats();
    assert_eq!(stats.activations, 1);
    assert_eq!(stats.validations, 1);
    assert_eq!(stats.invalidations, 1);
    assert_eq!(stats.deactivations, 0);
}

#[test]
fn owner_destruction_deletes_the_allocation_once() {
    let cluster = Cluster::new(1);
    let rt = cluster.node(0);
    let manager = build_manager(&cluster);
    let memory = Arc::clone(manager.memory());
    let instance = manager.instance();

    acquire_release_cycle(rt, &manager, Event(42));

    // The manager destroyed itself on the final release.
    assert_eq!(rt.collectable_count(), 0);
    assert_eq!(memory.deletions(), vec![(instance, Event(42))]);
    assert!(!memory.instance_exists(instance.id));
    assert_eq!(memory.stats().deactivations, 1);
    assert!(manager
        .region_node()
        .find_physical_manager(manager.did())
        .is_none());
}

#[test]
fn perform_deletion_is_idempotent() {
    let cluster = Cluster::new(1);
    let manager = build_manager(&cluster);
    let memory = Arc::clone(manager.memory());

    manager.perform_deletion(Event(7));
    manager.perform_deletion(Event(8));
    assert_eq!(memory.deletions().len(), 1);
    assert_eq!(memory.deletions()[0].1, Event(7));
}

#[test]
fn reacquire_after_drop_is_rejected() {
    let cluster = Cluster::new(1);
    let rt = cluster.node(0);
    let manager = build_manager(&cluster);
    acquire_release_cycle(rt, &manager, Event::NONE);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        manager.add_resource_refs(rt, 1);
    }));
    assert!(result.is_err(), "post-destruction acquire must abort");
}

#[test]
fn top_view_registry_per_context() {
    let cluster = Cluster::new(1);
    let manager = build_manager(&cluster);
    let c1 = ContextUid(1);
    let c2 = ContextUid(2);
    let v1 = ViewId(101);
    let v2 = ViewId(202);

    manager.register_logical_top_view(c1, v1);
    manager.register_logical_top_view(c2, v2);
    assert_eq!(manager.find_logical_top_view(c1), Some(v1));
    assert_eq!(manager.find_logical_top_view(c2), Some(v2));

    manager.unregister_logical_top_view(v1);
    assert_eq!(manager.find_logical_top_view(c1), None);
    assert_eq!(manager.find_logical_top_view(c2), Some(v2));
}

#[test]
#[should_panic(expected = "duplicate top view")]
fn duplicate_top_view_registration_aborts() {
    let cluster = Cluster::new(1);
    let manager = build_manager(&cluster);
    manager.register_logical_top_view(ContextUid(1), ViewId(1));
    manager.register_logical_top_view(ContextUid(1), ViewId(2));
}

#[test]
#[should_panic(expected = "unknown top view")]
fn unbalanced_top_view_unregistration_aborts() {
    let cluster = Cluster::new(1);
    let manager = build_manager(&cluster);
    manager.unregister_logical_top_view(ViewId(9));
}

#[test]
fn gc_priority_flows_to_the_memory_manager() {
    let cluster = Cluster::new(1);
    let manager = build_manager(&cluster);
    manager.set_garbage_collection_priority(MapperId(0), ProcessorId(0), GcPriority(-3));
    let candidates = manager.memory().eviction_candidates();
    assert_eq!(candidates, vec![manager.did()]);

    manager.set_garbage_collection_priority(MapperId(0), ProcessorId(0), GcPriority::NEVER);
    assert!(manager.memory().eviction_candidates().is_empty());
}

#[test]
fn leak_check_reports_live_instances() {
    let cluster = Cluster::new(1);
    let rt = cluster.node(0);
    let manager = build_manager(&cluster);
    assert_eq!(rt.check_leaks(), 1);

    acquire_release_cycle(rt, &manager, Event::NONE);
    assert_eq!(rt.check_leaks(), 0);
}
