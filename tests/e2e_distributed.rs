//! Distributed tests: manager transfer, proxy reference counting, and
//! owner-driven teardown across an in-memory cluster.

mod common;

use std::sync::Arc;

use common::{Cluster, SUM_I64, TEST_MEMORY};
use regolith::layout::SpecializationKind;
use regolith::types::{AddressSpace, Domain, FieldId, FieldMask, Rect};
use regolith::{
    DimensionKind, Event, InstanceBuilder, LayoutConstraintSet, PhysicalManager, Runtime,
};

fn build_owner_manager(cluster: &Cluster) -> Arc<PhysicalManager> {
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

fn proxy_on(cluster: &Cluster, node: u32, manager: &Arc<PhysicalManager>) -> Arc<PhysicalManager> {
    cluster
        .node(node)
        .find_collectable(manager.did())
        .expect("proxy registered after pump")
}

#[test]
fn instance_manager_transfer_builds_a_proxy() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let manager = build_owner_manager(&cluster);

    manager.send_manager(rt, AddressSpace(1));
    cluster.pump();

    let proxy = proxy_on(&cluster, 1, &manager);
    assert!(!proxy.is_owner());
    assert_eq!(proxy.owner_space(), AddressSpace(0));
    assert_eq!(proxy.instance(), manager.instance());
    assert_eq!(proxy.instance_domain(), manager.instance_domain());
    assert_eq!(
        proxy.layout().unwrap().allocated_fields(),
        manager.layout().unwrap().allocated_fields()
    );
    // The receive path resolved the constraint set shipped on first contact.
    assert!(cluster
        .node(1)
        .constraints()
        .find(manager.layout().unwrap().constraints().id())
        .is_ok());
    assert!(manager.has_remote_instance(AddressSpace(1)));
}

#[test]
fn copy_offsets_agree_across_nodes() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let manager = build_owner_manager(&cluster);
    manager.send_manager(rt, AddressSpace(1));
    cluster.pump();
    let proxy = proxy_on(&cluster, 1, &manager);

    let mask = FieldMask::from_indexes([0, 1]);
    let mut src = Vec::new();
    manager.compute_copy_offsets(&mask, &mut src);
    let mut dst = Vec::new();
    proxy.compute_copy_offsets(&mask, &mut dst);
    assert_eq!(src.len(), dst.len());
    for (ours, theirs) in src.iter().zip(&dst) {
        assert_eq!(ours.field_id, theirs.field_id);
        assert_eq!(ours.offset, theirs.offset);
        assert_eq!(ours.size, theirs.size);
    }
}

#[test]
fn duplicate_sends_ship_once() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let manager = build_owner_manager(&cluster);

    manager.send_manager(rt, AddressSpace(1));
    let sent_after_first = cluster.transport.sent();
    manager.send_manager(rt, AddressSpace(1));
    assert_eq!(cluster.transport.sent(), sent_after_first);
    cluster.pump();
    assert!(cluster.node(1).find_collectable(manager.did()).is_ok());
}

#[test]
fn layout_pack_carries_has_local_after_first_send() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let manager = build_owner_manager(&cluster);
    let layout = Arc::clone(manager.layout().unwrap());

    assert!(!layout.pack(AddressSpace(1)).has_local);
    manager.send_manager(rt, AddressSpace(1));
    let payload = layout.pack(AddressSpace(1));
    assert!(payload.has_local);
    assert_eq!(payload.constraint_id, layout.constraints().id());
}

#[test]
fn second_manager_reuses_the_remote_layout() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let region = common::build_mirrored_region(&cluster);
    let memory = rt.find_memory_manager(TEST_MEMORY).unwrap();
    let constraints = LayoutConstraintSet::normal(
        vec![FieldId(1), FieldId(2)],
        vec![DimensionKind::X, DimensionKind::Field],
    );
    let mut first_builder =
        InstanceBuilder::new(vec![region], constraints.clone(), Arc::clone(&memory));
    let first = first_builder.create_physical_instance(rt, rt.forest()).unwrap();
    let mut second_builder = InstanceBuilder::new(vec![region], constraints, memory);
    let second = second_builder.create_physical_instance(rt, rt.forest()).unwrap();

    first.send_manager(rt, AddressSpace(1));
    cluster.pump();
    second.send_manager(rt, AddressSpace(1));
    cluster.pump();

    let first_proxy = proxy_on(&cluster, 1, &first);
    let second_proxy = proxy_on(&cluster, 1, &second);
    assert!(Arc::ptr_eq(
        first_proxy.layout().unwrap(),
        second_proxy.layout().unwrap()
    ));
}

#[test]
fn remote_reference_edges_aggregate_per_node() {
    let cluster = Cluster::new(3);
    let rt = cluster.node(0);
    let manager = build_owner_manager(&cluster);
    let owner_memory = Arc::clone(manager.memory());

    manager.send_manager(rt, AddressSpace(1));
    manager.send_manager(rt, AddressSpace(2));
    cluster.pump();
    let proxy1 = proxy_on(&cluster, 1, &manager);
    let proxy2 = proxy_on(&cluster, 2, &manager);

    // Two users on node 1; only the 0→1 edge reaches the owner.
    proxy1.add_resource_refs(cluster.node(1), 1);
    proxy1.add_resource_refs(cluster.node(1), 1);
    proxy2.add_resource_refs(cluster.node(2), 1);
    cluster.pump();
    assert_eq!(manager.ref_counts().resource(), 2);
    assert_eq!(owner_memory.stats().activations, 1);

    proxy1.remove_resource_refs(cluster.node(1), 2, Event::NONE);
    proxy2.remove_resource_refs(cluster.node(2), 1, Event::NONE);
    cluster.pump();

    // The owner saw exactly one activation edge and one deactivation edge,
    // and the final removal destroyed the manager and its allocation.
    assert_eq!(owner_memory.stats().activations, 1);
    assert_eq!(owner_memory.stats().deactivations, 1);
    assert_eq!(owner_memory.deletions().len(), 1);
    assert_eq!(rt.collectable_count(), 0);
}

#[test]
fn owner_destruction_revokes_proxies() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let manager = build_owner_manager(&cluster);
    manager.send_manager(rt, AddressSpace(1));
    cluster.pump();
    assert!(cluster.node(1).find_collectable(manager.did()).is_ok());

    // Locally acquire and release; the release destroys and broadcasts.
    manager.add_resource_refs(rt, 1);
    manager.remove_resource_refs(rt, 1, Event::NONE);
    cluster.pump();

    assert!(cluster.node(1).find_collectable(manager.did()).is_err());
    assert_eq!(cluster.node(0).collectable_count(), 0);
    assert_eq!(cluster.node(1).collectable_count(), 0);
}

#[test]
fn valid_edges_reach_the_owner() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let manager = build_owner_manager(&cluster);
    let owner_memory = Arc::clone(manager.memory());
    manager.send_manager(rt, AddressSpace(1));
    cluster.pump();
    let proxy = proxy_on(&cluster, 1, &manager);

    proxy.add_resource_refs(cluster.node(1), 1);
    proxy.add_valid_refs(cluster.node(1), 1);
    cluster.pump();
    assert_eq!(owner_memory.stats().validations, 1);
    assert_eq!(manager.ref_counts().valid(), 1);

    proxy.remove_valid_refs(cluster.node(1), 1);
    proxy.remove_resource_refs(cluster.node(1), 1, Event::NONE);
    cluster.pump();
    assert_eq!(owner_memory.stats().invalidations, 1);
    assert_eq!(rt.collectable_count(), 0);
}

#[test]
fn fold_reduction_manager_transfer() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let region = common::build_mirrored_region(&cluster);
    let memory = rt.find_memory_manager(TEST_MEMORY).unwrap();
    let constraints = LayoutConstraintSet::reduction(
        SpecializationKind::ReductionFold,
        SUM_I64,
        FieldId(1),
    );
    let mut builder = InstanceBuilder::new(vec![region], constraints, memory);
    let manager = builder.create_physical_instance(rt, rt.forest()).unwrap();

    manager.send_manager(rt, AddressSpace(1));
    cluster.pump();

    let proxy = proxy_on(&cluster, 1, &manager);
    assert!(proxy.is_reduction_manager());
    assert!(proxy.is_foldable());
    assert_eq!(proxy.reduction_op_id(), Some(SUM_I64));
    assert_eq!(proxy.logical_field(), Some(FieldId(1)));
    assert_eq!(proxy.use_event(), manager.use_event());
}

#[test]
fn list_reduction_manager_transfer_keeps_the_pointer_space() {
    let cluster = Cluster::new(2);
    let rt = cluster.node(0);
    let region = common::build_mirrored_region(&cluster);
    let memory = rt.find_memory_manager(TEST_MEMORY).unwrap();
    let constraints = LayoutConstraintSet::reduction(
        SpecializationKind::ReductionList,
        SUM_I64,
        FieldId(1),
    );
    let mut builder = InstanceBuilder::new(vec![region], constraints, memory);
    let manager = builder.create_physical_instance(rt, rt.forest()).unwrap();

    manager.send_manager(rt, AddressSpace(1));
    cluster.pump();

    let proxy = proxy_on(&cluster, 1, &manager);
    assert!(!proxy.is_foldable());
    assert_eq!(
        proxy.pointer_space(),
        Some(&Domain::Rect1(Rect::new([0], [15])))
    );
}

#[test]
fn duplicate_transfer_drops_the_tentative_proxy() {
    let cluster = Cluster::new(2);
    let rt: &Arc<Runtime> = cluster.node(0);
    let manager = build_owner_manager(&cluster);

    // Ship the same transfer twice by replaying the encoded message; the
    // second registration loses and the tentative proxy evaporates.
    manager.send_manager(rt, AddressSpace(1));
    cluster.pump();
    let payload = {
        let layout = manager.layout().unwrap();
        regolith::Message::InstanceManager {
            did: manager.did(),
            owner_space: manager.owner_space(),
            memory: TEST_MEMORY,
            instance: manager.instance(),
            instance_domain: manager.instance_domain().clone(),
            region: manager.region_node().handle(),
            use_event: manager.use_event(),
            flags: regolith::InstanceFlags::NONE,
            layout: layout.pack(AddressSpace(1)),
        }
        .encode()
    };
    cluster
        .node(1)
        .process_message(AddressSpace(0), &payload)
        .unwrap();

    assert_eq!(cluster.node(1).collectable_count(), 1);
    let proxy = proxy_on(&cluster, 1, &manager);
    assert!(!proxy.is_owner());
}
