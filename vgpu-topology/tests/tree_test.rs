// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use vgpu_topology::node::LinkType;
use vgpu_topology::probe::{CardSample, FakeProbe, UnavailableProbe};
use vgpu_topology::tree::GpuTree;

const GIB: u64 = 1 << 30;

fn uniform_tree(count: usize) -> GpuTree {
    let probe = Arc::new(FakeProbe::uniform(count, 16 * GIB, LinkType::HostBridge));
    GpuTree::init(probe, None, Duration::from_secs(1)).unwrap()
}

#[test]
fn probe_build_exposes_all_leaves() {
    let tree = uniform_tree(4);
    assert_eq!(tree.total(), 4);
    assert_eq!(tree.available(tree.root()), 4);
    assert_eq!(tree.max_leaf_memory(), 16 * GIB);
    for (id, &leaf) in tree.leaves().iter().enumerate() {
        assert_eq!(tree.node(leaf).meta.id, id);
        assert_eq!(tree.node(leaf).allocatable.cores, 100);
        assert_eq!(tree.node(leaf).allocatable.memory, (16 * GIB) as i64);
    }
    tree.check_invariants().unwrap();
}

#[test]
fn matrix_fallback_builds_same_shape() {
    let input = "\
      GPU0 GPU1 GPU2 GPU3\n\
GPU0   X   PIX  PHB  PHB\n\
GPU1  PIX   X   PHB  PHB\n\
GPU2  PHB  PHB   X   PIX\n\
GPU3  PHB  PHB  PIX   X\n";
    let tree = GpuTree::init(
        Arc::new(UnavailableProbe),
        Some(input),
        Duration::from_secs(1),
    )
    .unwrap();

    assert!(!tree.real_mode());
    assert_eq!(tree.total(), 4);
    assert_eq!(tree.available(tree.root()), 4);
    // Leaf 0's parent is the PIX pair {0, 1}, not the PHB group.
    let leaf0 = tree.leaves()[0];
    let parent = tree.node(leaf0).parent.unwrap();
    assert_eq!(tree.node(parent).link, LinkType::Single);
    assert_eq!(tree.node(parent).mask, 0b11);
    tree.check_invariants().unwrap();
}

#[test]
fn single_card_topology_wires_leaf_to_root() {
    let probe = Arc::new(FakeProbe::uniform(1, 16 * GIB, LinkType::HostBridge));
    let tree = GpuTree::init(probe, None, Duration::from_secs(1)).unwrap();
    assert_eq!(tree.total(), 1);
    assert_eq!(tree.available(tree.root()), 1);
    tree.check_invariants().unwrap();
}

#[test]
fn bad_matrix_is_rejected() {
    let result = GpuTree::init(
        Arc::new(UnavailableProbe),
        Some(""),
        Duration::from_secs(1),
    );
    assert!(result.is_err());
}

#[test]
fn fractional_occupation_removes_leaf_from_free_set() {
    let mut tree = uniform_tree(4);
    tree.mark_occupied("/dev/nvidia0", 30, (4000i64 * 1_048_576))
        .unwrap();

    let leaf0 = tree.leaves()[0];
    assert_eq!(tree.node(leaf0).allocatable.cores, 70);
    // Any tenant takes the card out of the whole-card free set.
    assert_eq!(tree.available(tree.root()), 3);
    assert_eq!(tree.available(leaf0), 0);
    tree.check_invariants().unwrap();
}

#[test]
fn occupy_then_free_restores_state_exactly() {
    let mut tree = uniform_tree(4);
    let before: Vec<_> = tree
        .leaves()
        .iter()
        .map(|&leaf| tree.node(leaf).allocatable)
        .collect();

    tree.mark_occupied("/dev/nvidia2", 45, (2 * GIB) as i64).unwrap();
    tree.mark_free("/dev/nvidia2", 45, (2 * GIB) as i64).unwrap();

    let after: Vec<_> = tree
        .leaves()
        .iter()
        .map(|&leaf| tree.node(leaf).allocatable)
        .collect();
    assert_eq!(before, after);
    assert_eq!(tree.available(tree.root()), 4);
    tree.check_invariants().unwrap();
}

#[test]
fn overdraw_clamps_to_zero() {
    let mut tree = uniform_tree(2);
    tree.mark_occupied("/dev/nvidia1", 60, (20 * GIB) as i64).unwrap();
    let leaf1 = tree.leaves()[1];
    assert_eq!(tree.node(leaf1).allocatable.cores, 40);
    assert_eq!(tree.node(leaf1).allocatable.memory, 0);
    tree.check_invariants().unwrap();
}

#[test]
fn unknown_device_is_an_error() {
    let mut tree = uniform_tree(2);
    assert!(tree.mark_occupied("/dev/nvidia9", 100, 0).is_err());
    assert!(tree.mark_free("/dev/nvidia9", 100, 0).is_err());
}

#[test]
fn exclusive_release_resets_and_restores_mask() {
    let probe = Arc::new(FakeProbe::uniform(4, 16 * GIB, LinkType::HostBridge));
    let mut tree = GpuTree::init(probe.clone(), None, Duration::from_secs(1)).unwrap();

    tree.mark_occupied("/dev/nvidia2", 100, (16 * GIB) as i64).unwrap();
    assert_eq!(tree.available(tree.root()), 3);
    let leaf2 = tree.leaves()[2];
    assert_eq!(tree.node(leaf2).allocatable.cores, 0);

    // Simulate the tenant still holding the device at release time.
    probe.set_sample(
        2,
        CardSample {
            pids: vec![4242],
            used_memory: GIB,
            utilization: 50,
        },
    );
    tree.update();
    tree.mark_free("/dev/nvidia2", 100, (16 * GIB) as i64).unwrap();
    assert!(tree.node(leaf2).pending_reset);
    assert_eq!(tree.available(tree.root()), 3);
    tree.check_invariants().unwrap();

    // Once the processes are gone the next update resets the card and
    // its bit reappears in every ancestor.
    probe.set_sample(2, CardSample::default());
    tree.update();
    assert!(!tree.node(leaf2).pending_reset);
    assert_eq!(tree.available(tree.root()), 4);
    assert_eq!(probe.reset_count(2), 1);
    tree.check_invariants().unwrap();
}

#[test]
fn failed_reset_is_retried_on_update() {
    let probe = Arc::new(FakeProbe::uniform(2, 16 * GIB, LinkType::HostBridge));
    let mut tree = GpuTree::init(probe.clone(), None, Duration::from_secs(1)).unwrap();

    probe.fail_resets(0, 1);
    tree.mark_occupied("/dev/nvidia0", 100, (16 * GIB) as i64).unwrap();
    tree.mark_free("/dev/nvidia0", 100, (16 * GIB) as i64).unwrap();
    let leaf0 = tree.leaves()[0];
    assert!(tree.node(leaf0).pending_reset);
    assert_eq!(tree.available(tree.root()), 1);

    tree.update();
    assert!(!tree.node(leaf0).pending_reset);
    assert_eq!(tree.available(tree.root()), 2);
    tree.check_invariants().unwrap();
}

#[test]
fn update_aggregates_ancestor_totals() {
    let probe = Arc::new(FakeProbe::uniform(2, 16 * GIB, LinkType::Single));
    let mut tree = GpuTree::init(probe.clone(), None, Duration::from_secs(1)).unwrap();

    probe.set_sample(
        0,
        CardSample {
            pids: vec![10, 11],
            used_memory: 2 * GIB,
            utilization: 30,
        },
    );
    probe.set_sample(
        1,
        CardSample {
            pids: vec![12],
            used_memory: GIB,
            utilization: 10,
        },
    );
    tree.update();

    let root = tree.node(tree.root());
    assert_eq!(root.meta.pids.len(), 3);
    assert_eq!(root.meta.used_memory, 3 * GIB);
    assert_eq!(root.meta.total_memory, 32 * GIB);
}

#[test]
fn restore_reservation_replays_checkpoint_state() {
    let mut tree = uniform_tree(4);
    tree.restore_reservation(
        &["/dev/nvidia0".to_string()],
        40,
        (4000i64 * 1_048_576),
    )
    .unwrap();
    tree.restore_reservation(&["/dev/nvidia1".to_string()], 100, (16 * GIB) as i64)
        .unwrap();

    assert_eq!(tree.available(tree.root()), 2);
    assert_eq!(tree.node(tree.leaves()[0]).allocatable.cores, 60);
    assert_eq!(tree.node(tree.leaves()[1]).allocatable.cores, 0);
    tree.check_invariants().unwrap();

    // A fractional reservation spanning several devices is corrupt.
    assert!(tree
        .restore_reservation(
            &["/dev/nvidia2".to_string(), "/dev/nvidia3".to_string()],
            50,
            GIB as i64,
        )
        .is_err());
}
