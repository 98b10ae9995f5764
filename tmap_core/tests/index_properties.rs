//! Property tests for the track index and the data file codec.

use std::collections::BTreeSet;

use proptest::prelude::*;
use tmap_core::tmap_persist;
use tmap_core::{TargetRecord, TargetStatus, TrackIndex};

fn build(ids: &[i32]) -> TrackIndex {
    let mut index = TrackIndex::new();
    for &id in ids {
        index.insert(TargetRecord::new(id, id.rem_euclid(10) + 1));
    }
    index
}

fn unique_ids() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::hash_set(-10_000i32..10_000, 0..400)
        .prop_map(|set| set.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
}

/// One target: id, threat, killed?, fixes.
fn arb_target() -> impl Strategy<Value = (i32, i32, bool, Vec<(f64, f64, i32)>)> {
    (
        0i32..500,
        1i32..=10,
        any::<bool>(),
        prop::collection::vec((-90.0f64..90.0, -180.0f64..180.0, 0i32..10_000), 0..12),
    )
}

proptest! {
    #[test]
    fn every_inserted_id_is_found(ids in unique_ids(), probe in -10_000i32..10_000) {
        let index = build(&ids);
        for &id in &ids {
            prop_assert_eq!(index.search(id).map(|r| r.id()), Some(id));
        }
        prop_assert_eq!(index.contains(probe), ids.contains(&probe));
        prop_assert_eq!(index.len(), ids.len());
    }

    #[test]
    fn traversal_is_strictly_ascending(ids in unique_ids()) {
        let index = build(&ids);
        let walked: Vec<i32> = index.iter().map(|r| r.id()).collect();
        let expected: Vec<i32> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        prop_assert_eq!(walked, expected);
    }

    #[test]
    fn structure_invariants_hold_after_every_insert(ids in unique_ids()) {
        let mut index = TrackIndex::new();
        for &id in &ids {
            index.insert(TargetRecord::new(id, 5));
            prop_assert!(index.check_invariants().is_ok());
        }
    }

    #[test]
    fn teardown_accounts_for_everything(ids in unique_ids()) {
        let mut index = build(&ids);
        let mut samples = 0;
        index.for_each_mut(|r| {
            for t in 0..(r.id().rem_euclid(4)) {
                r.append_sample(0.0, 0.0, t);
                samples += 1;
            }
        });
        let stats = index.teardown();
        prop_assert_eq!(stats.records, ids.len());
        prop_assert_eq!(stats.samples, samples);
    }

    #[test]
    fn data_file_round_trip(targets in prop::collection::vec(arb_target(), 0..60)) {
        let mut index = TrackIndex::new();
        for (id, threat, killed, fixes) in targets {
            if index.contains(id) {
                continue;
            }
            let mut r = TargetRecord::new(id, threat);
            for (lat, lon, t) in fixes {
                r.append_sample(lat, lon, t);
            }
            if killed {
                r.intercept();
            }
            index.insert(r);
        }

        let mut bytes = Vec::new();
        let written = tmap_persist::save(&index, &mut bytes).unwrap();
        let (restored, summary) = tmap_persist::load(&mut bytes.as_slice()).unwrap();

        prop_assert_eq!(written, index.len());
        prop_assert_eq!(summary.records, index.len());
        prop_assert!(!summary.truncated);
        prop_assert!(restored.check_invariants().is_ok());
        for (a, b) in index.iter().zip(restored.iter()) {
            prop_assert_eq!(a.id(), b.id());
            prop_assert_eq!(a.threat_level(), b.threat_level());
            prop_assert_eq!(a.status(), b.status());
            prop_assert_eq!(a.sample_count(), b.sample_count());
            prop_assert!(a.trajectory().iter().eq(b.trajectory().iter()));
            if b.status() == TargetStatus::Destroyed {
                prop_assert!(b.trajectory().is_empty());
            }
        }
    }

    #[test]
    fn truncated_file_restores_a_prefix(
        ids in prop::collection::btree_set(0i32..1000, 1..40),
        cut_fraction in 0.0f64..1.0,
    ) {
        let mut index = TrackIndex::new();
        for &id in &ids {
            let mut r = TargetRecord::new(id, 3);
            for t in 0..(id % 5) {
                r.append_sample(37.5, 127.0, t);
            }
            index.insert(r);
        }
        let mut bytes = Vec::new();
        tmap_persist::save(&index, &mut bytes).unwrap();
        let cut = (bytes.len() as f64 * cut_fraction) as usize;

        let (restored, _) = tmap_persist::load(&mut &bytes[..cut]).unwrap();
        let all: Vec<i32> = ids.into_iter().collect();
        let got: Vec<i32> = restored.iter().map(|r| r.id()).collect();
        prop_assert_eq!(&got[..], &all[..got.len()]);
    }
}
