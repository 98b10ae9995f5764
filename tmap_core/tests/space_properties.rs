//! Property tests for the per-tick quadtree.

use geo::{coord, Coord, Rect};
use proptest::prelude::*;
use tmap_core::{SpatialIndex, TargetRecord};

fn area() -> Rect<f64> {
    Rect::new(coord! { x: 126.88, y: 37.40 }, coord! { x: 127.12, y: 37.60 })
}

/// Points inside the half-open operating area, with some forced onto a
/// small lattice so coincident points and cell edges come up often.
fn in_bounds_points() -> impl Strategy<Value = Vec<Coord<f64>>> {
    let free = (126.88f64..127.12, 37.40f64..37.60).prop_map(|(x, y)| coord! { x: x, y: y });
    let lattice = (0u32..16, 0u32..16).prop_map(|(i, j)| coord! {
        x: 126.88 + 0.015 * f64::from(i),
        y: 37.40 + 0.0125 * f64::from(j),
    });
    prop::collection::vec(prop_oneof![3 => free, 1 => lattice], 0..300)
}

fn records(count: usize) -> Vec<TargetRecord> {
    (0..count)
        .map(|i| TargetRecord::new(i as i32, 5))
        .collect()
}

proptest! {
    #[test]
    fn every_inserted_point_is_reachable(points in in_bounds_points()) {
        let targets = records(points.len());
        let mut spatial = SpatialIndex::new(area());
        for (position, record) in points.iter().zip(&targets) {
            prop_assert!(spatial.insert(*position, record));
        }
        prop_assert_eq!(spatial.len(), points.len());
        prop_assert_eq!(spatial.rejected(), 0);

        for (position, record) in points.iter().zip(&targets) {
            let found = spatial.query_point(*position);
            prop_assert!(
                found.iter().any(|r| r.id() == record.id()),
                "target {} at {:?} not reachable",
                record.id(),
                position
            );
        }

        let mut everything: Vec<i32> = spatial.query_range(&area()).iter().map(|r| r.id()).collect();
        everything.sort_unstable();
        prop_assert_eq!(everything, (0..points.len() as i32).collect::<Vec<_>>());
    }

    #[test]
    fn points_outside_the_area_are_rejected(
        x in prop_oneof![120.0f64..126.88, 127.12f64..130.0],
        y in 37.40f64..37.60,
    ) {
        let target = TargetRecord::new(1, 5);
        let mut spatial = SpatialIndex::new(area());
        let point = coord! { x: x, y: y };
        prop_assert!(!spatial.insert(point, &target));
        prop_assert!(spatial.is_empty());
        prop_assert_eq!(spatial.rejected(), 1);
    }
}
