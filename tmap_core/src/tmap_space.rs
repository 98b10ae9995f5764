//! The "SPACE" Engine - per-tick quadtree over Active targets.
//!
//! The quadtree is rebuilt from scratch every tick from the latest fix of
//! each Active record and dropped at the end of the tick. Positions change
//! every tick and the population is small, so a rebuild costs no more than
//! incremental maintenance and never leaves stale entries behind.
//!
//! Coordinates: `x = longitude`, `y = latitude`. Cell containment is
//! half-open (`min <= p < max`); children are tested NW, NE, SW, SE and a
//! point goes to the first child that contains it.
//!
//! ```text
//!          max.y ┌─────────┬─────────┐
//!                │   NW    │   NE    │
//!          mid.y ├─────────┼─────────┤
//!                │   SW    │   SE    │
//!          min.y └─────────┴─────────┘
//!              min.x     mid.x     max.x
//! ```
//!
//! The index borrows the records it points at, so it cannot outlive the
//! [`TrackIndex`] borrow it was built from.

use geo::{coord, Coord, Intersects, Rect};
use tracing::{debug, warn};

use crate::tmap_index::TrackIndex;
use crate::tmap_track::TargetRecord;

/// Direct points a cell holds before it subdivides.
pub const CAPACITY: usize = 4;

/// Cells at this depth stop subdividing and keep accepting points, which
/// bounds recursion when many targets share one position.
pub const MAX_DEPTH: usize = 16;

/// A record reference pinned at the position it was indexed with.
#[derive(Debug, Clone, Copy)]
pub struct QuadPoint<'a> {
    pub position: Coord<f64>,
    pub record: &'a TargetRecord,
}

/// Half-open containment test used for every cell.
#[inline]
fn cell_contains(boundary: &Rect<f64>, p: Coord<f64>) -> bool {
    let (min, max) = (boundary.min(), boundary.max());
    p.x >= min.x && p.x < max.x && p.y >= min.y && p.y < max.y
}

/// Closed containment test used for range queries.
#[inline]
fn area_contains(area: &Rect<f64>, p: Coord<f64>) -> bool {
    let (min, max) = (area.min(), area.max());
    p.x >= min.x && p.x <= max.x && p.y >= min.y && p.y <= max.y
}

/// Converts a record's latest fix into quadtree coordinates.
pub fn record_coord(record: &TargetRecord) -> Option<Coord<f64>> {
    record.position().map(|p| coord! { x: p.lon, y: p.lat })
}

// ============================================================================
// QUAD CELL
// ============================================================================

/// One node of the quadtree.
#[derive(Debug)]
pub struct QuadCell<'a> {
    boundary: Rect<f64>,
    points: Vec<QuadPoint<'a>>,
    /// NW, NE, SW, SE once divided
    children: Option<Box<[QuadCell<'a>; 4]>>,
    depth: usize,
}

impl<'a> QuadCell<'a> {
    fn new(boundary: Rect<f64>, depth: usize) -> Self {
        Self {
            boundary,
            points: Vec::with_capacity(CAPACITY),
            children: None,
            depth,
        }
    }

    pub fn boundary(&self) -> &Rect<f64> {
        &self.boundary
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_divided(&self) -> bool {
        self.children.is_some()
    }

    /// Points stored directly in this cell (always 0 once divided).
    pub fn direct_count(&self) -> usize {
        self.points.len()
    }

    /// Children in NW, NE, SW, SE order.
    pub fn children(&self) -> Option<&[QuadCell<'a>; 4]> {
        self.children.as_deref()
    }

    /// Inserts a point. Returns `false` if it lies outside this cell.
    pub fn insert(&mut self, point: QuadPoint<'a>) -> bool {
        if !cell_contains(&self.boundary, point.position) {
            return false;
        }

        if self.children.is_none() {
            if self.points.len() < CAPACITY || self.depth >= MAX_DEPTH {
                self.points.push(point);
                return true;
            }
            self.subdivide();
            for displaced in std::mem::take(&mut self.points) {
                self.insert_into_children(displaced);
            }
        }

        self.insert_into_children(point)
    }

    fn insert_into_children(&mut self, point: QuadPoint<'a>) -> bool {
        match self.children.as_deref_mut() {
            Some(children) => children.iter_mut().any(|child| child.insert(point)),
            None => false,
        }
    }

    /// Splits the boundary into four equal quadrants. Children share the
    /// parent's exact edge coordinates, so together they cover it exactly.
    fn subdivide(&mut self) {
        let (min, max) = (self.boundary.min(), self.boundary.max());
        let mid = coord! {
            x: min.x + (max.x - min.x) / 2.0,
            y: min.y + (max.y - min.y) / 2.0,
        };
        let depth = self.depth + 1;

        self.children = Some(Box::new([
            QuadCell::new(Rect::new(coord! { x: min.x, y: mid.y }, coord! { x: mid.x, y: max.y }), depth),
            QuadCell::new(Rect::new(mid, max), depth),
            QuadCell::new(Rect::new(min, mid), depth),
            QuadCell::new(Rect::new(coord! { x: mid.x, y: min.y }, coord! { x: max.x, y: mid.y }), depth),
        ]));
    }

    fn query_point(&self, p: Coord<f64>, out: &mut Vec<&'a TargetRecord>) {
        if !cell_contains(&self.boundary, p) {
            return;
        }
        match self.children.as_deref() {
            Some(children) => {
                if let Some(child) = children.iter().find(|c| cell_contains(&c.boundary, p)) {
                    child.query_point(p, out);
                }
            }
            None => out.extend(
                self.points
                    .iter()
                    .filter(|q| q.position == p)
                    .map(|q| q.record),
            ),
        }
    }

    fn query_range(&self, area: &Rect<f64>, out: &mut Vec<&'a TargetRecord>) {
        if !self.boundary.intersects(area) {
            return;
        }
        out.extend(
            self.points
                .iter()
                .filter(|q| area_contains(area, q.position))
                .map(|q| q.record),
        );
        if let Some(children) = self.children.as_deref() {
            for child in children {
                child.query_range(area, out);
            }
        }
    }

    fn visit<F: FnMut(&Rect<f64>, usize)>(&self, f: &mut F) {
        f(&self.boundary, self.depth);
        if let Some(children) = self.children.as_deref() {
            for child in children {
                child.visit(f);
            }
        }
    }

    fn max_depth(&self) -> usize {
        match self.children.as_deref() {
            Some(children) => children.iter().map(QuadCell::max_depth).max().unwrap_or(self.depth),
            None => self.depth,
        }
    }

    /// Children first, then the cell itself. Returns cells released.
    fn teardown(self) -> usize {
        let released_children = match self.children {
            Some(children) => {
                let [nw, ne, sw, se] = *children;
                nw.teardown() + ne.teardown() + sw.teardown() + se.teardown()
            }
            None => 0,
        };
        released_children + 1
    }
}

// ============================================================================
// SPATIAL INDEX
// ============================================================================

/// Quadtree rooted at a fixed operating area, valid for one tick.
#[derive(Debug)]
pub struct SpatialIndex<'a> {
    root: QuadCell<'a>,
    len: usize,
    rejected: usize,
}

impl<'a> SpatialIndex<'a> {
    /// Creates an empty index covering `boundary`.
    pub fn new(boundary: Rect<f64>) -> Self {
        Self {
            root: QuadCell::new(boundary, 0),
            len: 0,
            rejected: 0,
        }
    }

    /// Builds the tick's index from every Active record that has a fix.
    /// Destroyed records are excluded.
    pub fn build(boundary: Rect<f64>, index: &'a TrackIndex) -> Self {
        let mut spatial = Self::new(boundary);
        for record in index.iter().filter(|r| r.is_active()) {
            if let Some(position) = record_coord(record) {
                if !spatial.insert(position, record) {
                    warn!(
                        target_id = record.id(),
                        x = position.x,
                        y = position.y,
                        "SPATIAL    | fix outside operating area, not indexed"
                    );
                }
            }
        }
        debug!(
            indexed = spatial.len,
            rejected = spatial.rejected,
            depth = spatial.depth(),
            "SPATIAL    | quadtree rebuilt"
        );
        spatial
    }

    /// Inserts a record at `position`. Returns `false` if the point lies
    /// outside the root boundary.
    pub fn insert(&mut self, position: Coord<f64>, record: &'a TargetRecord) -> bool {
        let stored = self.root.insert(QuadPoint { position, record });
        if stored {
            self.len += 1;
        } else {
            self.rejected += 1;
        }
        stored
    }

    pub fn root(&self) -> &QuadCell<'a> {
        &self.root
    }

    pub fn boundary(&self) -> &Rect<f64> {
        &self.root.boundary
    }

    /// Points stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Points refused because they fell outside the root boundary.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Deepest cell depth (root is 0).
    pub fn depth(&self) -> usize {
        self.root.max_depth()
    }

    /// Descends by boundary containment to the leaf covering `position` and
    /// returns the records stored exactly there.
    pub fn query_point(&self, position: Coord<f64>) -> Vec<&'a TargetRecord> {
        let mut out = Vec::new();
        self.root.query_point(position, &mut out);
        out
    }

    /// Every record whose indexed position lies inside `area` (edges included).
    pub fn query_range(&self, area: &Rect<f64>) -> Vec<&'a TargetRecord> {
        let mut out = Vec::new();
        self.root.query_range(area, &mut out);
        out
    }

    /// Visits every cell boundary with its depth, pre-order. Used for the
    /// debug overlay.
    pub fn visit_cells<F: FnMut(&Rect<f64>, usize)>(&self, mut f: F) {
        self.root.visit(&mut f);
    }

    /// Releases every cell, children before parents. Returns cells released.
    pub fn teardown(self) -> usize {
        self.root.teardown()
    }
}
