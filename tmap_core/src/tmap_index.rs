//! The "INDEX" Engine - ordered B-tree of target records keyed by id.
//!
//! Minimum degree `t = 3`: every node holds at most `2t - 1 = 5` records and
//! every non-root node at least `t - 1 = 2`. Insertion splits full nodes on
//! the way down, so the tree only grows in height at the root.
//!
//! There is no physical delete. A target leaves service by becoming a
//! tombstone ([`TargetStatus::Destroyed`]) and its key stays indexed until the
//! whole index is torn down or an operator runs [`TrackIndex::compact`].
//!
//! Callers own the uniqueness of ids: [`TrackIndex::insert`] trusts that the
//! id is absent. [`TrackIndex::try_insert`] performs the search first.

use thiserror::Error;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::tmap_track::{TargetRecord, TargetStatus};

/// Minimum degree of the tree.
pub const MIN_DEGREE: usize = 3;

/// Most records a node may hold.
pub const MAX_KEYS: usize = 2 * MIN_DEGREE - 1;

/// Most children an internal node may hold.
pub const MAX_CHILDREN: usize = 2 * MIN_DEGREE;

// ============================================================================
// NODE
// ============================================================================

#[derive(Debug)]
struct Node {
    /// Ascending by id, at most MAX_KEYS
    records: Vec<TargetRecord>,
    /// Empty for leaves, `records.len() + 1` entries otherwise
    children: Vec<Node>,
    is_leaf: bool,
}

impl Node {
    fn new(is_leaf: bool) -> Self {
        Self {
            records: Vec::with_capacity(MAX_KEYS),
            children: if is_leaf {
                Vec::new()
            } else {
                Vec::with_capacity(MAX_CHILDREN)
            },
            is_leaf,
        }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.records.len() == MAX_KEYS
    }

    /// Position of the first key >= id. Linear: nodes hold at most five keys.
    #[inline]
    fn slot(&self, id: i32) -> usize {
        self.records
            .iter()
            .position(|r| r.id() >= id)
            .unwrap_or(self.records.len())
    }

    /// Number of keys <= id, i.e. where `id` would be inserted.
    #[inline]
    fn insert_slot(&self, id: i32) -> usize {
        self.records
            .iter()
            .rposition(|r| r.id() <= id)
            .map_or(0, |p| p + 1)
    }

    fn search(&self, id: i32) -> Option<&TargetRecord> {
        let i = self.slot(id);
        if let Some(record) = self.records.get(i) {
            if record.id() == id {
                return Some(record);
            }
        }
        if self.is_leaf {
            return None;
        }
        self.children[i].search(id)
    }

    fn search_mut(&mut self, id: i32) -> Option<&mut TargetRecord> {
        let i = self.slot(id);
        if i < self.records.len() && self.records[i].id() == id {
            return Some(&mut self.records[i]);
        }
        if self.is_leaf {
            return None;
        }
        self.children[i].search_mut(id)
    }

    /// Splits the full child at `i`: its median moves up into `self` and its
    /// upper half becomes a new sibling at `i + 1`.
    fn split_child(&mut self, i: usize) {
        let full = &mut self.children[i];
        let mut sibling = Node::new(full.is_leaf);

        sibling.records = full.records.split_off(MIN_DEGREE);
        if !full.is_leaf {
            sibling.children = full.children.split_off(MIN_DEGREE);
        }
        let median = full.records.remove(MIN_DEGREE - 1);

        self.records.insert(i, median);
        self.children.insert(i + 1, sibling);
    }

    fn insert_non_full(&mut self, record: TargetRecord) {
        let id = record.id();
        let mut i = self.insert_slot(id);

        if self.is_leaf {
            self.records.insert(i, record);
            return;
        }

        if self.children[i].is_full() {
            self.split_child(i);
            if self.records[i].id() < id {
                i += 1;
            }
        }
        self.children[i].insert_non_full(record);
    }

    fn for_each<'a, F: FnMut(&'a TargetRecord)>(&'a self, f: &mut F) {
        for (i, record) in self.records.iter().enumerate() {
            if !self.is_leaf {
                self.children[i].for_each(f);
            }
            f(record);
        }
        if let Some(last) = self.children.last() {
            last.for_each(f);
        }
    }

    fn for_each_mut<F: FnMut(&mut TargetRecord)>(&mut self, f: &mut F) {
        let Node {
            records, children, ..
        } = self;
        for (i, record) in records.iter_mut().enumerate() {
            if let Some(child) = children.get_mut(i) {
                child.for_each_mut(f);
            }
            f(record);
        }
        if let Some(last) = children.get_mut(records.len()) {
            last.for_each_mut(f);
        }
    }

    fn into_records(self, out: &mut Vec<TargetRecord>) {
        let mut children = self.children.into_iter();
        for record in self.records {
            if let Some(child) = children.next() {
                child.into_records(out);
            }
            out.push(record);
        }
        if let Some(last) = children.next() {
            last.into_records(out);
        }
    }

    /// Post-order release: children, then records, then the node itself.
    fn teardown(self, stats: &mut TeardownStats) {
        let Node {
            records, children, ..
        } = self;
        for child in children {
            child.teardown(stats);
        }
        for record in records {
            stats.samples += record.dispose();
            stats.records += 1;
        }
        stats.nodes += 1;
    }

    fn check(
        &self,
        lower: Option<i32>,
        upper: Option<i32>,
        depth: usize,
        is_root: bool,
        leaf_depth: &mut Option<usize>,
    ) -> Result<(), InvariantViolation> {
        let n = self.records.len();
        let first_id = self.records.first().map_or(0, |r| r.id());

        if n > MAX_KEYS {
            return Err(InvariantViolation::Overfull { first_id, keys: n });
        }
        if !is_root && n < MIN_DEGREE - 1 {
            return Err(InvariantViolation::Underfull { first_id, keys: n });
        }
        for pair in self.records.windows(2) {
            if pair[0].id() >= pair[1].id() {
                return Err(InvariantViolation::Unsorted {
                    left: pair[0].id(),
                    right: pair[1].id(),
                });
            }
        }
        for record in &self.records {
            let id = record.id();
            if lower.is_some_and(|lo| id <= lo) || upper.is_some_and(|hi| id >= hi) {
                return Err(InvariantViolation::OutOfRange { id });
            }
        }

        if self.is_leaf {
            if !self.children.is_empty() {
                return Err(InvariantViolation::ChildCount {
                    first_id,
                    keys: n,
                    children: self.children.len(),
                });
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(InvariantViolation::UnevenLeaves {
                        expected,
                        found: depth,
                    })
                }
                Some(_) => {}
            }
            return Ok(());
        }

        if self.children.len() != n + 1 {
            return Err(InvariantViolation::ChildCount {
                first_id,
                keys: n,
                children: self.children.len(),
            });
        }
        for (i, child) in self.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(self.records[i - 1].id()) };
            let hi = if i == n { upper } else { Some(self.records[i].id()) };
            child.check(lo, hi, depth + 1, false, leaf_depth)?;
        }
        Ok(())
    }
}

// ============================================================================
// TRACK INDEX
// ============================================================================

/// A broken B-tree invariant, as reported by [`TrackIndex::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("node starting at {first_id} holds {keys} keys (max {})", MAX_KEYS)]
    Overfull { first_id: i32, keys: usize },

    #[error("non-root node starting at {first_id} holds {keys} keys (min {})", MIN_DEGREE - 1)]
    Underfull { first_id: i32, keys: usize },

    #[error("keys {left} and {right} are not strictly ascending")]
    Unsorted { left: i32, right: i32 },

    #[error("key {id} lies outside its parent's separator range")]
    OutOfRange { id: i32 },

    #[error("node starting at {first_id} has {keys} keys but {children} children")]
    ChildCount {
        first_id: i32,
        keys: usize,
        children: usize,
    },

    #[error("leaf at depth {found}, expected every leaf at depth {expected}")]
    UnevenLeaves { expected: usize, found: usize },
}

/// What [`TrackIndex::teardown`] released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownStats {
    pub nodes: usize,
    pub records: usize,
    pub samples: usize,
}

/// Ordered index of every tracked target. Owns all nodes and records.
#[derive(Debug, Default)]
pub struct TrackIndex {
    root: Option<Node>,
    len: usize,
}

impl TrackIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed records, tombstones included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Levels from root to leaves; 0 for an empty index.
    pub fn height(&self) -> usize {
        let mut height = 0;
        let mut node = self.root.as_ref();
        while let Some(n) = node {
            height += 1;
            node = n.children.first();
        }
        height
    }

    /// Looks up a record by id.
    pub fn search(&self, id: i32) -> Option<&TargetRecord> {
        self.root.as_ref()?.search(id)
    }

    pub fn search_mut(&mut self, id: i32) -> Option<&mut TargetRecord> {
        self.root.as_mut()?.search_mut(id)
    }

    pub fn contains(&self, id: i32) -> bool {
        self.search(id).is_some()
    }

    /// Inserts a record.
    ///
    /// The caller must already have checked that `record.id()` is not indexed:
    /// a duplicate is accepted and silently breaks id uniqueness.
    pub fn insert(&mut self, record: TargetRecord) {
        let id = record.id();
        self.len += 1;

        match self.root.take() {
            None => {
                let mut leaf = Node::new(true);
                leaf.records.push(record);
                self.root = Some(leaf);
                debug!(target_id = id, "INSERT     | root created");
            }
            Some(old_root) if old_root.is_full() => {
                let mut new_root = Node::new(false);
                new_root.children.push(old_root);
                new_root.split_child(0);

                let i = usize::from(new_root.records[0].id() < id);
                new_root.children[i].insert_non_full(record);
                self.root = Some(new_root);
                info!(height = self.height(), "SPLIT      | B-tree height increased");
            }
            Some(mut root) => {
                root.insert_non_full(record);
                self.root = Some(root);
                debug!(target_id = id, "INSERT     | inserted");
            }
        }
    }

    /// Inserts after checking the id is not already present.
    pub fn try_insert(&mut self, record: TargetRecord) -> Result<(), EngineError> {
        if self.contains(record.id()) {
            return Err(EngineError::DuplicateId(record.id()));
        }
        self.insert(record);
        Ok(())
    }

    /// In-order iterator, ascending by id.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter { stack: Vec::new() };
        if let Some(root) = &self.root {
            iter.push_left_spine(root);
        }
        iter
    }

    /// In-order traversal with a callback (the rendering collaborator's view).
    pub fn for_each<'a, F: FnMut(&'a TargetRecord)>(&'a self, mut f: F) {
        if let Some(root) = &self.root {
            root.for_each(&mut f);
        }
    }

    /// In-order traversal with mutable access to every record.
    pub fn for_each_mut<F: FnMut(&mut TargetRecord)>(&mut self, mut f: F) {
        if let Some(root) = &mut self.root {
            root.for_each_mut(&mut f);
        }
    }

    /// Active records with `threat_level >= threshold`, ascending by id.
    pub fn threat_scan(&self, threshold: i32) -> Vec<&TargetRecord> {
        self.iter()
            .filter(|r| r.is_active() && r.threat_level() >= threshold)
            .collect()
    }

    /// Ids per level, root first. Mirrors the operator's structure dump.
    pub fn levels(&self) -> Vec<Vec<Vec<i32>>> {
        let mut levels = Vec::new();
        let mut frontier: Vec<&Node> = self.root.iter().collect();
        while !frontier.is_empty() {
            levels.push(
                frontier
                    .iter()
                    .map(|n| n.records.iter().map(TargetRecord::id).collect())
                    .collect(),
            );
            frontier = frontier.iter().flat_map(|&n| n.children.iter()).collect();
        }
        levels
    }

    /// Verifies ordering, fill, separator and equal-depth invariants.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        match &self.root {
            None => Ok(()),
            Some(root) => root.check(None, None, 0, true, &mut None),
        }
    }

    /// Consumes the index, yielding its records in ascending id order.
    pub fn into_records(self) -> Vec<TargetRecord> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(root) = self.root {
            root.into_records(&mut out);
        }
        out
    }

    /// Rebuilds the index without tombstones whose kill has already been
    /// broadcast. Returns the new index and how many records were dropped.
    ///
    /// Operator-triggered only; never runs as part of a tick.
    pub fn compact(self) -> (TrackIndex, usize) {
        let mut rebuilt = TrackIndex::new();
        let mut dropped = 0;
        for record in self.into_records() {
            if record.status() == TargetStatus::Destroyed && record.pending_tombstone().is_none() {
                dropped += 1;
                record.dispose();
            } else {
                rebuilt.insert(record);
            }
        }
        info!(dropped, remaining = rebuilt.len(), "COMPACT    | tombstones reclaimed");
        (rebuilt, dropped)
    }

    /// Releases every node, record and trajectory, post-order.
    pub fn teardown(self) -> TeardownStats {
        let mut stats = TeardownStats::default();
        if let Some(root) = self.root {
            root.teardown(&mut stats);
        }
        debug!(
            nodes = stats.nodes,
            records = stats.records,
            samples = stats.samples,
            "TEARDOWN   | index released"
        );
        stats
    }
}

/// In-order iterator over a [`TrackIndex`].
pub struct Iter<'a> {
    /// (node, index of the next record to yield)
    stack: Vec<(&'a Node, usize)>,
}

impl<'a> Iter<'a> {
    fn push_left_spine(&mut self, mut node: &'a Node) {
        loop {
            self.stack.push((node, 0));
            match node.children.first() {
                Some(child) if !node.is_leaf => node = child,
                _ => break,
            }
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a TargetRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, next) = self.stack.last_mut()?;
            let node: &'a Node = *node;
            if *next < node.records.len() {
                let record = &node.records[*next];
                *next += 1;
                if !node.is_leaf {
                    let child = &node.children[*next];
                    self.push_left_spine(child);
                }
                return Some(record);
            }
            self.stack.pop();
        }
    }
}

impl<'a> IntoIterator for &'a TrackIndex {
    type Item = &'a TargetRecord;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(ids: &[i32]) -> TrackIndex {
        let mut index = TrackIndex::new();
        for &id in ids {
            index.insert(TargetRecord::new(id, 5));
        }
        index
    }

    fn ids(index: &TrackIndex) -> Vec<i32> {
        index.iter().map(TargetRecord::id).collect()
    }

    #[test]
    fn test_empty_index() {
        let index = TrackIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.height(), 0);
        assert!(index.search(1).is_none());
        assert_eq!(index.iter().count(), 0);
        assert!(index.check_invariants().is_ok());
    }

    #[test]
    fn test_root_split_scenario() {
        let mut index = TrackIndex::new();
        for id in [10, 20, 5, 6, 12] {
            index.insert(TargetRecord::new(id, 5));
        }
        assert_eq!(index.height(), 1);

        index.insert(TargetRecord::new(30, 5));
        assert_eq!(index.height(), 2);
        assert_eq!(index.levels()[0], vec![vec![10]]);
        assert_eq!(index.levels()[1], vec![vec![5, 6], vec![12, 20, 30]]);

        index.insert(TargetRecord::new(7, 5));
        index.insert(TargetRecord::new(17, 5));
        assert_eq!(ids(&index), vec![5, 6, 7, 10, 12, 17, 20, 30]);
        assert_eq!(index.height(), 2);
        assert!(index.check_invariants().is_ok());
    }

    #[test]
    fn test_search_hits_and_misses() {
        let index = index_of(&[40, 10, 30, 20, 50, 60, 70, 80, 90, 100, 110]);
        for id in [10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110] {
            assert_eq!(index.search(id).map(TargetRecord::id), Some(id));
        }
        for id in [0, 15, 55, 111, -3] {
            assert!(index.search(id).is_none());
        }
    }

    #[test]
    fn test_search_mut_updates_in_place() {
        let mut index = index_of(&[1, 2, 3, 4, 5, 6, 7]);
        index.search_mut(6).unwrap().append_sample(1.0, 2.0, 0);
        assert_eq!(index.search(6).unwrap().sample_count(), 1);
        assert!(index.search_mut(99).is_none());
    }

    #[test]
    fn test_try_insert_rejects_duplicates() {
        let mut index = index_of(&[1, 2, 3]);
        let err = index.try_insert(TargetRecord::new(2, 1)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(2)));
        assert_eq!(index.len(), 3);
        assert!(index.try_insert(TargetRecord::new(4, 1)).is_ok());
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_ascending_and_descending_inserts_stay_balanced() {
        let ascending: Vec<i32> = (0..500).collect();
        let descending: Vec<i32> = (0..500).rev().collect();
        for order in [ascending, descending] {
            let index = index_of(&order);
            assert!(index.check_invariants().is_ok());
            assert_eq!(ids(&index), (0..500).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_height_stays_logarithmic_for_large_population() {
        let index = index_of(&(0..100_000).map(|i| (i * 7919) % 100_003).collect::<Vec<_>>());
        assert_eq!(index.len(), 100_000);
        assert!(index.check_invariants().is_ok());
        // Every non-root node has at least t children, so height <= log_t(n) + 1.
        assert!(index.height() <= 11, "height {}", index.height());
    }

    #[test]
    fn test_for_each_matches_iter() {
        let index = index_of(&[9, 3, 7, 1, 5, 8, 2, 6, 4]);
        let mut seen = Vec::new();
        index.for_each(|r| seen.push(r.id()));
        assert_eq!(seen, ids(&index));
    }

    #[test]
    fn test_for_each_mut_visits_every_record_once() {
        let mut index = index_of(&(1..=40).collect::<Vec<_>>());
        index.for_each_mut(|r| {
            r.append_sample(f64::from(r.id()), 0.0, 0);
        });
        assert!(index.iter().all(|r| r.sample_count() == 1));
    }

    #[test]
    fn test_threat_scan_skips_tombstones() {
        let mut index = TrackIndex::new();
        for (id, threat) in [(1, 9), (2, 3), (3, 8), (4, 10)] {
            index.insert(TargetRecord::new(id, threat));
        }
        index.search_mut(4).unwrap().intercept();

        let hits: Vec<i32> = index.threat_scan(8).iter().map(|r| r.id()).collect();
        assert_eq!(hits, vec![1, 3]);
    }

    #[test]
    fn test_compact_keeps_unannounced_tombstones() {
        let mut index = index_of(&(1..=20).collect::<Vec<_>>());
        for id in [2, 4, 6] {
            let record = index.search_mut(id).unwrap();
            record.append_sample(0.0, 0.0, 0);
            record.intercept();
        }
        // Kills of 2 and 4 have been broadcast; 6 has not.
        index.search_mut(2).unwrap().take_pending_tombstone();
        index.search_mut(4).unwrap().take_pending_tombstone();

        let (index, dropped) = index.compact();
        assert_eq!(dropped, 2);
        assert_eq!(index.len(), 18);
        assert!(!index.contains(2));
        assert!(!index.contains(4));
        assert!(index.contains(6));
        assert!(index.check_invariants().is_ok());
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut index = index_of(&(0..50).collect::<Vec<_>>());
        index.for_each_mut(|r| {
            for t in 0..3 {
                r.append_sample(0.0, 0.0, t);
            }
        });
        index.search_mut(10).unwrap().intercept();

        let node_count: usize = index.levels().iter().map(Vec::len).sum();
        let stats = index.teardown();
        assert_eq!(stats.records, 50);
        assert_eq!(stats.samples, 49 * 3);
        assert_eq!(stats.nodes, node_count);
    }

    #[test]
    fn test_invariant_checker_reports_duplicates() {
        // Duplicates are a caller error; the checker must notice them.
        let index = index_of(&[1, 1]);
        assert!(matches!(
            index.check_invariants(),
            Err(InvariantViolation::Unsorted { left: 1, right: 1 })
        ));
    }
}
