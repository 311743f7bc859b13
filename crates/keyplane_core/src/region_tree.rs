//! Ordered range index over regions, keyed by start key.
//!
//! The tree never holds overlapping ranges: inserting a region first evicts
//! every live entry its range intersects. Aggregate size/write-rate totals
//! are maintained incrementally so callers can read them without a scan.

use std::collections::BTreeMap;

use rand::Rng;

use crate::region::{key_in_range, region_involved, Key, KeyRange, RegionInfo};

/// Index of live regions with `O(log n)` point and range queries.
#[derive(Debug, Default)]
pub struct RegionTree {
    tree: BTreeMap<Key, RegionInfo>,
    total_size: u64,
    total_write_bytes_rate: f64,
    total_write_keys_rate: f64,
}

impl RegionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Sum of `approximate_size` over all live entries.
    pub fn total_size(&self) -> u64 {
        if self.tree.is_empty() {
            return 0;
        }
        self.total_size
    }

    /// Sum of write rates over all live entries, `(bytes/s, keys/s)`.
    pub fn total_write_rate(&self) -> (f64, f64) {
        if self.tree.is_empty() {
            return (0.0, 0.0);
        }
        (self.total_write_bytes_rate, self.total_write_keys_rate)
    }

    /// The entry whose range contains `key`, if any.
    pub fn search(&self, key: &[u8]) -> Option<&RegionInfo> {
        self.find(key)
    }

    /// The region immediately before the one containing `key`, but only when
    /// the two are actually adjacent (no gap between them).
    pub fn search_prev(&self, key: &[u8]) -> Option<&RegionInfo> {
        let current = self.find(key)?;
        let (prev, _) = self.adjacent_regions(current);
        let prev = prev?;
        if prev.end_key == current.start_key {
            Some(prev)
        } else {
            None
        }
    }

    /// All live entries whose range intersects `region`'s range.
    pub fn get_overlaps(&self, region: &RegionInfo) -> Vec<&RegionInfo> {
        // The entry containing the start key (when it exists) starts before
        // `region` but may still reach into it, so scanning begins there
        // rather than at `region.start_key` itself.
        let scan_from = match self.find(&region.start_key) {
            Some(hit) => hit.start_key.clone(),
            None => region.start_key.clone(),
        };
        let mut overlaps = Vec::new();
        for item in self.tree.range(scan_from..).map(|(_, r)| r) {
            if !region.end_key.is_empty() && item.start_key >= region.end_key {
                break;
            }
            overlaps.push(item);
        }
        overlaps
    }

    /// Insert `region`, evicting every overlapped entry. Returns the evicted
    /// regions. Aggregates stay consistent with the live set.
    pub fn update(&mut self, region: RegionInfo) -> Vec<RegionInfo> {
        let stale: Vec<Key> = self
            .get_overlaps(&region)
            .into_iter()
            .map(|r| r.start_key.clone())
            .collect();

        let mut displaced = Vec::with_capacity(stale.len());
        for start in stale {
            if let Some(old) = self.tree.remove(&start) {
                tracing::debug!(
                    region_id = old.id,
                    update_region_id = region.id,
                    "evicting overlapped region"
                );
                self.subtract_stat(&old);
                displaced.push(old);
            }
        }

        self.add_stat(&region);
        self.tree.insert(region.start_key.clone(), region);
        displaced
    }

    /// Fix up aggregates when an entry was replaced in place by a newer
    /// snapshot of the same range.
    pub fn update_stat(&mut self, origin: &RegionInfo, region: &RegionInfo) {
        self.add_stat(region);
        self.subtract_stat(origin);
    }

    /// Remove `region` if the entry covering its start key carries the same
    /// id. A mismatched id means the slot was already taken over.
    pub fn remove(&mut self, region: &RegionInfo) {
        let start = match self.find(&region.start_key) {
            Some(hit) if hit.id == region.id => hit.start_key.clone(),
            _ => return,
        };
        if let Some(old) = self.tree.remove(&start) {
            self.subtract_stat(&old);
        }
    }

    /// Visit regions in key order starting from the one containing
    /// `start_key` (or the next one if no region contains it) until the
    /// visitor returns false.
    pub fn scan_range(&self, start_key: &[u8], mut visitor: impl FnMut(&RegionInfo) -> bool) {
        let scan_from = match self.find(start_key) {
            Some(hit) => hit.start_key.clone(),
            None => start_key.to_vec(),
        };
        for region in self.tree.range(scan_from..).map(|(_, r)| r) {
            if !visitor(region) {
                break;
            }
        }
    }

    /// Snapshot of every live entry in key order.
    pub fn scan_all(&self) -> Vec<RegionInfo> {
        self.tree.values().cloned().collect()
    }

    /// Neighbors of `region` by start key: `(previous, next)`.
    pub fn adjacent_regions(&self, region: &RegionInfo) -> (Option<&RegionInfo>, Option<&RegionInfo>) {
        let prev = self
            .tree
            .range(..region.start_key.clone())
            .next_back()
            .map(|(_, r)| r);
        let next = self
            .tree
            .range(region.start_key.clone()..)
            .find(|(start, _)| *start != &region.start_key)
            .map(|(_, r)| r);
        (prev, next)
    }

    /// Uniformly sample one region fully contained in one of `ranges`.
    ///
    /// Ranges are tried in random order; inside a range the pick is uniform
    /// over the index window the range spans. Empty `ranges` means the whole
    /// keyspace.
    pub fn random_region(&self, ranges: &[KeyRange]) -> Option<&RegionInfo> {
        if self.tree.is_empty() {
            return None;
        }
        let everything = [KeyRange::everything()];
        let ranges: &[KeyRange] = if ranges.is_empty() { &everything } else { ranges };

        let mut rng = rand::thread_rng();
        let mut order: Vec<usize> = (0..ranges.len()).collect();
        for i in (1..order.len()).rev() {
            order.swap(i, rng.gen_range(0..=i));
        }

        for i in order {
            let KeyRange { start_key, end_key } = &ranges[i];
            let (start_index, end_index) = self.index_window(start_key, end_key);
            if end_index <= start_index {
                if !end_key.is_empty() && start_key > end_key {
                    tracing::error!(
                        start_key = ?String::from_utf8_lossy(start_key),
                        end_key = ?String::from_utf8_lossy(end_key),
                        "random region range has inverted keys"
                    );
                }
                continue;
            }
            let index = rng.gen_range(start_index..end_index);
            let region = self.tree.values().nth(index)?;
            if region_involved(region, start_key, end_key) {
                return Some(region);
            }
        }
        None
    }

    /// Up to `n` samples drawn independently; duplicates are permitted.
    pub fn random_regions(&self, n: usize, ranges: &[KeyRange]) -> Vec<RegionInfo> {
        if self.tree.is_empty() {
            return Vec::new();
        }
        let mut regions = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(region) = self.random_region(ranges) {
                regions.push(region.clone());
            }
        }
        regions
    }

    /// The entry at position `index` in key order.
    pub fn get_at(&self, index: usize) -> Option<&RegionInfo> {
        self.tree.values().nth(index)
    }

    /// The entry whose start key equals `key` (if any) together with the
    /// rank `key` occupies among all start keys.
    pub fn get_with_index(&self, key: &[u8]) -> (Option<&RegionInfo>, usize) {
        let rank = self.tree.range(..key.to_vec()).count();
        (self.tree.get(key), rank)
    }

    /// Index window `[start, end)` spanned by a key range. The window opens
    /// one slot early when the predecessor entry still contains `start_key`.
    fn index_window(&self, start_key: &[u8], end_key: &[u8]) -> (usize, usize) {
        let (exact, mut start_index) = {
            let (hit, rank) = self.get_with_index(start_key);
            (hit.is_some(), rank)
        };
        if start_index > 0
            && !exact
            && self
                .get_at(start_index - 1)
                .is_some_and(|prev| prev.contains_key(start_key))
        {
            start_index -= 1;
        }
        let end_index = if end_key.is_empty() {
            self.tree.len()
        } else {
            self.get_with_index(end_key).1
        };
        (start_index, end_index)
    }

    /// The live entry whose range contains `key`: the greatest entry at or
    /// before `key`, kept only when it actually covers the key.
    fn find(&self, key: &[u8]) -> Option<&RegionInfo> {
        self.tree
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| key_in_range(key, &r.start_key, &r.end_key))
    }

    fn add_stat(&mut self, region: &RegionInfo) {
        self.total_size = self.total_size.saturating_add(region.approximate_size);
        self.total_write_bytes_rate += region.write_bytes_rate;
        self.total_write_keys_rate += region.write_keys_rate;
    }

    fn subtract_stat(&mut self, region: &RegionInfo) {
        self.total_size = self.total_size.saturating_sub(region.approximate_size);
        self.total_write_bytes_rate -= region.write_bytes_rate;
        self.total_write_keys_rate -= region.write_keys_rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u64, start: &str, end: &str) -> RegionInfo {
        let mut r = RegionInfo::new(id, start.as_bytes().to_vec(), end.as_bytes().to_vec());
        r.approximate_size = 10 * id;
        r.write_bytes_rate = id as f64;
        r.write_keys_rate = (id * 2) as f64;
        r
    }

    fn assert_no_overlap(tree: &RegionTree) {
        let all = tree.scan_all();
        for pair in all.windows(2) {
            assert!(
                !pair[0].end_key.is_empty() && pair[0].end_key <= pair[1].start_key,
                "entries overlap: {:?} / {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    fn assert_stats_consistent(tree: &RegionTree) {
        let all = tree.scan_all();
        let size: u64 = all.iter().map(|r| r.approximate_size).sum();
        let bytes: f64 = all.iter().map(|r| r.write_bytes_rate).sum();
        let keys: f64 = all.iter().map(|r| r.write_keys_rate).sum();
        assert_eq!(tree.total_size(), size);
        let (b, k) = tree.total_write_rate();
        assert!((b - bytes).abs() < 1e-6);
        assert!((k - keys).abs() < 1e-6);
    }

    fn three_region_tree() -> RegionTree {
        let mut tree = RegionTree::new();
        tree.update(region(1, "", "b"));
        tree.update(region(2, "b", "d"));
        tree.update(region(3, "d", ""));
        tree
    }

    #[test]
    fn search_and_search_prev() {
        let tree = three_region_tree();
        assert_eq!(tree.search(b"c").map(|r| r.id), Some(2));
        assert_eq!(tree.search(b"").map(|r| r.id), Some(1));
        assert_eq!(tree.search(b"zzz").map(|r| r.id), Some(3));
        assert_eq!(tree.search_prev(b"d").map(|r| r.id), Some(2));
        assert!(tree.search_prev(b"").is_none());
    }

    #[test]
    fn search_prev_requires_adjacency() {
        let mut tree = RegionTree::new();
        tree.update(region(1, "a", "b"));
        tree.update(region(2, "c", "d"));
        // Gap between b and c: region 1 is previous by order but not adjacent.
        assert!(tree.search_prev(b"c").is_none());
    }

    #[test]
    fn overlaps_cover_partially_intersecting_ranges() {
        let tree = three_region_tree();
        let probe = RegionInfo::new(9, b"a".to_vec(), b"c".to_vec());
        let ids: Vec<u64> = tree.get_overlaps(&probe).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let all = RegionInfo::new(9, Vec::new(), Vec::new());
        assert_eq!(tree.get_overlaps(&all).len(), 3);
    }

    #[test]
    fn update_replaces_every_overlapped_entry() {
        let mut tree = three_region_tree();
        let displaced = tree.update(region(4, "a", "e"));
        let mut ids: Vec<u64> = displaced.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.search(b"c").map(|r| r.id), Some(4));
        assert_no_overlap(&tree);
        assert_stats_consistent(&tree);
    }

    #[test]
    fn aggregates_track_update_and_remove() {
        let mut tree = three_region_tree();
        assert_stats_consistent(&tree);

        // Shrink region 2's stats via a same-range replacement.
        let mut smaller = region(2, "b", "d");
        smaller.approximate_size = 1;
        tree.update(smaller);
        assert_stats_consistent(&tree);

        tree.remove(&region(2, "b", "d"));
        assert_eq!(tree.len(), 2);
        assert_stats_consistent(&tree);

        // Removing with a mismatched id is a no-op.
        tree.remove(&region(99, "", "b"));
        assert_eq!(tree.len(), 2);
        assert_stats_consistent(&tree);
    }

    #[test]
    fn update_stat_adjusts_for_in_place_replacement() {
        let mut tree = three_region_tree();
        let origin = tree.search(b"c").unwrap().clone();
        let mut newer = origin.clone();
        newer.approximate_size += 100;
        tree.update_stat(&origin, &newer);
        assert_eq!(
            tree.total_size(),
            10 + 20 + 30 + 100,
            "only the size delta should move"
        );
    }

    #[test]
    fn scan_range_starts_at_containing_region() {
        let tree = three_region_tree();
        let mut seen = Vec::new();
        tree.scan_range(b"c", |r| {
            seen.push(r.id);
            true
        });
        assert_eq!(seen, vec![2, 3]);

        let mut first_only = Vec::new();
        tree.scan_range(b"", |r| {
            first_only.push(r.id);
            false
        });
        assert_eq!(first_only, vec![1]);
    }

    #[test]
    fn random_region_honors_range_windows() {
        let tree = three_region_tree();

        // Whole keyspace: always finds something.
        for _ in 0..16 {
            assert!(tree.random_region(&[]).is_some());
        }

        // A window that exactly covers region 2.
        let only_two = [KeyRange::new(b"b".to_vec(), b"d".to_vec())];
        for _ in 0..16 {
            assert_eq!(tree.random_region(&only_two).map(|r| r.id), Some(2));
        }

        // A window inside region 2: the sampled region is not fully involved.
        let inside = [KeyRange::new(b"bb".to_vec(), b"bc".to_vec())];
        assert!(tree.random_region(&inside).is_none());

        let empty = RegionTree::new();
        assert!(empty.random_region(&[]).is_none());
    }

    #[test]
    fn positional_access_matches_key_order() {
        let tree = three_region_tree();
        assert_eq!(tree.get_at(0).map(|r| r.id), Some(1));
        assert_eq!(tree.get_at(2).map(|r| r.id), Some(3));
        assert!(tree.get_at(3).is_none());

        let (hit, rank) = tree.get_with_index(b"b");
        assert_eq!(hit.map(|r| r.id), Some(2));
        assert_eq!(rank, 1);

        // No exact entry: only the rank is reported.
        let (miss, rank) = tree.get_with_index(b"c");
        assert!(miss.is_none());
        assert_eq!(rank, 2);
    }

    #[test]
    fn random_regions_allows_duplicates() {
        let mut tree = RegionTree::new();
        tree.update(region(1, "", ""));
        let picked = tree.random_regions(4, &[]);
        assert_eq!(picked.len(), 4);
        assert!(picked.iter().all(|r| r.id == 1));
    }

    #[test]
    fn no_overlap_survives_interleaved_mutation() {
        let mut tree = RegionTree::new();
        let keys = ["", "c", "f", "i", "l"];
        for (i, pair) in keys.windows(2).enumerate() {
            tree.update(region(i as u64 + 1, pair[0], pair[1]));
        }
        tree.update(region(10, "b", "g"));
        tree.update(region(11, "k", ""));
        tree.remove(&region(10, "b", "g"));
        tree.update(region(12, "", "z"));
        assert_no_overlap(&tree);
        assert_stats_consistent(&tree);
    }
}
