//! Clustered ascending time index over a group's rows.
//!
//! The index is a sorted list of `(time, row_id)` pairs plus a watermark,
//! `indexed_rows`: rows `0..indexed_rows` of the row directory are in the
//! list, rows after it are "dirty". Ties on time keep append order because
//! the row id is part of the sort key.
//!
//! Lookups always merge in a scan of the dirty tail, so results are complete
//! whether or not the index has been refreshed. Keeping the tail short is
//! what auto-indexing (refresh on every append) and [`IndexMode::Dirty`] are
//! for.
//!
//! The index is derived state: it is rebuilt from the row directory when a
//! container is opened.

use log::debug;

use crate::{
    catalog::CatalogAction, container::Container, error::ArchiveResult, group::GroupPath,
};

/// How much of the index to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Rebuild from a full scan of the row directory.
    Full,
    /// Merge only rows appended after the watermark.
    Dirty,
}

type Entry = (i64, u32);

#[derive(Debug, Clone, Default)]
pub(crate) struct TimeIndex {
    entries: Vec<Entry>,
    indexed_rows: usize,
}

impl TimeIndex {
    pub(crate) fn indexed_rows(&self) -> usize {
        self.indexed_rows
    }

    pub(crate) fn dirty_rows(&self, total: usize) -> usize {
        total.saturating_sub(self.indexed_rows)
    }

    pub(crate) fn rebuild_full(&mut self, times: &[i64]) {
        let mut entries: Vec<Entry> = times
            .iter()
            .enumerate()
            .map(|(row, &t)| (t, row as u32))
            .collect();
        entries.sort_unstable();
        self.entries = entries;
        self.indexed_rows = times.len();
    }

    /// Merge rows after the watermark; returns how many were merged.
    pub(crate) fn refresh_dirty(&mut self, times: &[i64]) -> usize {
        let mut tail = dirty_entries(times, self.indexed_rows);
        if tail.is_empty() {
            return 0;
        }
        tail.sort_unstable();
        let merged = tail.len();

        let overlaps = matches!(
            (self.entries.last(), tail.first()),
            (Some(last), Some(first)) if last > first
        );
        if !overlaps {
            self.entries.extend(tail);
        } else if let [single] = tail.as_slice() {
            let pos = self.entries.partition_point(|e| e < single);
            self.entries.insert(pos, *single);
        } else {
            let entries = std::mem::take(&mut self.entries);
            self.entries = merge_sorted(entries, tail);
        }
        self.indexed_rows = times.len();
        merged
    }

    /// Row ids with `begin <= time <= end`, ascending by `(time, row_id)`.
    pub(crate) fn lookup(&self, times: &[i64], begin: i64, end: i64) -> Vec<u32> {
        if begin > end {
            return Vec::new();
        }
        let lo = self.entries.partition_point(|&(t, _)| t < begin);
        let hi = self.entries.partition_point(|&(t, _)| t <= end);
        let indexed = &self.entries[lo..hi];

        let mut dirty: Vec<Entry> = dirty_entries(times, self.indexed_rows)
            .into_iter()
            .filter(|&(t, _)| t >= begin && t <= end)
            .collect();
        if dirty.is_empty() {
            return indexed.iter().map(|&(_, row)| row).collect();
        }
        dirty.sort_unstable();
        merge_sorted(indexed.to_vec(), dirty)
            .into_iter()
            .map(|(_, row)| row)
            .collect()
    }

    pub(crate) fn contains(&self, times: &[i64], time: i64) -> bool {
        let pos = self.entries.partition_point(|&(t, _)| t < time);
        let indexed = self.entries.get(pos).is_some_and(|&(t, _)| t == time);
        indexed || tail(times, self.indexed_rows).contains(&time)
    }

    pub(crate) fn min_time(&self, times: &[i64]) -> Option<i64> {
        let indexed = self.entries.first().map(|&(t, _)| t);
        let dirty = tail(times, self.indexed_rows).iter().copied().min();
        match (indexed, dirty) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Container {
    /// Rebuild or refresh a group's time index; returns the number of rows
    /// merged.
    ///
    /// Works on read handles too: the index is rebuilt on every open, so the
    /// result only affects this handle.
    pub fn reindex(&mut self, group: &str, mode: IndexMode) -> ArchiveResult<usize> {
        self.ensure_open()?;
        let path = GroupPath::parse(group)?;
        let state = self.group_mut(&path)?;
        let dirty = state.index.dirty_rows(state.rows.len());
        let merged = match mode {
            IndexMode::Full => {
                state.index.rebuild_full(&state.rows.times);
                state.rows.len()
            }
            IndexMode::Dirty => state.index.refresh_dirty(&state.rows.times),
        };
        state.has_time_index = true;
        debug!("reindexed {path} ({mode:?}): {merged} rows merged, {dirty} were dirty");
        Ok(merged)
    }

    /// Turn per-append index maintenance on or off. The setting is
    /// persisted. Turning it on merges any rows appended while it was off.
    pub fn set_auto_index(&mut self, group: &str, enabled: bool) -> ArchiveResult<()> {
        self.ensure_writable()?;
        let path = GroupPath::parse(group)?;
        self.group(&path)?;
        self.commit_action(CatalogAction::SetAutoIndex {
            group: path.clone(),
            auto_index: enabled,
        })?;
        if enabled {
            let state = self.group_mut(&path)?;
            state.index.refresh_dirty(&state.rows.times);
        }
        Ok(())
    }
}

fn tail(times: &[i64], from: usize) -> &[i64] {
    times.get(from..).unwrap_or(&[])
}

fn dirty_entries(times: &[i64], from: usize) -> Vec<Entry> {
    tail(times, from)
        .iter()
        .enumerate()
        .map(|(i, &t)| (t, (from + i) as u32))
        .collect()
}

fn merge_sorted(a: Vec<Entry>, b: Vec<Entry>) -> Vec<Entry> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let next = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) if x <= y => a.next(),
            (Some(_), Some(_)) => b.next(),
            (Some(_), None) => a.next(),
            (None, Some(_)) => b.next(),
            (None, None) => break,
        };
        out.extend(next);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rebuild_orders_by_time_then_row() {
        let times = [30, 10, 20, 10];
        let mut index = TimeIndex::default();
        index.rebuild_full(&times);

        assert_eq!(index.lookup(&times, i64::MIN, i64::MAX), vec![1, 3, 2, 0]);
        assert_eq!(index.indexed_rows(), 4);
    }

    #[test]
    fn dirty_refresh_merges_only_tail() {
        let mut times = vec![10, 20, 30];
        let mut index = TimeIndex::default();
        index.rebuild_full(&times);

        times.extend([25, 5, 40]);
        assert_eq!(index.dirty_rows(times.len()), 3);
        assert_eq!(index.refresh_dirty(&times), 3);
        assert_eq!(index.dirty_rows(times.len()), 0);
        assert_eq!(
            index.lookup(&times, i64::MIN, i64::MAX),
            vec![4, 0, 1, 3, 2, 5]
        );
        assert_eq!(index.refresh_dirty(&times), 0);
    }

    #[test]
    fn single_out_of_order_row_is_inserted_in_place() {
        let mut times = vec![10, 20, 30];
        let mut index = TimeIndex::default();
        index.rebuild_full(&times);

        times.push(15);
        index.refresh_dirty(&times);
        assert_eq!(index.lookup(&times, 10, 20), vec![0, 3, 1]);
    }

    #[test]
    fn lookup_sees_unindexed_rows() {
        let mut times = vec![100, 200];
        let mut index = TimeIndex::default();
        index.rebuild_full(&times);

        times.push(150);
        assert_eq!(index.lookup(&times, 100, 200), vec![0, 2, 1]);
        assert!(index.contains(&times, 150));
        assert!(!index.contains(&times, 151));
        assert_eq!(index.min_time(&times), Some(100));
    }

    #[test]
    fn lookup_bounds_are_inclusive_and_empty_when_inverted() {
        let times = [1000, 1010, 1020];
        let mut index = TimeIndex::default();
        index.rebuild_full(&times);

        assert_eq!(index.lookup(&times, 1000, 1010), vec![0, 1]);
        assert!(index.lookup(&times, 1011, 1019).is_empty());
        assert!(index.lookup(&times, 1020, 1000).is_empty());
    }

    #[test]
    fn empty_index_has_no_min() {
        let index = TimeIndex::default();
        assert_eq!(index.min_time(&[]), None);
    }
}
