// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version histories: per-run branch sets used for n-way conflict
//! resolution.
//!
//! A version history compresses an event sequence into its `(event_id,
//! version)` transition points: one item per contiguous version span, where
//! `event_id` is the last event of the span. Two clusters that diverged
//! share the longest common prefix of their histories; the item with the
//! highest event ID present in both sides is the lowest common ancestor
//! (LCA) and the fork point for conflict resolution.

use serde::{Deserialize, Serialize};

use windlass_common::error::{EngineError, Result};

use crate::types::BranchToken;

/// One `(event_id, version)` transition point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    /// Last event ID written under `version`.
    pub event_id: i64,
    /// Failover version of the span.
    pub version: i64,
}

impl VersionHistoryItem {
    /// Build an item.
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// One branch: its storage token plus its transition points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Storage branch this history describes.
    pub branch_token: BranchToken,
    /// Transition points, sorted by event ID and version.
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// A history over `branch_token` with no events yet.
    pub fn new(branch_token: BranchToken) -> Self {
        Self {
            branch_token,
            items: Vec::new(),
        }
    }

    /// A history with preexisting items.
    pub fn with_items(branch_token: BranchToken, items: Vec<VersionHistoryItem>) -> Self {
        Self { branch_token, items }
    }

    /// The last transition point, if any events exist.
    pub fn last_item(&self) -> Option<VersionHistoryItem> {
        self.items.last().copied()
    }

    /// Record that events up to `item.event_id` were written at
    /// `item.version`.
    ///
    /// Enforces version monotonicity along the branch: a new item may
    /// extend the current span or open a span at a higher version, never a
    /// lower one.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> Result<()> {
        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };
        if item.version < last.version {
            return Err(EngineError::Internal {
                details: format!(
                    "version history out of order: {} after {}",
                    item.version, last.version
                ),
            });
        }
        if item.event_id <= last.event_id {
            return Err(EngineError::Internal {
                details: format!(
                    "version history event id not increasing: {} after {}",
                    item.event_id, last.event_id
                ),
            });
        }
        if item.version == last.version {
            last.event_id = item.event_id;
        } else {
            self.items.push(item);
        }
        Ok(())
    }

    /// Whether `item` lies on this branch.
    pub fn contains_item(&self, item: VersionHistoryItem) -> bool {
        let mut prev_event_id = 0;
        for entry in &self.items {
            if entry.version == item.version {
                return item.event_id > prev_event_id && item.event_id <= entry.event_id;
            }
            prev_event_id = entry.event_id;
        }
        false
    }

    /// The lowest common ancestor of this branch and `remote_items`: the
    /// shared item with the highest event ID.
    pub fn find_lca_item(&self, remote_items: &[VersionHistoryItem]) -> Result<VersionHistoryItem> {
        let mut local = self.items.iter().rev().peekable();
        let mut remote = remote_items.iter().rev().peekable();

        while let (Some(l), Some(r)) = (local.peek(), remote.peek()) {
            if l.version == r.version {
                return Ok(VersionHistoryItem::new(l.event_id.min(r.event_id), l.version));
            }
            if l.version > r.version {
                local.next();
            } else {
                remote.next();
            }
        }
        Err(EngineError::Internal {
            details: "version histories share no common ancestor".to_string(),
        })
    }

    /// Rewind the branch so its last event is `item.event_id` at
    /// `item.version`. Items past the fork point are dropped.
    pub fn truncate_to(&mut self, item: VersionHistoryItem) -> Result<()> {
        if !self.contains_item(item) {
            return Err(EngineError::Internal {
                details: "cannot truncate to an item not on the branch".to_string(),
            });
        }
        self.items.retain(|entry| entry.version <= item.version);
        if let Some(last) = self.items.last_mut() {
            if last.version == item.version {
                last.event_id = item.event_id;
            }
        }
        Ok(())
    }
}

/// The branch set of one run. Exactly one branch is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    /// Index of the current branch in `histories`.
    pub current_index: usize,
    /// All branches, current and orphaned.
    pub histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// A branch set with a single current branch.
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![history],
        }
    }

    /// The current branch.
    pub fn current(&self) -> &VersionHistory {
        &self.histories[self.current_index]
    }

    /// The current branch, mutably.
    pub fn current_mut(&mut self) -> &mut VersionHistory {
        &mut self.histories[self.current_index]
    }

    /// Add a branch and return its index.
    pub fn add_history(&mut self, history: VersionHistory) -> usize {
        self.histories.push(history);
        self.histories.len() - 1
    }

    /// Mark the branch at `index` current.
    pub fn set_current(&mut self, index: usize) -> Result<()> {
        if index >= self.histories.len() {
            return Err(EngineError::Internal {
                details: format!("version history index {} out of range", index),
            });
        }
        self.current_index = index;
        Ok(())
    }

    /// Find the branch sharing the deepest common ancestor with
    /// `remote_items`. Returns `(branch_index, lca_item)`.
    pub fn find_lca_history_index_and_item(
        &self,
        remote_items: &[VersionHistoryItem],
    ) -> Result<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, VersionHistoryItem)> = None;
        for (index, history) in self.histories.iter().enumerate() {
            if let Ok(item) = history.find_lca_item(remote_items) {
                let better = match best {
                    None => true,
                    Some((_, best_item)) => item.event_id > best_item.event_id,
                };
                if better {
                    best = Some((index, item));
                }
            }
        }
        best.ok_or_else(|| EngineError::Internal {
            details: "no branch shares an ancestor with the remote history".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(points: &[(i64, i64)]) -> Vec<VersionHistoryItem> {
        points
            .iter()
            .map(|&(event_id, version)| VersionHistoryItem::new(event_id, version))
            .collect()
    }

    #[test]
    fn test_add_or_update_extends_current_span() {
        let mut history = VersionHistory::new("b1".to_string());
        history.add_or_update_item(VersionHistoryItem::new(3, 1)).unwrap();
        history.add_or_update_item(VersionHistoryItem::new(5, 1)).unwrap();
        history.add_or_update_item(VersionHistoryItem::new(8, 2)).unwrap();

        assert_eq!(history.items, items(&[(5, 1), (8, 2)]));
        assert_eq!(history.last_item(), Some(VersionHistoryItem::new(8, 2)));
    }

    #[test]
    fn test_add_or_update_rejects_version_regression() {
        let mut history = VersionHistory::with_items("b1".to_string(), items(&[(8, 2)]));
        assert!(history.add_or_update_item(VersionHistoryItem::new(9, 1)).is_err());
        assert!(history.add_or_update_item(VersionHistoryItem::new(8, 2)).is_err());
    }

    #[test]
    fn test_contains_item() {
        let history = VersionHistory::with_items("b1".to_string(), items(&[(3, 1), (8, 2)]));

        assert!(history.contains_item(VersionHistoryItem::new(1, 1)));
        assert!(history.contains_item(VersionHistoryItem::new(3, 1)));
        assert!(history.contains_item(VersionHistoryItem::new(4, 2)));
        assert!(history.contains_item(VersionHistoryItem::new(8, 2)));
        // event 4 was written at version 2, not 1
        assert!(!history.contains_item(VersionHistoryItem::new(4, 1)));
        assert!(!history.contains_item(VersionHistoryItem::new(9, 2)));
        assert!(!history.contains_item(VersionHistoryItem::new(5, 3)));
    }

    #[test]
    fn test_find_lca_after_divergence() {
        // local events 1..8 on versions [1,1,1,2,2,2,2,2]
        let local = VersionHistory::with_items("b1".to_string(), items(&[(3, 1), (8, 2)]));
        // remote wrote events 4..9 at version 3 after the same prefix
        let remote = items(&[(3, 1), (9, 3)]);

        let lca = local.find_lca_item(&remote).unwrap();
        assert_eq!(lca, VersionHistoryItem::new(3, 1));
    }

    #[test]
    fn test_find_lca_shared_tail_takes_min_event_id() {
        let local = VersionHistory::with_items("b1".to_string(), items(&[(3, 1), (10, 2)]));
        let remote = items(&[(3, 1), (7, 2)]);

        let lca = local.find_lca_item(&remote).unwrap();
        assert_eq!(lca, VersionHistoryItem::new(7, 2));
    }

    #[test]
    fn test_find_lca_no_common_ancestor() {
        let local = VersionHistory::with_items("b1".to_string(), items(&[(5, 2)]));
        let remote = items(&[(5, 3)]);
        assert!(local.find_lca_item(&remote).is_err());
    }

    #[test]
    fn test_truncate_to_fork_point() {
        let mut history =
            VersionHistory::with_items("b1".to_string(), items(&[(3, 1), (8, 2), (12, 4)]));
        history.truncate_to(VersionHistoryItem::new(6, 2)).unwrap();
        assert_eq!(history.items, items(&[(3, 1), (6, 2)]));
    }

    #[test]
    fn test_histories_pick_deepest_branch() {
        let b1 = VersionHistory::with_items("b1".to_string(), items(&[(3, 1), (8, 2)]));
        let b2 = VersionHistory::with_items("b2".to_string(), items(&[(3, 1), (6, 3)]));
        let mut histories = VersionHistories::new(b1);
        histories.add_history(b2);

        let remote = items(&[(3, 1), (5, 3), (9, 5)]);
        let (index, lca) = histories.find_lca_history_index_and_item(&remote).unwrap();
        assert_eq!(index, 1);
        assert_eq!(lca, VersionHistoryItem::new(5, 3));
    }

    #[test]
    fn test_set_current() {
        let b1 = VersionHistory::new("b1".to_string());
        let b2 = VersionHistory::new("b2".to_string());
        let mut histories = VersionHistories::new(b1);
        let index = histories.add_history(b2);

        histories.set_current(index).unwrap();
        assert_eq!(histories.current().branch_token, "b2");
        assert!(histories.set_current(9).is_err());
    }
}
