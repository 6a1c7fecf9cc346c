//! Participants of a shared deployment unit
//!
//! Records which node uses which context id for a per-version unit. Entries
//! are only ever added; an existing entry is never overwritten.

use crate::ids::{ContextId, NodeId};
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Plain snapshot of a participants map, as carried in requests and messages
pub type ParticipantMap = BTreeMap<NodeId, ContextId>;

/// Concurrent, grow-only node -> context map
#[derive(Debug, Default)]
pub struct Participants {
    entries: DashMap<NodeId, ContextId>,
}

impl Participants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &ParticipantMap) -> Self {
        let participants = Self::new();
        participants.merge(map);
        participants
    }

    /// Insert the pair unless the node already has an entry.
    ///
    /// Returns true when the entry was added.
    pub fn insert_if_absent(&self, node: NodeId, context: ContextId) -> bool {
        let mut added = false;
        self.entries.entry(node).or_insert_with(|| {
            added = true;
            context
        });
        added
    }

    /// Merge every missing pair; returns the number of entries added
    pub fn merge(&self, other: &ParticipantMap) -> usize {
        other
            .iter()
            .filter(|(node, ctx)| self.insert_if_absent(**node, **ctx))
            .count()
    }

    pub fn get(&self, node: &NodeId) -> Option<ContextId> {
        self.entries.get(node).map(|e| *e.value())
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.entries.contains_key(node)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> ParticipantMap {
        self.entries.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_existing_entry_is_not_overwritten() {
        let participants = Participants::new();
        let node = NodeId::generate();
        let first = ContextId::generate();

        assert!(participants.insert_if_absent(node, first));
        assert!(!participants.insert_if_absent(node, ContextId::generate()));
        assert_eq!(participants.get(&node), Some(first));
    }

    #[test]
    fn test_merge_counts_added_entries() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        let participants = Participants::from_map(&ParticipantMap::from([(a, ContextId::generate())]));

        let added = participants.merge(&ParticipantMap::from([
            (a, ContextId::generate()),
            (b, ContextId::generate()),
        ]));

        assert_eq!(added, 1);
        assert_eq!(participants.len(), 2);
    }

    fn batches() -> impl Strategy<Value = Vec<Vec<(u8, u8)>>> {
        prop::collection::vec(prop::collection::vec((0u8..8, any::<u8>()), 0..6), 0..6)
    }

    proptest! {
        #[test]
        fn merge_is_grow_only_and_first_wins(batches in batches()) {
            let nodes: Vec<NodeId> = (0..8).map(|_| NodeId::generate()).collect();
            let contexts: Vec<ContextId> = (0..=u8::MAX).map(|_| ContextId::generate()).collect();
            let participants = Participants::new();
            let mut expected = ParticipantMap::new();

            for batch in batches {
                let before = participants.snapshot();
                let map: ParticipantMap = batch
                    .iter()
                    .map(|(n, c)| (nodes[*n as usize], contexts[*c as usize]))
                    .collect();
                for (node, ctx) in &map {
                    expected.entry(*node).or_insert(*ctx);
                }
                participants.merge(&map);

                let after = participants.snapshot();
                for (node, ctx) in before {
                    prop_assert_eq!(after.get(&node), Some(&ctx));
                }
            }

            prop_assert_eq!(participants.snapshot(), expected);
        }
    }
}
