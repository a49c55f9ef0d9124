//! Hierarchical reverse index for pattern subscriptions.
//!
//! [`ReverseIndex`] stores items that each carry a (possibly wildcarded) key
//! for every level of a fixed attribute chain — for the message bus that
//! chain is (job, component, name) — and answers "which items match this
//! concrete tuple" in O(depth) expected time.
//!
//! ## Buckets
//! Each level is a hash map from key to sub-index (or to a flat item list at
//! the last level). Three kinds of buckets exist:
//! - a concrete key bucket per distinct stored key,
//! - the wildcard bucket (`None`), holding items that match any value at
//!   this level,
//! - one bucket per alias group, additionally holding every item whose
//!   concrete key is a member of that group.
//!
//! ## Contract
//! Queries are always fully concrete; only stored items may use `None`.
//! Group membership is closed once [`GroupSet::initialize`] has built the
//! reverse lookup; the bus serializes all mutation, the index itself does no
//! locking.

use std::collections::HashMap;

/// Key access for indexed items: one optional key per level, `None` meaning
/// "match any value at this level".
pub trait KeyedPattern {
    /// Returns the item's key for the given level.
    fn key_at(&self, level: usize) -> Option<&str>;
}

/// Per-level alias groups with a reverse lookup from member key to groups.
///
/// Groups are registered with [`add_group`](GroupSet::add_group) and become
/// effective for matching once [`initialize`](GroupSet::initialize) has been
/// called (the bus does this when the core starts). Registering after that
/// point is unsupported.
#[derive(Debug, Default, Clone)]
pub struct GroupSet {
    levels: Vec<GroupLevel>,
}

#[derive(Debug, Default, Clone)]
struct GroupLevel {
    /// group name -> member keys
    members: HashMap<String, Vec<String>>,
    /// member key -> group names, built by `initialize`
    by_key: HashMap<String, Vec<String>>,
}

impl GroupSet {
    /// Creates an empty group set for the given number of levels.
    pub fn new(levels: usize) -> Self {
        Self {
            levels: (0..levels).map(|_| GroupLevel::default()).collect(),
        }
    }

    /// Registers an alias group at one level; repeated registration extends
    /// the member list.
    pub fn add_group(&mut self, level: usize, group: &str, keys: &[&str]) {
        let members = self.levels[level]
            .members
            .entry(group.to_string())
            .or_default();
        members.extend(keys.iter().map(|k| k.to_string()));
    }

    /// Builds the reverse lookup (member key -> groups). Must run before
    /// group matching is used; the group table is considered closed after.
    pub fn initialize(&mut self) {
        for level in &mut self.levels {
            level.by_key.clear();
            for (group, keys) in &level.members {
                for key in keys {
                    level
                        .by_key
                        .entry(key.clone())
                        .or_default()
                        .push(group.clone());
                }
            }
        }
    }

    /// Groups containing `key` at `level` (empty until initialized).
    pub fn groups_of(&self, level: usize, key: &str) -> &[String] {
        self.levels[level]
            .by_key
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

enum Node<T> {
    Branch(HashMap<Option<String>, Node<T>>),
    Leaf(Vec<T>),
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        match self {
            Node::Branch(map) => map.is_empty(),
            Node::Leaf(items) => items.is_empty(),
        }
    }
}

/// Multi-level reverse index over [`KeyedPattern`] items.
pub struct ReverseIndex<T> {
    levels: usize,
    root: Node<T>,
}

impl<T: KeyedPattern + Clone + PartialEq> ReverseIndex<T> {
    /// Creates an index over `levels` attribute levels (at least one).
    pub fn new(levels: usize) -> Self {
        debug_assert!(levels >= 1);
        Self {
            levels,
            root: Node::Branch(HashMap::new()),
        }
    }

    /// Inserts an item under its key bucket at every level, and additionally
    /// under every group bucket containing that key.
    pub fn add(&mut self, item: T, groups: &GroupSet) {
        Self::insert(&mut self.root, &item, 0, self.levels, groups);
    }

    /// Removes an item from every bucket it was inserted into, pruning
    /// sub-indices that become empty. Items are matched by `PartialEq`.
    pub fn remove(&mut self, item: &T, groups: &GroupSet) {
        Self::take(&mut self.root, item, 0, self.levels, groups);
    }

    /// Returns every item matching the concrete query tuple: the union over
    /// exact, wildcard, and group buckets at each level, de-duplicated.
    pub fn lookup(&self, query: &[&str], groups: &GroupSet) -> Vec<T> {
        debug_assert_eq!(query.len(), self.levels);
        let mut out = Vec::new();
        Self::collect(&self.root, query, 0, groups, &mut out);
        out
    }

    /// True when no items are stored (the root has been pruned away).
    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    fn buckets_for(key: &Option<String>, level: usize, groups: &GroupSet) -> Vec<Option<String>> {
        let mut targets = vec![key.clone()];
        if let Some(k) = key.as_deref() {
            for group in groups.groups_of(level, k) {
                targets.push(Some(group.clone()));
            }
        }
        targets
    }

    fn insert(node: &mut Node<T>, item: &T, level: usize, levels: usize, groups: &GroupSet) {
        let Node::Branch(map) = node else {
            return;
        };
        let key = item.key_at(level).map(str::to_string);
        let last = level + 1 == levels;
        for bucket in Self::buckets_for(&key, level, groups) {
            let child = map.entry(bucket).or_insert_with(|| {
                if last {
                    Node::Leaf(Vec::new())
                } else {
                    Node::Branch(HashMap::new())
                }
            });
            match child {
                Node::Leaf(items) => items.push(item.clone()),
                Node::Branch(_) => Self::insert(child, item, level + 1, levels, groups),
            }
        }
    }

    fn take(node: &mut Node<T>, item: &T, level: usize, levels: usize, groups: &GroupSet) {
        let Node::Branch(map) = node else {
            return;
        };
        let key = item.key_at(level).map(str::to_string);
        for bucket in Self::buckets_for(&key, level, groups) {
            if let Some(child) = map.get_mut(&bucket) {
                match child {
                    Node::Leaf(items) => {
                        if let Some(pos) = items.iter().position(|x| x == item) {
                            items.remove(pos);
                        }
                    }
                    Node::Branch(_) => Self::take(child, item, level + 1, levels, groups),
                }
                if child.is_empty() {
                    map.remove(&bucket);
                }
            }
        }
    }

    fn collect(node: &Node<T>, query: &[&str], level: usize, groups: &GroupSet, out: &mut Vec<T>) {
        let Node::Branch(map) = node else {
            return;
        };
        let pivot = query[level];
        let mut probes: Vec<Option<String>> = vec![Some(pivot.to_string()), None];
        for group in groups.groups_of(level, pivot) {
            probes.push(Some(group.clone()));
        }
        for probe in probes {
            if let Some(child) = map.get(&probe) {
                match child {
                    Node::Leaf(items) => {
                        for item in items {
                            if !out.iter().any(|x| x == item) {
                                out.push(item.clone());
                            }
                        }
                    }
                    Node::Branch(_) => Self::collect(child, query, level + 1, groups, out),
                }
            }
        }
    }
}
