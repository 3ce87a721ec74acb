//! In-memory node structure: a decoded view of one block's bytes.
//!
//! A node holds at most [`Node::ORDER`] keys. An internal node with `n`
//! keys has exactly `n + 1` children: `children[i]` covers keys below
//! `keys[i]`, `children[n]` covers everything from `keys[n - 1]` up.
//! All array surgery (insert shifting, split, merge, level) lives here;
//! when each helper fires is the tree driver's business.

use crate::buffer::BlockId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    /// Maximum number of keys in any node. Single source of truth for the
    /// fan-out of the whole tree.
    pub const ORDER: usize = 16;
    /// Nodes below this key count are rebalancing candidates.
    pub const MIN_KEYS: usize = Self::ORDER / 2;

    pub fn nkeys(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Internal(internal) => internal.keys.len(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.nkeys() == Self::ORDER
    }

    pub fn is_underfull(&self) -> bool {
        self.nkeys() < Self::MIN_KEYS
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(_) => None,
        }
    }

    pub fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            Node::Internal(internal) => Some(internal),
            Node::Leaf(_) => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeafInsert {
    Inserted,
    /// Key already present; its value was overwritten.
    Updated,
    /// Node is at capacity and the key is new; nothing changed.
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    pub keys: Vec<u64>,
    pub values: Vec<u64>,
}

impl LeafNode {
    pub fn new() -> Self {
        LeafNode {
            keys: Vec::with_capacity(Node::ORDER),
            values: Vec::with_capacity(Node::ORDER),
        }
    }

    pub fn lookup(&self, key: u64) -> Option<u64> {
        self.keys
            .binary_search(&key)
            .ok()
            .map(|idx| self.values[idx])
    }

    pub fn insert(&mut self, key: u64, value: u64) -> LeafInsert {
        match self.keys.binary_search(&key) {
            Ok(idx) => {
                self.values[idx] = value;
                LeafInsert::Updated
            }
            Err(idx) => {
                if self.keys.len() == Node::ORDER {
                    return LeafInsert::Full;
                }
                self.keys.insert(idx, key);
                self.values.insert(idx, value);
                LeafInsert::Inserted
            }
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<u64> {
        let idx = self.keys.binary_search(&key).ok()?;
        self.keys.remove(idx);
        Some(self.values.remove(idx))
    }

    /// Splits off the upper half, median slot included. Returns the median
    /// key and the new right node; afterwards every key here is below the
    /// median and every key in the right node is at or above it.
    pub fn split(&mut self) -> (u64, LeafNode) {
        let mid = self.keys.len() / 2;
        let median = self.keys[mid];
        let right = LeafNode {
            keys: self.keys.split_off(mid),
            values: self.values.split_off(mid),
        };
        (median, right)
    }

    /// Absorbs the right sibling. Caller guarantees the combined key count
    /// fits, which holds whenever both sides are rebalancing candidates.
    pub fn merge(&mut self, right: LeafNode) {
        debug_assert!(self.keys.len() + right.keys.len() <= Node::ORDER);
        self.keys.extend(right.keys);
        self.values.extend(right.values);
    }

    /// Moves this node's last entry to the front of the right sibling.
    /// Returns the new separator for the parent: the moved key.
    pub fn level_into_right(&mut self, right: &mut LeafNode) -> u64 {
        let key = self.keys.pop().unwrap_or_default();
        let value = self.values.pop().unwrap_or_default();
        right.keys.insert(0, key);
        right.values.insert(0, value);
        key
    }

    /// Moves the right sibling's first entry to the end of this node.
    /// Returns the new separator: the right sibling's new first key.
    pub fn level_from_right(&mut self, right: &mut LeafNode) -> u64 {
        self.keys.push(right.keys.remove(0));
        self.values.push(right.values.remove(0));
        right.keys.first().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalNode {
    pub keys: Vec<u64>,
    pub children: Vec<BlockId>,
}

impl InternalNode {
    pub fn new() -> Self {
        InternalNode {
            keys: Vec::with_capacity(Node::ORDER),
            children: Vec::with_capacity(Node::ORDER + 1),
        }
    }

    /// The child slot to descend into for `key`. Keys equal to a separator
    /// belong to the subtree on its right.
    pub fn child_index(&self, key: u64) -> usize {
        self.keys.partition_point(|k| *k <= key)
    }

    pub fn child_for(&self, key: u64) -> BlockId {
        self.children[self.child_index(key)]
    }

    /// Records a split of `children[idx]`: `median` becomes the separator
    /// at `idx` and `right` the child after it. The caller pre-splits full
    /// parents on the way down, so capacity is an invariant here.
    pub fn insert_split(&mut self, idx: usize, median: u64, right: BlockId) {
        debug_assert!(self.keys.len() < Node::ORDER);
        self.keys.insert(idx, median);
        self.children.insert(idx + 1, right);
    }

    /// Splits off the upper half. The median is promoted, not kept: the
    /// left half retains `mid + 1` children, the right takes the rest.
    pub fn split(&mut self) -> (u64, InternalNode) {
        let mid = self.keys.len() / 2;
        let median = self.keys[mid];
        let right = InternalNode {
            keys: self.keys.split_off(mid + 1),
            children: self.children.split_off(mid + 1),
        };
        self.keys.pop();
        (median, right)
    }

    /// Removes the separator at `idx` and the child after it, after that
    /// child has been merged into its left sibling.
    pub fn remove_merged(&mut self, idx: usize) {
        self.keys.remove(idx);
        self.children.remove(idx + 1);
    }

    pub fn set_separator(&mut self, idx: usize, key: u64) {
        self.keys[idx] = key;
    }

    /// Absorbs the right sibling with `separator` pulled down between them.
    pub fn merge(&mut self, separator: u64, right: InternalNode) {
        debug_assert!(self.keys.len() + right.keys.len() + 1 <= Node::ORDER);
        self.keys.push(separator);
        self.keys.extend(right.keys);
        self.children.extend(right.children);
    }

    /// Rotates one entry into the right sibling through the parent:
    /// `separator` drops into the right node, this node's last child moves
    /// with it, and the popped last key is the new separator.
    pub fn level_into_right(&mut self, separator: u64, right: &mut InternalNode) -> u64 {
        right.keys.insert(0, separator);
        if let Some(child) = self.children.pop() {
            right.children.insert(0, child);
        }
        self.keys.pop().unwrap_or_default()
    }

    /// Rotates one entry out of the right sibling through the parent.
    /// Returns the new separator: the right sibling's removed first key.
    pub fn level_from_right(&mut self, separator: u64, right: &mut InternalNode) -> u64 {
        self.keys.push(separator);
        self.children.push(right.children.remove(0));
        right.keys.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_leaf() -> LeafNode {
        let mut leaf = LeafNode::new();
        for k in 0..Node::ORDER as u64 {
            assert_eq!(leaf.insert(k, k * 10), LeafInsert::Inserted);
        }
        leaf
    }

    #[test]
    fn leaf_insert_keeps_keys_sorted() {
        let mut leaf = LeafNode::new();
        for k in [9u64, 3, 14, 1, 7] {
            leaf.insert(k, k);
        }
        assert_eq!(leaf.keys, vec![1, 3, 7, 9, 14]);
        assert_eq!(leaf.lookup(7), Some(7));
        assert_eq!(leaf.lookup(8), None);
    }

    #[test]
    fn leaf_insert_overwrites_duplicate() {
        let mut leaf = LeafNode::new();
        assert_eq!(leaf.insert(5, 50), LeafInsert::Inserted);
        assert_eq!(leaf.insert(5, 51), LeafInsert::Updated);
        assert_eq!(leaf.keys.len(), 1);
        assert_eq!(leaf.lookup(5), Some(51));
    }

    #[test]
    fn full_leaf_rejects_new_key_unchanged() {
        let mut leaf = full_leaf();
        let before = leaf.clone();
        assert_eq!(leaf.insert(100, 1), LeafInsert::Full);
        assert_eq!(leaf, before);
        // Overwriting an existing key still works at capacity.
        assert_eq!(leaf.insert(3, 999), LeafInsert::Updated);
        assert_eq!(leaf.lookup(3), Some(999));
    }

    #[test]
    fn leaf_split_median_is_half_order() {
        let mut leaf = full_leaf();
        let (median, right) = leaf.split();
        assert_eq!(median, (Node::ORDER / 2) as u64);
        assert!(leaf.keys.iter().all(|k| *k < median));
        assert!(right.keys.iter().all(|k| *k >= median));
        assert_eq!(leaf.keys.len() + right.keys.len(), Node::ORDER);
        assert_eq!(right.keys[0], median);
    }

    #[test]
    fn leaf_merge_and_level() {
        let mut left = LeafNode::new();
        let mut right = LeafNode::new();
        for k in 0..4u64 {
            left.insert(k, k);
        }
        for k in 10..12u64 {
            right.insert(k, k);
        }

        let sep = left.level_into_right(&mut right);
        assert_eq!(sep, 3);
        assert_eq!(right.keys, vec![3, 10, 11]);

        let sep = left.level_from_right(&mut right);
        assert_eq!(sep, 10);
        assert_eq!(left.keys, vec![0, 1, 2, 3]);

        left.merge(right);
        assert_eq!(left.keys, vec![0, 1, 2, 3, 10, 11]);
        assert_eq!(left.values, vec![0, 1, 2, 3, 10, 11]);
    }

    #[test]
    fn internal_fan_out_invariant() {
        let mut node = InternalNode::new();
        node.children.push(100);
        node.insert_split(0, 10, 101);
        node.insert_split(1, 20, 102);
        assert_eq!(node.children.len(), node.keys.len() + 1);
        assert_eq!(node.child_for(5), 100);
        assert_eq!(node.child_for(10), 101);
        assert_eq!(node.child_for(15), 101);
        assert_eq!(node.child_for(20), 102);
        assert_eq!(node.child_for(99), 102);
    }

    #[test]
    fn internal_split_promotes_median() {
        let mut node = InternalNode::new();
        node.children.push(0xF0);
        for i in 0..Node::ORDER as u64 {
            node.insert_split(i as usize, i * 10, 0xF1 + i as BlockId);
        }
        assert_eq!(node.keys.len(), Node::ORDER);

        let (median, right) = node.split();
        assert_eq!(median, (Node::ORDER as u64 / 2) * 10);
        assert!(!node.keys.contains(&median));
        assert!(!right.keys.contains(&median));
        assert_eq!(node.children.len(), node.keys.len() + 1);
        assert_eq!(right.children.len(), right.keys.len() + 1);
        assert_eq!(
            node.keys.len() + right.keys.len() + 1,
            Node::ORDER
        );
    }

    #[test]
    fn internal_merge_restores_fan_out() {
        let mut left = InternalNode {
            keys: vec![10, 20],
            children: vec![1, 2, 3],
        };
        let right = InternalNode {
            keys: vec![40],
            children: vec![4, 5],
        };
        left.merge(30, right);
        assert_eq!(left.keys, vec![10, 20, 30, 40]);
        assert_eq!(left.children, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn internal_level_rotates_through_separator() {
        let mut left = InternalNode {
            keys: vec![10, 20, 30],
            children: vec![1, 2, 3, 4],
        };
        let mut right = InternalNode {
            keys: vec![50],
            children: vec![5, 6],
        };
        let sep = left.level_into_right(40, &mut right);
        assert_eq!(sep, 30);
        assert_eq!(left.children, vec![1, 2, 3]);
        assert_eq!(right.keys, vec![40, 50]);
        assert_eq!(right.children, vec![4, 5, 6]);

        let sep = left.level_from_right(sep, &mut right);
        assert_eq!(sep, 40);
        assert_eq!(left.keys, vec![10, 20, 30]);
        assert_eq!(left.children, vec![1, 2, 3, 4]);
        assert_eq!(right.keys, vec![50]);
        assert_eq!(right.children, vec![5, 6]);
    }
}
