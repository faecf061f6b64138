//! Versioned-snapshot hash trie.
//!
//! A copy-on-write hash array mapped trie with 64-way branching and a
//! fan-out-2 root. Every node and item carries the version (timeline) of
//! its last modification. Mutating calls take a `timeline` argument;
//! entries recorded at an older timeline are copied before modification,
//! entries at the current timeline are modified in place. Cloning the
//! container is cheap and yields an immutable snapshot sharing all
//! unmodified subtrees with its source.
//!
//! Callers must pass non-decreasing timelines and bump the timeline after
//! taking a snapshot, and must guarantee that no two live keys share the
//! same 64-bit hash.

use std::sync::Arc;

const ROOT_NODES_LOG2: u32 = 1;
const NUM_ROOT_NODES: usize = 1 << ROOT_NODES_LOG2;

/// Key contract: hashable to 64 bits, collision-free across live keys.
pub trait TrieKey: Copy + Eq {
    fn hash64(&self) -> u64;
}

/// One stored key/value pair together with its modification version.
///
/// The value pointer may be absent; "key present with no value" is a
/// distinct, queryable state.
pub struct TrieItem<K, V> {
    version: u64,
    key: K,
    value: Option<Arc<V>>,
}

impl<K: Copy, V> Clone for TrieItem<K, V> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            key: self.key,
            value: self.value.clone(),
        }
    }
}

impl<K: Copy, V> TrieItem<K, V> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn key(&self) -> K {
        self.key
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_deref()
    }

    pub fn value_ptr(&self) -> Option<Arc<V>> {
        self.value.clone()
    }
}

struct ChildEntry<K, V> {
    version: u64,
    node: Arc<Node<K, V>>,
}

impl<K: Copy, V> Clone for ChildEntry<K, V> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            node: self.node.clone(),
        }
    }
}

struct Node<K, V> {
    // One mask bit per 6-bit hash part; the two bitmaps never share a bit
    node_bitmap: u64,
    item_bitmap: u64,
    // Hash bits consumed to reach this node, excluding in-node indexing
    consumed_hash_bits: u32,
    // Both arrays are kept sorted by mask bit index and addressed by the
    // popcount of the bitmap prefix below the target bit
    children: Vec<ChildEntry<K, V>>,
    items: Vec<TrieItem<K, V>>,
}

impl<K: Copy, V> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        Self {
            node_bitmap: self.node_bitmap,
            item_bitmap: self.item_bitmap,
            consumed_hash_bits: self.consumed_hash_bits,
            children: self.children.clone(),
            items: self.items.clone(),
        }
    }
}

fn index_of(bitmap: u64, bit: u64) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

impl<K: TrieKey, V> Node<K, V> {
    fn new(consumed_hash_bits: u32) -> Self {
        Self {
            node_bitmap: 0,
            item_bitmap: 0,
            consumed_hash_bits,
            children: Vec::with_capacity(2),
            items: Vec::with_capacity(2),
        }
    }

    fn insert_item(&mut self, bit: u64, item: TrieItem<K, V>) {
        debug_assert_eq!((self.node_bitmap | self.item_bitmap) & bit, 0);
        self.items.insert(index_of(self.item_bitmap, bit), item);
        self.item_bitmap |= bit;
    }

    fn erase_item(&mut self, bit: u64) {
        debug_assert_ne!(self.item_bitmap & bit, 0);
        self.items.remove(index_of(self.item_bitmap, bit));
        self.item_bitmap ^= bit;
    }

    fn erase_child(&mut self, bit: u64) {
        debug_assert_ne!(self.node_bitmap & bit, 0);
        self.children.remove(index_of(self.node_bitmap, bit));
        self.node_bitmap ^= bit;
    }

    fn item_at_bit(&self, bit: u64) -> &TrieItem<K, V> {
        &self.items[index_of(self.item_bitmap, bit)]
    }

    fn child_at_bit(&self, bit: u64) -> &ChildEntry<K, V> {
        &self.children[index_of(self.node_bitmap, bit)]
    }

    /// Replaces the item indexed by `bit` with a one-level-deeper child
    /// node carrying that item. Returns the new child's array index.
    fn promote_item_to_node(&mut self, bit: u64, timeline: u64) -> usize {
        let item = self.items.remove(index_of(self.item_bitmap, bit));
        self.item_bitmap ^= bit;

        let mut child = Node::new(self.consumed_hash_bits + 6);
        let child_bit = 1u64 << ((item.key.hash64() << child.consumed_hash_bits) >> 58);
        child.insert_item(child_bit, item);

        let child_index = index_of(self.node_bitmap, bit);
        self.children.insert(
            child_index,
            ChildEntry {
                version: timeline,
                node: Arc::new(child),
            },
        );
        self.node_bitmap |= bit;
        child_index
    }

    /// Demotes the child indexed by `bit` back to a direct item when it
    /// holds exactly one item and no grandchildren; drops it when empty.
    fn try_shrink_child(&mut self, bit: u64) {
        let child = &self.child_at_bit(bit).node;

        if child.node_bitmap != 0 {
            // Can't shrink more than one level
            return;
        }

        if child.item_bitmap == 0 {
            self.erase_child(bit);
            return;
        }

        if child.item_bitmap & (child.item_bitmap - 1) == 0 {
            let item = child.items[0].clone();
            self.erase_child(bit);
            self.insert_item(bit, item);
        }
    }

    fn insert_rec(
        entry_version: &mut u64,
        entry_node: &mut Arc<Node<K, V>>,
        timeline: u64,
        key: K,
        value: Option<Arc<V>>,
        hash_bits: u64,
    ) -> bool {
        if *entry_version != timeline {
            // About to alter this node or its children, copy first.
            // Relies on the caller increasing the timeline between snapshots.
            *entry_node = Arc::new((**entry_node).clone());
            *entry_version = timeline;
        }
        let node = Arc::make_mut(entry_node);

        let bit = 1u64 << (hash_bits >> 58);
        let next_bits = hash_bits << 6;

        if node.node_bitmap & bit != 0 {
            let entry = &mut node.children[index_of(node.node_bitmap, bit)];
            return Self::insert_rec(
                &mut entry.version,
                &mut entry.node,
                timeline,
                key,
                value,
                next_bits,
            );
        }

        if node.item_bitmap & bit != 0 {
            let item_index = index_of(node.item_bitmap, bit);
            if node.items[item_index].key == key {
                node.items[item_index].version = timeline;
                node.items[item_index].value = value;
                return false;
            }

            debug_assert_ne!(
                node.items[item_index].key.hash64(),
                key.hash64(),
                "two distinct keys share a 64-bit hash"
            );

            // Hash prefix collision, push the stored item one level down
            let child_index = node.promote_item_to_node(bit, timeline);
            let entry = &mut node.children[child_index];
            return Self::insert_rec(
                &mut entry.version,
                &mut entry.node,
                timeline,
                key,
                value,
                next_bits,
            );
        }

        node.insert_item(
            bit,
            TrieItem {
                version: timeline,
                key,
                value,
            },
        );
        true
    }

    fn erase_rec(
        entry_version: &mut u64,
        entry_node: &mut Arc<Node<K, V>>,
        timeline: u64,
        key: K,
        hash_bits: u64,
    ) -> bool {
        let bit = 1u64 << (hash_bits >> 58);
        let next_bits = hash_bits << 6;

        if entry_node.item_bitmap & bit != 0 {
            if entry_node.item_at_bit(bit).key != key {
                return false;
            }

            if *entry_version != timeline {
                *entry_node = Arc::new((**entry_node).clone());
                *entry_version = timeline;
            }
            Arc::make_mut(entry_node).erase_item(bit);
            return true;
        }

        if entry_node.node_bitmap & bit == 0 {
            return false;
        }

        // Copying before knowing whether anything below will be erased;
        // altering child pointers without the copy would race readers.
        if *entry_version != timeline {
            *entry_node = Arc::new((**entry_node).clone());
            *entry_version = timeline;
        }
        let node = Arc::make_mut(entry_node);

        let entry = &mut node.children[index_of(node.node_bitmap, bit)];
        let erased = Self::erase_rec(&mut entry.version, &mut entry.node, timeline, key, next_bits);

        if erased {
            node.try_shrink_child(bit);
        }
        erased
    }

    /// First item (smallest hash) stored in this subtree
    fn find_first_item(&self) -> Option<&TrieItem<K, V>> {
        let mut combo_mask = self.node_bitmap | self.item_bitmap;
        let mut node_index = 0;

        while combo_mask != 0 {
            let bit = 1u64 << combo_mask.trailing_zeros();

            if self.item_bitmap & bit != 0 {
                // Items are bit-ordered, the first item bit reached is item 0
                return self.items.first();
            }

            if let Some(found) = self.children[node_index].node.find_first_item() {
                return Some(found);
            }

            combo_mask ^= bit;
            node_index += 1;
        }

        None
    }

    /// Next item in hash order after the position encoded by `hash_bits`
    fn find_next_item(&self, hash_bits: u64) -> Option<&TrieItem<K, V>> {
        let bit = 1u64 << (hash_bits >> 58);

        if self.node_bitmap & bit != 0 {
            if let Some(found) = self.child_at_bit(bit).node.find_next_item(hash_bits << 6) {
                return Some(found);
            }
        }

        if self.item_bitmap & bit != 0 {
            let item = self.item_at_bit(bit);

            // The first `consumed_hash_bits` of `hash_bits` are already
            // shifted out but are known equal to those of the item's hash
            let item_hash_bits = item.key.hash64() << self.consumed_hash_bits;
            if hash_bits < item_hash_bits {
                return Some(item);
            }
        }

        // Every remaining candidate is strictly after `bit`; the first
        // item of the remainder is the answer. Shift wraps to an empty
        // mask when `bit` is the topmost one.
        let mut combo_mask =
            (self.node_bitmap | self.item_bitmap) & !(bit.wrapping_shl(1).wrapping_sub(1));

        while combo_mask != 0 {
            let bit = 1u64 << combo_mask.trailing_zeros();

            if self.item_bitmap & bit != 0 {
                return Some(self.item_at_bit(bit));
            }

            if let Some(found) = self.child_at_bit(bit).node.find_first_item() {
                return Some(found);
            }

            combo_mask ^= bit;
        }

        None
    }

    fn visit_unary(
        &self,
        visitor: &mut dyn FnMut(&TrieItem<K, V>) -> bool,
    ) -> bool {
        let mut combo_mask = self.node_bitmap | self.item_bitmap;
        let mut node_index = 0;
        let mut item_index = 0;

        while combo_mask != 0 {
            let bit = 1u64 << combo_mask.trailing_zeros();

            if self.node_bitmap & bit != 0 {
                if !self.children[node_index].node.visit_unary(visitor) {
                    return false;
                }
                node_index += 1;
            } else {
                if !visitor(&self.items[item_index]) {
                    return false;
                }
                item_index += 1;
            }

            combo_mask ^= bit;
        }

        true
    }

    fn visit_diff_item_ordered(
        a: &TrieItem<K, V>,
        b: &TrieItem<K, V>,
        visitor: &mut dyn FnMut(Option<&TrieItem<K, V>>, Option<&TrieItem<K, V>>) -> bool,
    ) -> bool {
        if a.key == b.key {
            if a.version != b.version {
                return visitor(Some(a), Some(b));
            }
            return true;
        }

        // Distinct keys at the same trie position, order by hash
        if a.key.hash64() < b.key.hash64() {
            return visitor(Some(a), None) && visitor(None, Some(b));
        }
        visitor(None, Some(b)) && visitor(Some(a), None)
    }

    /// Diffs this subtree against a single item from the other snapshot.
    /// The visitor receives (subtree item, passed item).
    fn visit_diff_item(
        &self,
        item: &TrieItem<K, V>,
        visitor: &mut dyn FnMut(Option<&TrieItem<K, V>>, Option<&TrieItem<K, V>>) -> bool,
    ) -> bool {
        let item_bit = 1u64 << ((item.key.hash64() << self.consumed_hash_bits) >> 58);

        let mut combo_mask = self.node_bitmap | self.item_bitmap;
        let mut visited_item_bit = false;

        while combo_mask != 0 {
            let bit = 1u64 << combo_mask.trailing_zeros();

            if bit == item_bit {
                visited_item_bit = true;

                if self.node_bitmap & bit != 0 {
                    if !self.child_at_bit(bit).node.visit_diff_item(item, visitor) {
                        return false;
                    }
                } else if !Self::visit_diff_item_ordered(self.item_at_bit(bit), item, visitor) {
                    return false;
                }

                combo_mask ^= bit;
                continue;
            }

            if bit > item_bit && !visited_item_bit {
                visited_item_bit = true;
                if !visitor(None, Some(item)) {
                    return false;
                }
            }

            if self.node_bitmap & bit != 0 {
                let child = &self.child_at_bit(bit).node;
                if !child.visit_unary(&mut |it| visitor(Some(it), None)) {
                    return false;
                }
            } else if !visitor(Some(self.item_at_bit(bit)), None) {
                return false;
            }

            combo_mask ^= bit;
        }

        if visited_item_bit {
            true
        } else {
            visitor(None, Some(item))
        }
    }

    fn visit_diff_nodes(
        new_node: &Node<K, V>,
        old_node: &Node<K, V>,
        visitor: &mut dyn FnMut(Option<&TrieItem<K, V>>, Option<&TrieItem<K, V>>) -> bool,
    ) -> bool {
        let mut combo_mask = new_node.node_bitmap
            | new_node.item_bitmap
            | old_node.node_bitmap
            | old_node.item_bitmap;

        while combo_mask != 0 {
            let bit = 1u64 << combo_mask.trailing_zeros();
            combo_mask ^= bit;

            let new_has_node = new_node.node_bitmap & bit != 0;
            let new_has_item = new_node.item_bitmap & bit != 0;
            let old_has_node = old_node.node_bitmap & bit != 0;
            let old_has_item = old_node.item_bitmap & bit != 0;

            let ok = match (new_has_node, new_has_item, old_has_node, old_has_item) {
                (false, true, false, true) => Self::visit_diff_item_ordered(
                    new_node.item_at_bit(bit),
                    old_node.item_at_bit(bit),
                    visitor,
                ),
                (false, true, true, false) => {
                    // New side has a direct item, old side a subtree;
                    // swap arguments so new stays on the left
                    let new_item = new_node.item_at_bit(bit);
                    old_node
                        .child_at_bit(bit)
                        .node
                        .visit_diff_item(new_item, &mut |n, p| visitor(p, n))
                }
                (false, true, false, false) => visitor(Some(new_node.item_at_bit(bit)), None),
                (true, false, false, true) => new_node
                    .child_at_bit(bit)
                    .node
                    .visit_diff_item(old_node.item_at_bit(bit), visitor),
                (true, false, true, false) => {
                    let new_child = new_node.child_at_bit(bit);
                    let old_child = old_node.child_at_bit(bit);

                    // Shared subtrees are skipped entirely
                    if new_child.version == old_child.version
                        || Arc::ptr_eq(&new_child.node, &old_child.node)
                    {
                        true
                    } else {
                        Self::visit_diff_nodes(&new_child.node, &old_child.node, visitor)
                    }
                }
                (true, false, false, false) => new_node
                    .child_at_bit(bit)
                    .node
                    .visit_unary(&mut |it| visitor(Some(it), None)),
                (false, false, false, true) => visitor(None, Some(old_node.item_at_bit(bit))),
                (false, false, true, false) => old_node
                    .child_at_bit(bit)
                    .node
                    .visit_unary(&mut |it| visitor(None, Some(it))),
                _ => unreachable!("bitmaps of one node are mutually exclusive"),
            };

            if !ok {
                return false;
            }
        }

        true
    }
}

struct RootEntry<K, V> {
    version: u64,
    node: Option<Arc<Node<K, V>>>,
}

impl<K: Copy, V> Clone for RootEntry<K, V> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            node: self.node.clone(),
        }
    }
}

/// See the module documentation for the versioning discipline.
pub struct VersionedHashTrie<K: TrieKey, V> {
    roots: [RootEntry<K, V>; NUM_ROOT_NODES],
    len: usize,
}

impl<K: TrieKey, V> Default for VersionedHashTrie<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TrieKey, V> Clone for VersionedHashTrie<K, V> {
    fn clone(&self) -> Self {
        Self {
            roots: self.roots.clone(),
            len: self.len,
        }
    }
}

impl<K: TrieKey, V> VersionedHashTrie<K, V> {
    pub fn new() -> Self {
        Self {
            roots: std::array::from_fn(|_| RootEntry {
                version: 0,
                node: None,
            }),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts or overwrites `key`. `value` may be `None` to record a
    /// key with no value attached.
    pub fn insert(&mut self, timeline: u64, key: K, value: Option<Arc<V>>) {
        let hash = key.hash64();
        let root = &mut self.roots[(hash >> (64 - ROOT_NODES_LOG2)) as usize];
        let hash_bits = hash << ROOT_NODES_LOG2;

        if root.node.is_none() {
            root.node = Some(Arc::new(Node::new(ROOT_NODES_LOG2)));
            root.version = timeline;
        }

        let inserted = Node::insert_rec(
            &mut root.version,
            root.node.as_mut().unwrap(),
            timeline,
            key,
            value,
            hash_bits,
        );
        if inserted {
            self.len += 1;
        }
    }

    pub fn erase(&mut self, timeline: u64, key: K) {
        let hash = key.hash64();
        let root = &mut self.roots[(hash >> (64 - ROOT_NODES_LOG2)) as usize];
        let hash_bits = hash << ROOT_NODES_LOG2;

        if root.node.is_some()
            && Node::erase_rec(
                &mut root.version,
                root.node.as_mut().unwrap(),
                timeline,
                key,
                hash_bits,
            )
        {
            self.len -= 1;
        }
    }

    pub fn find(&self, key: K) -> Option<&TrieItem<K, V>> {
        let hash = key.hash64();
        let mut node = self.roots[(hash >> (64 - ROOT_NODES_LOG2)) as usize]
            .node
            .as_deref()?;
        let mut hash_bits = hash << ROOT_NODES_LOG2;

        loop {
            let bit = 1u64 << (hash_bits >> 58);
            hash_bits <<= 6;

            if node.item_bitmap & bit != 0 {
                let item = node.item_at_bit(bit);
                return (item.key == key).then_some(item);
            }

            if node.node_bitmap & bit == 0 {
                return None;
            }

            node = node.child_at_bit(bit).node.as_ref();
        }
    }

    /// First item in hash order
    pub fn find_first(&self) -> Option<&TrieItem<K, V>> {
        self.roots
            .iter()
            .filter_map(|root| root.node.as_deref())
            .find_map(Node::find_first_item)
    }

    /// Next item in hash order after `key`
    pub fn find_next(&self, key: K) -> Option<&TrieItem<K, V>> {
        let hash = key.hash64();
        let root_index = (hash >> (64 - ROOT_NODES_LOG2)) as usize;
        let hash_bits = hash << ROOT_NODES_LOG2;

        if let Some(node) = self.roots[root_index].node.as_deref() {
            if let Some(found) = node.find_next_item(hash_bits) {
                return Some(found);
            }
        }

        self.roots[root_index + 1..]
            .iter()
            .filter_map(|root| root.node.as_deref())
            .find_map(Node::find_first_item)
    }

    /// Walks the difference against an older snapshot, yielding
    /// `(new_item, old_item)` pairs: `(Some, None)` for additions,
    /// `(None, Some)` for removals and `(Some, Some)` for changed values.
    /// Unchanged shared subtrees are skipped without descending. The
    /// visitor returns `false` to stop the walk early.
    pub fn visit_diff<F>(&self, old: &Self, mut visitor: F)
    where
        F: FnMut(Option<&TrieItem<K, V>>, Option<&TrieItem<K, V>>) -> bool,
    {
        for i in 0..NUM_ROOT_NODES {
            if self.roots[i].version == old.roots[i].version {
                continue;
            }

            let keep_going = match (self.roots[i].node.as_deref(), old.roots[i].node.as_deref()) {
                (None, None) => true,
                (Some(new_node), None) => {
                    new_node.visit_unary(&mut |it| visitor(Some(it), None))
                }
                (None, Some(old_node)) => {
                    old_node.visit_unary(&mut |it| visitor(None, Some(it)))
                }
                (Some(new_node), Some(old_node)) => {
                    Node::visit_diff_nodes(new_node, old_node, &mut visitor)
                }
            };

            if !keep_going {
                return;
            }
        }
    }
}
