//! Spatial index over chunk keys with per-tick copy-on-write.
//!
//! Six levels, root-first: a fixed XZ root grid, a tri-quadtree root
//! node (8x8 XZ), a tri-quadtree bridge node (8x8 XZ with separate
//! positive/negative Y halves), duoctree nodes of 256/64/16/4 chunks
//! (4x4x4 subdivision with stop-level entries for even LOD scales and a
//! sub-node selector for odd ones), and chunk leaves.
//!
//! Mutating accessors take the current tick: any node recorded at an
//! older tick is cloned before modification, so previously shared
//! snapshots keep observing their own version. Only one thread mutates
//! a tree at a time; concurrent readers hold snapshot clones.

use std::sync::Arc;

use glam::IVec3;

use super::chunk_key::ChunkKey;
use super::consts as Consts;
use super::tree_path::{
    component_child_bit, component_key_mask_bit, component_stop_bit, component_y_negative,
    path_component, root_item_min_coord,
};
use crate::world::TickId;

const NUM_ROOT_ITEMS: usize =
    (Consts::STORAGE_TREE_ROOT_ITEMS_X * Consts::STORAGE_TREE_ROOT_ITEMS_Z) as usize;

/// Payload configuration of a storage tree: one data type stored at
/// chunk leaves, another at duoctree (aggregate) stop levels.
pub trait TreePayload: 'static {
    type Chunk: Default + Clone + Send + Sync;
    type Agg: Default + Clone + Send + Sync;
}

/// Mutable access result: chunk-level or aggregate-level payload
pub enum TreeDataMut<'a, P: TreePayload> {
    Chunk(&'a mut P::Chunk),
    Aggregate(&'a mut P::Agg),
}

pub enum TreeDataRef<'a, P: TreePayload> {
    Chunk(&'a P::Chunk),
    Aggregate(&'a P::Agg),
}

impl<'a, P: TreePayload> TreeDataRef<'a, P> {
    pub fn as_chunk(&self) -> Option<&'a P::Chunk> {
        match self {
            TreeDataRef::Chunk(data) => Some(*data),
            TreeDataRef::Aggregate(_) => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&'a P::Agg> {
        match self {
            TreeDataRef::Chunk(_) => None,
            TreeDataRef::Aggregate(data) => Some(*data),
        }
    }
}

/// Tick-stamped shared pointer to a tree node
struct NodePtr<T> {
    tick: TickId,
    node: Arc<T>,
}

impl<T> Clone for NodePtr<T> {
    fn clone(&self) -> Self {
        Self {
            tick: self.tick,
            node: self.node.clone(),
        }
    }
}

impl<T: Clone> NodePtr<T> {
    fn new(tick: TickId, node: T) -> Self {
        Self {
            tick,
            node: Arc::new(node),
        }
    }

    /// Clones the node if it was recorded at an older tick. After this
    /// call the node is exclusively owned by the current tick's tree.
    fn make_recent(&mut self, tick: TickId) {
        if self.tick < tick {
            self.node = Arc::new((*self.node).clone());
            self.tick = tick;
        }
    }
}

trait TreeNode<P: TreePayload>: Clone + Send + Sync {
    const SIZE_CHUNKS: i32;
    const PATH_BYTE: u32;

    fn new(min_coord: IVec3) -> Self;
    fn access<'a>(&'a mut self, tree_path: u64, tick: TickId) -> TreeDataMut<'a, P>;
    fn remove(&mut self, tree_path: u64, tick: TickId);
    fn lookup<'a>(&'a self, tree_path: u64) -> Option<TreeDataRef<'a, P>>;
    fn is_empty(&self) -> bool;
}

// --- Chunk leaf ---

struct ChunkNode<P: TreePayload> {
    key: ChunkKey,
    data: P::Chunk,
}

impl<P: TreePayload> Clone for ChunkNode<P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            data: self.data.clone(),
        }
    }
}

impl<P: TreePayload> TreeNode<P> for ChunkNode<P> {
    const SIZE_CHUNKS: i32 = 1;
    const PATH_BYTE: u32 = 0;

    fn new(min_coord: IVec3) -> Self {
        Self {
            key: ChunkKey::new(min_coord, 0),
            data: P::Chunk::default(),
        }
    }

    fn access<'a>(&'a mut self, _tree_path: u64, _tick: TickId) -> TreeDataMut<'a, P> {
        TreeDataMut::Chunk(&mut self.data)
    }

    fn remove(&mut self, _tree_path: u64, _tick: TickId) {}

    fn lookup<'a>(&'a self, _tree_path: u64) -> Option<TreeDataRef<'a, P>> {
        Some(TreeDataRef::Chunk(&self.data))
    }

    fn is_empty(&self) -> bool {
        // A chunk reached by a removal is the thing being removed
        true
    }
}

// --- Duoctree levels ---

/// 4x4x4 subdivision node. Besides child pointers it stores one
/// aggregate payload for stop-level entries, with `live_key_mask`
/// tracking which entries exist: bits 0..=7 per odd-scale sub-node,
/// bit 8 for the even-scale direct entry.
struct DuoctreeNode<P: TreePayload, Child> {
    key: ChunkKey,
    live_key_mask: u32,
    child_mask: u64,
    children: Vec<NodePtr<Child>>,
    data: P::Agg,
}

impl<P: TreePayload, Child> Clone for DuoctreeNode<P, Child> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            live_key_mask: self.live_key_mask,
            child_mask: self.child_mask,
            children: self.children.clone(),
            data: self.data.clone(),
        }
    }
}

impl<P: TreePayload, Child: TreeNode<P>> DuoctreeNode<P, Child> {
    fn child_index(&self, child_bit: u64) -> usize {
        (self.child_mask & (child_bit - 1)).count_ones() as usize
    }

    fn child_min_coord(&self, child_id: u64) -> IVec3 {
        let x_off = ((child_id >> 4) & 1) * 2 + ((child_id >> 1) & 1);
        let y_off = ((child_id >> 5) & 1) * 2 + ((child_id >> 2) & 1);
        let z_off = ((child_id >> 3) & 1) * 2 + (child_id & 1);

        self.key.base()
            + IVec3::new(x_off as i32, y_off as i32, z_off as i32) * Child::SIZE_CHUNKS
    }
}

impl<P: TreePayload, Child: TreeNode<P>> TreeNode<P> for DuoctreeNode<P, Child> {
    const SIZE_CHUNKS: i32 = 4 * Child::SIZE_CHUNKS;
    const PATH_BYTE: u32 = Child::PATH_BYTE + 1;

    fn new(min_coord: IVec3) -> Self {
        Self {
            key: ChunkKey::new(min_coord, Self::SIZE_CHUNKS.trailing_zeros()),
            live_key_mask: 0,
            child_mask: 0,
            children: Vec::new(),
            data: P::Agg::default(),
        }
    }

    fn access<'a>(&'a mut self, tree_path: u64, tick: TickId) -> TreeDataMut<'a, P> {
        let component = path_component(tree_path, Self::PATH_BYTE);

        if component_stop_bit(component) {
            // The key terminates at this level
            self.live_key_mask |= component_key_mask_bit(tree_path, component);
            return TreeDataMut::Aggregate(&mut self.data);
        }

        let child_bit = component_child_bit(component);
        let index = self.child_index(child_bit);

        if self.child_mask & child_bit == 0 {
            let child_min = self.child_min_coord(component & 63);
            self.children.insert(index, NodePtr::new(tick, Child::new(child_min)));
            self.child_mask |= child_bit;
        }

        let ptr = &mut self.children[index];
        ptr.make_recent(tick);
        Arc::make_mut(&mut ptr.node).access(tree_path, tick)
    }

    fn remove(&mut self, tree_path: u64, tick: TickId) {
        let component = path_component(tree_path, Self::PATH_BYTE);

        if component_stop_bit(component) {
            self.live_key_mask &= !component_key_mask_bit(tree_path, component);
            return;
        }

        let child_bit = component_child_bit(component);
        if self.child_mask & child_bit == 0 {
            return;
        }

        let index = self.child_index(child_bit);
        let ptr = &mut self.children[index];
        ptr.make_recent(tick);

        let child = Arc::make_mut(&mut ptr.node);
        child.remove(tree_path, tick);

        if child.is_empty() {
            self.children.remove(index);
            self.child_mask ^= child_bit;
        }
    }

    fn lookup<'a>(&'a self, tree_path: u64) -> Option<TreeDataRef<'a, P>> {
        let component = path_component(tree_path, Self::PATH_BYTE);

        if component_stop_bit(component) {
            let key_bit = component_key_mask_bit(tree_path, component);
            return (self.live_key_mask & key_bit != 0).then_some(TreeDataRef::Aggregate(&self.data));
        }

        let child_bit = component_child_bit(component);
        if self.child_mask & child_bit == 0 {
            return None;
        }

        self.children[self.child_index(child_bit)].node.lookup(tree_path)
    }

    fn is_empty(&self) -> bool {
        self.live_key_mask == 0 && self.child_mask == 0
    }
}

// --- Tri-quadtree levels ---

/// 8x8 XZ subdivision node. With `HILO` set the node splits Y into a
/// positive and a negative half with separate child masks; children of
/// the negative half are stored after those of the positive one.
struct TriquadtreeNode<P: TreePayload, Child, const HILO: bool> {
    min_x: i32,
    min_z: i32,
    child_mask: [u64; 2],
    children: Vec<NodePtr<Child>>,
    _payload: std::marker::PhantomData<fn() -> P>,
}

impl<P: TreePayload, Child, const HILO: bool> Clone for TriquadtreeNode<P, Child, HILO> {
    fn clone(&self) -> Self {
        Self {
            min_x: self.min_x,
            min_z: self.min_z,
            child_mask: self.child_mask,
            children: self.children.clone(),
            _payload: std::marker::PhantomData,
        }
    }
}

impl<P: TreePayload, Child: TreeNode<P>, const HILO: bool> TriquadtreeNode<P, Child, HILO> {
    /// Mask selector plus storage offset for one path component
    fn mask_and_offset(&self, component: u64) -> (usize, usize) {
        if HILO && component_y_negative(component) {
            (1, self.child_mask[0].count_ones() as usize)
        } else {
            (0, 0)
        }
    }

    fn child_min_coord(&self, child_id: u64, y_negative: bool) -> IVec3 {
        let x_off = ((child_id >> 5) & 1) * 4 + ((child_id >> 3) & 1) * 2 + ((child_id >> 1) & 1);
        let z_off = ((child_id >> 4) & 1) * 4 + ((child_id >> 2) & 1) * 2 + (child_id & 1);

        IVec3::new(
            self.min_x + Child::SIZE_CHUNKS * x_off as i32,
            if y_negative { -Child::SIZE_CHUNKS } else { 0 },
            self.min_z + Child::SIZE_CHUNKS * z_off as i32,
        )
    }
}

impl<P: TreePayload, Child: TreeNode<P>, const HILO: bool> TreeNode<P>
    for TriquadtreeNode<P, Child, HILO>
{
    const SIZE_CHUNKS: i32 = 8 * Child::SIZE_CHUNKS;
    const PATH_BYTE: u32 = Child::PATH_BYTE + 1;

    fn new(min_coord: IVec3) -> Self {
        Self {
            min_x: min_coord.x,
            min_z: min_coord.z,
            child_mask: [0; 2],
            children: Vec::new(),
            _payload: std::marker::PhantomData,
        }
    }

    fn access<'a>(&'a mut self, tree_path: u64, tick: TickId) -> TreeDataMut<'a, P> {
        let component = path_component(tree_path, Self::PATH_BYTE);
        let child_bit = component_child_bit(component);
        let y_negative = HILO && component_y_negative(component);

        let (mask_index, storage_offset) = self.mask_and_offset(component);
        let mask = self.child_mask[mask_index];
        let index = storage_offset + (mask & (child_bit - 1)).count_ones() as usize;

        if mask & child_bit == 0 {
            let child_min = self.child_min_coord(component & 63, y_negative);
            self.children.insert(index, NodePtr::new(tick, Child::new(child_min)));
            self.child_mask[mask_index] |= child_bit;
        }

        let ptr = &mut self.children[index];
        ptr.make_recent(tick);
        Arc::make_mut(&mut ptr.node).access(tree_path, tick)
    }

    fn remove(&mut self, tree_path: u64, tick: TickId) {
        let component = path_component(tree_path, Self::PATH_BYTE);
        let child_bit = component_child_bit(component);

        let (mask_index, storage_offset) = self.mask_and_offset(component);
        let mask = self.child_mask[mask_index];
        if mask & child_bit == 0 {
            return;
        }

        let index = storage_offset + (mask & (child_bit - 1)).count_ones() as usize;
        let ptr = &mut self.children[index];
        ptr.make_recent(tick);

        let child = Arc::make_mut(&mut ptr.node);
        child.remove(tree_path, tick);

        if child.is_empty() {
            self.children.remove(index);
            self.child_mask[mask_index] ^= child_bit;
        }
    }

    fn lookup<'a>(&'a self, tree_path: u64) -> Option<TreeDataRef<'a, P>> {
        let component = path_component(tree_path, Self::PATH_BYTE);
        let child_bit = component_child_bit(component);

        let (mask_index, storage_offset) = self.mask_and_offset(component);
        let mask = self.child_mask[mask_index];
        if mask & child_bit == 0 {
            return None;
        }

        let index = storage_offset + (mask & (child_bit - 1)).count_ones() as usize;
        self.children[index].node.lookup(tree_path)
    }

    fn is_empty(&self) -> bool {
        self.child_mask[0] == 0 && self.child_mask[1] == 0
    }
}

type DuoctreeX4<P> = DuoctreeNode<P, ChunkNode<P>>;
type DuoctreeX16<P> = DuoctreeNode<P, DuoctreeX4<P>>;
type DuoctreeX64<P> = DuoctreeNode<P, DuoctreeX16<P>>;
type DuoctreeX256<P> = DuoctreeNode<P, DuoctreeX64<P>>;
type BridgeNode<P> = TriquadtreeNode<P, DuoctreeX256<P>, true>;
type RootNode<P> = TriquadtreeNode<P, BridgeNode<P>, false>;

/// The spatial index itself. Cloning is cheap and yields an immutable
/// snapshot sharing all untouched subtrees.
pub struct StorageTree<P: TreePayload> {
    root_items: Vec<Option<NodePtr<RootNode<P>>>>,
}

impl<P: TreePayload> Clone for StorageTree<P> {
    fn clone(&self) -> Self {
        Self {
            root_items: self.root_items.clone(),
        }
    }
}

impl<P: TreePayload> Default for StorageTree<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TreePayload> StorageTree<P> {
    pub fn new() -> Self {
        Self {
            root_items: (0..NUM_ROOT_ITEMS).map(|_| None).collect(),
        }
    }

    /// Walks to the entry at `tree_path`, creating and copy-on-writing
    /// nodes along the way, and returns its payload for writing.
    pub fn access(&mut self, tree_path: u64, tick: TickId) -> TreeDataMut<'_, P> {
        let root_index = (tree_path >> 56) as usize;
        let slot = &mut self.root_items[root_index];

        match slot {
            Some(ptr) => ptr.make_recent(tick),
            None => {
                *slot = Some(NodePtr::new(
                    tick,
                    RootNode::new(root_item_min_coord(root_index as u32)),
                ));
            }
        }

        let ptr = slot.as_mut().unwrap();
        Arc::make_mut(&mut ptr.node).access(tree_path, tick)
    }

    /// Erases the entry at `tree_path`, releasing emptied subtrees
    pub fn remove(&mut self, tree_path: u64, tick: TickId) {
        let root_index = (tree_path >> 56) as usize;
        let Some(ptr) = &mut self.root_items[root_index] else {
            return;
        };

        ptr.make_recent(tick);
        let node = Arc::make_mut(&mut ptr.node);
        node.remove(tree_path, tick);

        if node.is_empty() {
            self.root_items[root_index] = None;
        }
    }

    /// Non-mutating descent; `None` if nothing is stored at the path
    pub fn lookup(&self, tree_path: u64) -> Option<TreeDataRef<'_, P>> {
        let ptr = self.root_items[(tree_path >> 56) as usize].as_ref()?;
        ptr.node.lookup(tree_path)
    }

    /// Share-as-much-as-possible refresh from `other`: root subtrees
    /// whose tick advanced are adopted by pointer, invoking `refreshed`
    /// for each; subtrees dropped from the source are dropped here too.
    pub fn copy_from<F>(&mut self, other: &Self, mut refreshed: F)
    where
        F: FnMut(u32, TickId),
    {
        for index in 0..NUM_ROOT_ITEMS {
            let my_tick = self.root_items[index].as_ref().map(|p| p.tick);
            let other_tick = other.root_items[index].as_ref().map(|p| p.tick);

            if other_tick > my_tick {
                self.root_items[index] = other.root_items[index].clone();
                refreshed(index as u32, other_tick.unwrap());
            } else if other_tick.is_none() && my_tick.is_some() {
                self.root_items[index] = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::land::tree_path::key_to_tree_path;
    use rand::{Rng, SeedableRng};
    use std::cell::Cell;

    thread_local! {
        static LIVE_PROBES: Cell<i64> = const { Cell::new(0) };
    }

    struct Probe {
        stamp: u64,
    }

    impl Default for Probe {
        fn default() -> Self {
            LIVE_PROBES.with(|c| c.set(c.get() + 1));
            Self { stamp: 0 }
        }
    }

    impl Clone for Probe {
        fn clone(&self) -> Self {
            LIVE_PROBES.with(|c| c.set(c.get() + 1));
            Self { stamp: self.stamp }
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            LIVE_PROBES.with(|c| c.set(c.get() - 1));
        }
    }

    struct ProbePayload;
    impl TreePayload for ProbePayload {
        type Chunk = Probe;
        type Agg = Probe;
    }

    fn unique_paths(num: usize, rng: &mut impl Rng) -> Vec<u64> {
        use crate::land::consts as Consts;

        let mut seen = std::collections::HashSet::new();
        let mut paths = Vec::with_capacity(num);

        while paths.len() < num {
            let scale = rng.gen_range(0..Consts::NUM_LOD_SCALES);
            let mask = !((1u32 << scale) - 1) as i32;

            let key = ChunkKey {
                x: rng.gen_range(Consts::MIN_UNIQUE_WORLD_X_CHUNK * 2..=Consts::MAX_UNIQUE_WORLD_X_CHUNK * 2) & mask,
                y: rng.gen_range(Consts::MIN_WORLD_Y_CHUNK..=Consts::MAX_WORLD_Y_CHUNK) & mask,
                z: rng.gen_range(Consts::MIN_UNIQUE_WORLD_Z_CHUNK * 2..=Consts::MAX_UNIQUE_WORLD_Z_CHUNK * 2) & mask,
                scale_log2: scale,
            };

            let path = key_to_tree_path(key).expect("generated key must be valid");
            if seen.insert(path) {
                paths.push(path);
            }
        }

        paths
    }

    #[test]
    fn test_insert_epochs_and_teardown() {
        {
            let mut tree = StorageTree::<ProbePayload>::new();
            let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xDEADBEEF + 1);
            let mut paths = unique_paths(3000, &mut rng);

            for epoch in 1..=4i64 {
                let tick = TickId(epoch);
                for &path in &paths {
                    match tree.access(path, tick) {
                        TreeDataMut::Chunk(data) => data.stamp = epoch as u64,
                        TreeDataMut::Aggregate(data) => data.stamp = epoch as u64,
                    }
                }

                use rand::seq::SliceRandom;
                paths.shuffle(&mut rng);
            }

            for &path in &paths {
                let stamp = match tree.lookup(path).expect("inserted path must be found") {
                    TreeDataRef::Chunk(data) => data.stamp,
                    TreeDataRef::Aggregate(data) => data.stamp,
                };
                assert_eq!(stamp, 4);
            }
        }

        // Every payload constructed by the tree must be destroyed with it
        assert_eq!(LIVE_PROBES.with(|c| c.get()), 0);
    }

    #[test]
    fn test_lookup_misses() {
        let mut tree = StorageTree::<ProbePayload>::new();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xDEADBEEF + 2);
        let paths = unique_paths(2000, &mut rng);

        let tick = TickId(1);
        for &path in paths.iter().step_by(2) {
            tree.access(path, tick);
        }

        for (i, &path) in paths.iter().enumerate() {
            let found = tree.lookup(path).is_some();
            assert_eq!(found, i % 2 == 0, "path index {i}");
        }
    }

    #[test]
    fn test_remove_epochs() {
        {
            let mut tree = StorageTree::<ProbePayload>::new();
            let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xDEADBEEF + 3);
            let mut paths = unique_paths(2000, &mut rng);

            for epoch in 1..=3i64 {
                let tick = TickId(epoch);

                for &path in &paths {
                    tree.remove(path, tick);
                    assert!(tree.lookup(path).is_none());
                }

                // Everything was just removed, tree fully collapsed
                assert_eq!(LIVE_PROBES.with(|c| c.get()), 0);

                for &path in &paths {
                    tree.access(path, tick);
                    assert!(tree.lookup(path).is_some());
                }

                use rand::seq::SliceRandom;
                paths.shuffle(&mut rng);
            }
        }

        assert_eq!(LIVE_PROBES.with(|c| c.get()), 0);
    }

    #[test]
    fn test_cow_across_ticks() {
        let path = key_to_tree_path(ChunkKey::new(IVec3::ZERO, 0)).unwrap();

        let mut tree1 = StorageTree::<ProbePayload>::new();
        match tree1.access(path, TickId(1)) {
            TreeDataMut::Chunk(data) => data.stamp = 111,
            _ => panic!("LOD 0 key must resolve to chunk data"),
        }

        let mut tree2 = tree1.clone();

        // Before any write both trees expose the same storage
        let p1 = tree1.lookup(path).unwrap().as_chunk().unwrap() as *const Probe;
        let p2 = tree2.lookup(path).unwrap().as_chunk().unwrap() as *const Probe;
        assert_eq!(p1, p2);

        // Writing at a newer tick clones the path, the original stays
        match tree2.access(path, TickId(2)) {
            TreeDataMut::Chunk(data) => {
                assert_eq!(data.stamp, 111);
                data.stamp = 222;
            }
            _ => unreachable!(),
        }

        let p2_after = tree2.lookup(path).unwrap().as_chunk().unwrap() as *const Probe;
        assert_ne!(p1, p2_after);

        let original = tree1.lookup(path).unwrap().as_chunk().unwrap();
        assert_eq!(original.stamp, 111);
        let copied = tree2.lookup(path).unwrap().as_chunk().unwrap();
        assert_eq!(copied.stamp, 222);
    }

    #[test]
    fn test_same_tick_access_no_copy() {
        let path = key_to_tree_path(ChunkKey::new(IVec3::new(4, 0, 4), 2)).unwrap();

        let mut tree = StorageTree::<ProbePayload>::new();
        let tick = TickId(7);

        let p1 = match tree.access(path, tick) {
            TreeDataMut::Aggregate(data) => data as *const Probe,
            _ => panic!("LOD 2 key must resolve to aggregate data"),
        };
        let p2 = match tree.access(path, tick) {
            TreeDataMut::Aggregate(data) => data as *const Probe,
            _ => unreachable!(),
        };
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_odd_and_even_lod_share_node() {
        // Scale 1 and scale 2 keys of the same region land in the same
        // duoctree node but track separate live entries
        let even = key_to_tree_path(ChunkKey::new(IVec3::ZERO, 2)).unwrap();
        let odd = key_to_tree_path(ChunkKey::new(IVec3::ZERO, 1)).unwrap();

        let mut tree = StorageTree::<ProbePayload>::new();
        let tick = TickId(1);

        tree.access(even, tick);
        assert!(tree.lookup(even).is_some());
        assert!(tree.lookup(odd).is_none());

        tree.access(odd, tick);
        assert!(tree.lookup(odd).is_some());

        tree.remove(even, tick);
        assert!(tree.lookup(even).is_none());
        assert!(tree.lookup(odd).is_some());

        tree.remove(odd, tick);
        assert!(tree.lookup(odd).is_none());
    }

    #[test]
    fn test_copy_from_shares_subtrees() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xDEADBEEF + 4);
        let paths = unique_paths(500, &mut rng);

        let mut source = StorageTree::<ProbePayload>::new();
        for &path in &paths {
            source.access(path, TickId(1));
        }

        let mut target = StorageTree::<ProbePayload>::new();
        let mut refreshed = 0;
        target.copy_from(&source, |_, tick| {
            assert_eq!(tick, TickId(1));
            refreshed += 1;
        });
        assert!(refreshed > 0);

        for &path in &paths {
            let a = source.lookup(path).unwrap();
            let b = target.lookup(path).unwrap();
            let pa = match a {
                TreeDataRef::Chunk(d) => d as *const Probe,
                TreeDataRef::Aggregate(d) => d as *const Probe,
            };
            let pb = match b {
                TreeDataRef::Chunk(d) => d as *const Probe,
                TreeDataRef::Aggregate(d) => d as *const Probe,
            };
            assert_eq!(pa, pb, "copy_from must share storage");
        }

        // A second copy with no source changes refreshes nothing
        let mut refreshed = 0;
        target.copy_from(&source, |_, _| refreshed += 1);
        assert_eq!(refreshed, 0);
    }
}
