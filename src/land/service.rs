//! Land service: drives chunk loading, pseudo-chunk data and impostor
//! surface generation around registered chunk tickets.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use glam::{DVec3, IVec3};
use parking_lot::Mutex;

use super::chunk::{Chunk, ChunkAdjacency, PseudoChunkData, PseudoChunkSurface};
use super::chunk_key::ChunkKey;
use super::consts as Consts;
use super::state::LandState;
use super::storage_tree::TreeDataMut;
use super::ticket::{
    ChunkTicket, ChunkTicketArea, ChunkTicketAdjustMessage, ChunkTicketRemoveMessage,
    ChunkTicketRequestMessage,
};
use super::tree_path::key_to_tree_path;
use crate::core::{Uid, UidRegistry};
use crate::svc::{
    Message, MessageQueue, MessageSender, MessagingService, TaskBuilder, TaskService,
};
use crate::util::{ConcentricOctahedraWalker, LruVisitOrdering};
use crate::world::TickId;

/// Keys unreferenced by any ticket for this many ticks become eligible
/// for cleanup
const STALE_CHUNK_AGE_THRESHOLD: i64 = 750;
/// Cleanup sweep budget per tick
const CLEANUP_VISITS_PER_TICK: usize = 1000;
const KEYS_PER_TICK: usize = usize::MAX;

// --- Terrain surface function ---

const Y_BAND_LIMIT: f64 = 90.0;

fn surface_fn(point: DVec3) -> f64 {
    const OCTAVES: [(f64, f64, f64, f64); 5] = [
        (4.0, 0.5, 0.03, 0.09),
        (8.0, 3.5, -0.013, 0.048),
        (16.0, 14.1, 0.0095, -0.0205),
        (12.0, -7.5, -0.08, 0.0333),
        (64.0, 7.65, 0.007, 0.0032),
    ];

    let mut value = 0.0;
    for (amp, phi, fx, fz) in OCTAVES {
        value += amp * (phi + point.x * fx + point.z * fz).sin();
    }
    value
}

/// Samples the surface function over the key's volume. `None` means the
/// chunk is entirely air; a fully buried chunk comes back uniform.
fn generate_chunk(key: ChunkKey) -> Option<Arc<Chunk>> {
    const BLOCKS: i32 = Consts::CHUNK_SIZE_BLOCKS;

    let first_block = key.base() * BLOCKS;

    // Quick check against the fully-above / fully-below band
    let y_min = first_block.y as f64 * Consts::BLOCK_SIZE_METRES;
    if y_min > Y_BAND_LIMIT {
        return None;
    }

    let y_max = (first_block.y + (BLOCKS << key.scale_log2)) as f64 * Consts::BLOCK_SIZE_METRES;
    if y_max < -Y_BAND_LIMIT {
        let mut chunk = Chunk::new();
        chunk.set_all_blocks_uniform(1);
        return Some(Arc::new(chunk));
    }

    let step = key.scale_multiplier();
    let half_step = step as f64 * 0.5;

    let mut ids = Box::new([0u16; Consts::CHUNK_VOLUME_BLOCKS]);
    let mut empty = true;
    let mut index = 0;

    for y in 0..BLOCKS {
        for x in 0..BLOCKS {
            for z in 0..BLOCKS {
                let block = first_block + IVec3::new(x, y, z) * step;
                let block_world =
                    (block.as_dvec3() + half_step) * Consts::BLOCK_SIZE_METRES;

                if surface_fn(block_world) > block_world.y {
                    empty = false;
                    ids[index] = 1;
                }
                index += 1;
            }
        }
    }

    if empty {
        return None;
    }

    let mut chunk = Chunk::new();
    chunk.set_all_blocks(ids);
    Some(Arc::new(chunk))
}

// --- Completion messages posted by terrain jobs ---

struct ChunkLoadCompletionMessage {
    key: ChunkKey,
    value_ptr: Option<Arc<Chunk>>,
}

impl Message for ChunkLoadCompletionMessage {
    const MESSAGE_UID: Uid = Uid::parse("3fe5c4f7-9db2a3da-cdf92c68-91e567fa");
}

struct PseudoChunkDataGenCompletionMessage {
    key: ChunkKey,
    value_ptr: Option<Arc<PseudoChunkData>>,
}

impl Message for PseudoChunkDataGenCompletionMessage {
    const MESSAGE_UID: Uid = Uid::parse("921efbbd-863d267a-f4063130-218f6b30");
}

struct PseudoChunkSurfaceGenCompletionMessage {
    key: ChunkKey,
    value_ptr: Option<Arc<PseudoChunkSurface>>,
}

impl Message for PseudoChunkSurfaceGenCompletionMessage {
    const MESSAGE_UID: Uid = Uid::parse("d4c5572d-9655ada3-83ea228d-46c278c4");
}

// --- Terrain jobs, executed on task workers ---

fn job_load_chunk(key: ChunkKey, sender: &MessageSender) {
    debug_assert_eq!(key.scale_log2, 0);
    sender.send(
        LandService::SERVICE_UID,
        ChunkLoadCompletionMessage {
            key,
            value_ptr: generate_chunk(key),
        },
    );
}

fn build_impostor(key: ChunkKey, refs: &[Option<Arc<Chunk>>; 7], sender: &MessageSender) {
    // The center chunk must exist, adjacency slots may be empty
    let chunk = refs[0].as_deref().expect("impostor job needs its own chunk");

    let mut adj = ChunkAdjacency::new(chunk);
    for dir in 0..6 {
        adj.adjacent[dir] = refs[dir + 1].as_deref();
    }

    let data = PseudoChunkData::build(&adj);
    sender.send(
        LandService::SERVICE_UID,
        PseudoChunkDataGenCompletionMessage {
            key,
            value_ptr: (!data.is_empty()).then(|| Arc::new(data)),
        },
    );
}

/// Directly generates pseudo data of a small-LOD key, sampling the
/// surface function for the chunk itself and its six neighbors.
fn job_generate_pseudo_chunk(key: ChunkKey, sender: &MessageSender) {
    let own = generate_chunk(key);
    let Some(own) = own else {
        sender.send(
            LandService::SERVICE_UID,
            PseudoChunkDataGenCompletionMessage {
                key,
                value_ptr: None,
            },
        );
        return;
    };

    let step = key.scale_multiplier();
    let base = key.base();
    let mut refs: [Option<Arc<Chunk>>; 7] = Default::default();
    refs[0] = Some(own);
    for (dir, (dx, dy, dz)) in super::chunk::FACE_DIRECTIONS.iter().enumerate() {
        let neighbor = ChunkKey::new(base + IVec3::new(*dx, *dy, *dz) * step, key.scale_log2);
        refs[dir + 1] = generate_chunk(neighbor);
    }

    build_impostor(key, &refs, sender);
}

fn job_generate_impostor8(
    key: ChunkKey,
    lower: [Option<Arc<PseudoChunkData>>; 8],
    sender: &MessageSender,
) {
    let children: [Option<&PseudoChunkData>; 8] = std::array::from_fn(|i| lower[i].as_deref());
    let data = PseudoChunkData::build_from_children(&children);

    sender.send(
        LandService::SERVICE_UID,
        PseudoChunkDataGenCompletionMessage {
            key,
            value_ptr: (!data.is_empty()).then(|| Arc::new(data)),
        },
    );
}

fn job_generate_pseudo_surface(
    key: ChunkKey,
    refs: [Option<Arc<PseudoChunkData>>; 7],
    sender: &MessageSender,
) {
    let data = refs[0].as_deref().expect("surface job needs its own pseudo data");
    let adjacent: [Option<&PseudoChunkData>; 6] = std::array::from_fn(|i| refs[i + 1].as_deref());

    let surface = PseudoChunkSurface::build(data, &adjacent);
    sender.send(
        LandService::SERVICE_UID,
        PseudoChunkSurfaceGenCompletionMessage {
            key,
            value_ptr: (!surface.is_empty()).then(|| Arc::new(surface)),
        },
    );
}

// --- Per-key bookkeeping ---

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    struct MetaFlags: u32 {
        const HAS_CHUNK = 1 << 0;
        const HAS_PSEUDO_DATA = 1 << 1;
        const HAS_PSEUDO_SURFACE = 1 << 2;
        const PENDING_CHUNK_LOAD = 1 << 3;
        const PENDING_PSEUDO_DATA_GEN = 1 << 4;
        const PENDING_PSEUDO_SURFACE_GEN = 1 << 5;
        const NEEDS_L0_PSEUDO_DATA = 1 << 6;

        const ANY_PENDING = Self::PENDING_CHUNK_LOAD.bits()
            | Self::PENDING_PSEUDO_DATA_GEN.bits()
            | Self::PENDING_PSEUDO_SURFACE_GEN.bits();
    }
}

#[derive(Clone, Copy)]
struct ChunkMetastate {
    last_referenced_tick: TickId,
    flags: MetaFlags,
    internal_ticket: u64,
}

impl Default for ChunkMetastate {
    fn default() -> Self {
        Self {
            last_referenced_tick: TickId::INVALID,
            flags: MetaFlags::empty(),
            internal_ticket: ChunkTicket::INVALID_TICKET_ID,
        }
    }
}

struct TicketState {
    area: ChunkTicketArea,
    priority: i32,
}

// --- Handler staging, shared with message handler closures ---

#[derive(Default)]
struct TicketStaging {
    next_id: u64,
    new_tickets: Vec<(u64, ChunkTicketArea)>,
    adjusted: Vec<(u64, ChunkTicketArea)>,
    removed: Vec<u64>,
}

impl TicketStaging {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[derive(Default)]
struct CompletionStaging {
    chunk_loads: Vec<(ChunkKey, Option<Arc<Chunk>>)>,
    pseudo_data: Vec<(ChunkKey, Option<Arc<PseudoChunkData>>)>,
    pseudo_surfaces: Vec<(ChunkKey, Option<Arc<PseudoChunkSurface>>)>,
}

#[derive(Default)]
struct Staging {
    tickets: Mutex<TicketStaging>,
    completions: Mutex<CompletionStaging>,
}


/// Drops the adjacency claim a key took while waiting on dependencies
fn release_internal_ticket(tickets: &mut HashMap<u64, TicketState>, m: &mut ChunkMetastate) {
    let ticket = std::mem::replace(&mut m.internal_ticket, ChunkTicket::INVALID_TICKET_ID);
    if ticket != ChunkTicket::INVALID_TICKET_ID {
        tickets.remove(&ticket);
    }
}

struct LandServiceInner {
    task_service: Arc<TaskService>,
    queue: MessageQueue,
    sender: MessageSender,
    staging: Arc<Staging>,

    chunk_tickets: HashMap<u64, TicketState>,
    metastate: HashMap<ChunkKey, ChunkMetastate>,
    keys_lru_check_order: LruVisitOrdering<ChunkKey>,
    keys_to_update: Vec<(i32, ChunkKey)>,

    tick_id: TickId,
    land_state: LandState,
}

/// Owns the land state and advances it once per simulation tick.
///
/// Terrain work is dispatched to the task service; job results come
/// back as unicast messages and are folded into the versioned tables on
/// the next tick. Chunk tickets (external or internal, the latter taken
/// to satisfy adjacency dependencies) define which keys stay loaded;
/// keys unreferenced for long enough are trimmed away.
pub struct LandService {
    inner: Mutex<LandServiceInner>,
}

impl LandService {
    pub const SERVICE_UID: Uid = Uid::parse("71c950f2-34de1a88-b2e40c57-6d02391a");

    pub fn new(
        task_service: Arc<TaskService>,
        messaging: &MessagingService,
    ) -> anyhow::Result<Self> {
        UidRegistry::register(Self::SERVICE_UID, "land::LandService");
        UidRegistry::register(Consts::LAND_SERVICE_SENDER_UID, "land::ServiceSender");
        UidRegistry::register(ChunkTicketRequestMessage::MESSAGE_UID, "land::ChunkTicketRequestMessage");
        UidRegistry::register(ChunkTicketAdjustMessage::MESSAGE_UID, "land::ChunkTicketAdjustMessage");
        UidRegistry::register(ChunkTicketRemoveMessage::MESSAGE_UID, "land::ChunkTicketRemoveMessage");
        UidRegistry::register(ChunkLoadCompletionMessage::MESSAGE_UID, "land::ChunkLoadCompletionMessage");
        UidRegistry::register(PseudoChunkDataGenCompletionMessage::MESSAGE_UID, "land::PseudoChunkDataGenCompletionMessage");
        UidRegistry::register(PseudoChunkSurfaceGenCompletionMessage::MESSAGE_UID, "land::PseudoChunkSurfaceGenCompletionMessage");

        let mut queue = messaging.register_agent(Self::SERVICE_UID)?;
        let sender = messaging.create_sender(Consts::LAND_SERVICE_SENDER_UID);
        let staging = Arc::new(Staging::default());

        {
            let staging = staging.clone();
            let ticket_sender = sender.clone();
            queue.register_handler::<ChunkTicketRequestMessage, _>(move |msg, info| {
                if !msg.area.validate() {
                    log::warn!(
                        "bad chunk ticket request from {}; returning no handle",
                        UidRegistry::lookup(info.sender_uid())
                    );
                    msg.ticket = None;
                    return Ok(());
                }

                let mut tickets = staging.tickets.lock();
                let id = tickets.alloc_id();
                tickets.new_tickets.push((id, msg.area));
                msg.ticket = Some(ChunkTicket::new(id, ticket_sender.clone()));
                Ok(())
            });
        }
        {
            let staging = staging.clone();
            queue.register_handler::<ChunkTicketAdjustMessage, _>(move |msg, _| {
                if msg.new_area.validate() {
                    staging.tickets.lock().adjusted.push((msg.ticket_id, msg.new_area));
                } else {
                    log::warn!("bad chunk ticket adjustment, ignoring");
                }
                Ok(())
            });
        }
        {
            let staging = staging.clone();
            queue.register_handler::<ChunkTicketRemoveMessage, _>(move |msg, _| {
                staging.tickets.lock().removed.push(msg.ticket_id);
                Ok(())
            });
        }
        {
            let staging = staging.clone();
            queue.register_handler::<ChunkLoadCompletionMessage, _>(move |msg, _| {
                staging
                    .completions
                    .lock()
                    .chunk_loads
                    .push((msg.key, msg.value_ptr.take()));
                Ok(())
            });
        }
        {
            let staging = staging.clone();
            queue.register_handler::<PseudoChunkDataGenCompletionMessage, _>(move |msg, _| {
                staging
                    .completions
                    .lock()
                    .pseudo_data
                    .push((msg.key, msg.value_ptr.take()));
                Ok(())
            });
        }
        {
            let staging = staging.clone();
            queue.register_handler::<PseudoChunkSurfaceGenCompletionMessage, _>(move |msg, _| {
                staging
                    .completions
                    .lock()
                    .pseudo_surfaces
                    .push((msg.key, msg.value_ptr.take()));
                Ok(())
            });
        }

        Ok(Self {
            inner: Mutex::new(LandServiceInner {
                task_service,
                queue,
                sender,
                staging,
                chunk_tickets: HashMap::new(),
                metastate: HashMap::new(),
                keys_lru_check_order: LruVisitOrdering::new(),
                keys_to_update: Vec::new(),
                tick_id: TickId(0),
                land_state: LandState::default(),
            }),
        })
    }

    /// Advances the land state by one tick: applies ticket changes and
    /// job completions, schedules new terrain work, trims stale keys.
    pub fn do_tick(&self, tick_id: TickId) {
        self.inner.lock().do_tick(tick_id);
    }

    /// Cheap structural-sharing copy of the current land state
    pub fn state_for_copy(&self) -> LandState {
        self.inner.lock().land_state.clone()
    }
}

impl crate::svc::NamedService for LandService {
    const SERVICE_UID: Uid = LandService::SERVICE_UID;
}

impl Drop for LandService {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut logged = false;

        // Jobs reference our agent UID; drain their completions before
        // tearing the queue down
        for _ in 0..500 {
            inner.apply_completions();
            let any_pending = inner
                .metastate
                .values()
                .any(|m| m.flags.intersects(MetaFlags::ANY_PENDING));
            if !any_pending {
                return;
            }

            if !std::mem::replace(&mut logged, true) {
                log::debug!("land service has pending jobs remaining, waiting...");
            }
            inner
                .queue
                .wait_messages_timeout(std::time::Duration::from_millis(20));
        }

        log::warn!("land service dropped with jobs still pending");
    }
}

impl LandServiceInner {
    fn land_version(&self) -> u64 {
        self.tick_id.0 as u64
    }

    fn do_tick(&mut self, tick_id: TickId) {
        self.tick_id = tick_id;

        // Handlers stage ticket changes and job completions
        self.queue.poll_messages();
        self.apply_ticket_changes();
        self.apply_completions();

        // No keys left from the previous scan: collect a fresh list. It
        // can be large, but it is consumed in batches over later ticks.
        if self.keys_to_update.is_empty() {
            self.collect_keys_to_update();
        }

        let num_visited = KEYS_PER_TICK.min(self.keys_to_update.len());
        for _ in 0..num_visited {
            let (priority, key) = self.keys_to_update.pop().unwrap();
            self.tick_chunk_key(key, tick_id, priority);
        }

        self.cleanup_stale_keys(tick_id);
    }

    fn apply_ticket_changes(&mut self) {
        let (new_tickets, adjusted, removed) = {
            let mut tickets = self.staging.tickets.lock();
            (
                std::mem::take(&mut tickets.new_tickets),
                std::mem::take(&mut tickets.adjusted),
                std::mem::take(&mut tickets.removed),
            )
        };

        for (id, area) in new_tickets {
            self.chunk_tickets.insert(
                id,
                TicketState {
                    area,
                    priority: area.priority(),
                },
            );
            // Ticket set changed, rescan keys next round
            self.keys_to_update.clear();
        }

        for (id, area) in adjusted {
            if let Some(state) = self.chunk_tickets.get_mut(&id) {
                state.area = area;
                state.priority = area.priority();
                self.keys_to_update.clear();
            }
        }

        for id in removed {
            self.chunk_tickets.remove(&id);
        }
    }

    fn apply_completions(&mut self) {
        let tick = self.tick_id;
        let version = self.land_version();

        let staged = {
            let mut completions = self.staging.completions.lock();
            std::mem::take(&mut *completions)
        };

        for (key, value) in staged.chunk_loads {
            let m = self.metastate.entry(key).or_default();
            m.flags.remove(MetaFlags::PENDING_CHUNK_LOAD);
            m.flags.insert(MetaFlags::HAS_CHUNK);

            self.land_state.chunk_table.insert(version, key, value);

            if let Some(path) = key_to_tree_path(key) {
                if let TreeDataMut::Chunk(residency) =
                    self.land_state.residency_tree.access(path, tick)
                {
                    residency.loaded_tick = tick;
                }
            }
        }

        for (key, value) in staged.pseudo_data {
            let m = self.metastate.entry(key).or_default();
            m.flags.remove(MetaFlags::PENDING_PSEUDO_DATA_GEN);
            m.flags.insert(MetaFlags::HAS_PSEUDO_DATA);

            if key.scale_log2 == 0 {
                // Don't regenerate every time; an adjacent chunk needing
                // this data will raise the flag again
                m.flags.remove(MetaFlags::NEEDS_L0_PSEUDO_DATA);
            }

            // The adjacency claim served its purpose
            release_internal_ticket(&mut self.chunk_tickets, m);

            self.land_state.pseudo_chunk_data_table.insert(version, key, value);

            if key.scale_log2 > 0 {
                if let Some(path) = key_to_tree_path(key) {
                    if let TreeDataMut::Aggregate(residency) =
                        self.land_state.residency_tree.access(path, tick)
                    {
                        residency.refreshed_tick = tick;
                    }
                }
            }
        }

        for (key, value) in staged.pseudo_surfaces {
            let m = self.metastate.entry(key).or_default();
            m.flags.remove(MetaFlags::PENDING_PSEUDO_SURFACE_GEN);
            m.flags.insert(MetaFlags::HAS_PSEUDO_SURFACE);

            release_internal_ticket(&mut self.chunk_tickets, m);

            self.land_state
                .pseudo_chunk_surface_table
                .insert(version, key, value);
        }
    }

    fn collect_keys_to_update(&mut self) {
        for state in self.chunk_tickets.values() {
            match state.area {
                ChunkTicketArea::Box(area) => {
                    let lo = area.begin;
                    let hi = area.end;
                    let step = lo.scale_multiplier() as usize;

                    for y in (lo.y..hi.y).step_by(step) {
                        for x in (lo.x..hi.x).step_by(step) {
                            for z in (lo.z..hi.z).step_by(step) {
                                let key = ChunkKey::new(IVec3::new(x, y, z), lo.scale_log2);
                                self.keys_to_update.push((state.priority, key));
                            }
                        }
                    }
                }
                ChunkTicketArea::Octahedron(area) => {
                    let pivot = area.pivot.base();
                    let scale = area.pivot.scale_multiplier();

                    let mut walker = ConcentricOctahedraWalker::new(area.scaled_radius);
                    loop {
                        let offset = walker.step();
                        let key = ChunkKey::new(pivot + offset * scale, area.pivot.scale_log2);
                        self.keys_to_update.push((state.priority, key));

                        if walker.wrapped_around() {
                            break;
                        }
                    }
                }
            }
        }

        // Overlapping tickets produce duplicate keys; keep the highest
        // priority (smallest value) for each. Then order so that the
        // final pop-driven visit goes highest priority first.
        self.keys_to_update
            .sort_unstable_by_key(|&(priority, key)| (key.packed(), priority));
        self.keys_to_update.dedup_by_key(|&mut (_, key)| key.packed());
        self.keys_to_update
            .sort_unstable_by_key(|&(priority, key)| std::cmp::Reverse((priority, key.packed())));
    }

    fn tick_chunk_key(&mut self, key: ChunkKey, tick_id: TickId, priority: i32) {
        let mut m = match self.metastate.get(&key) {
            Some(m) => *m,
            None => {
                self.keys_lru_check_order
                    .add_key(key, (tick_id + STALE_CHUNK_AGE_THRESHOLD).0);
                ChunkMetastate::default()
            }
        };
        m.last_referenced_tick = tick_id;

        if key.scale_log2 == 0
            && !m.flags.contains(MetaFlags::HAS_CHUNK)
            && !m.flags.contains(MetaFlags::PENDING_CHUNK_LOAD)
        {
            m.flags.insert(MetaFlags::PENDING_CHUNK_LOAD);
            let sender = self.sender.clone();
            TaskBuilder::new(&self.task_service)
                .enqueue_task(move |_| job_load_chunk(key, &sender));
        }

        if !m.flags.contains(MetaFlags::HAS_PSEUDO_DATA)
            && !m.flags.contains(MetaFlags::PENDING_PSEUDO_DATA_GEN)
        {
            self.try_pseudo_data_gen(key, &mut m, priority);
        }

        if !m.flags.contains(MetaFlags::HAS_PSEUDO_SURFACE)
            && !m.flags.contains(MetaFlags::PENDING_PSEUDO_SURFACE_GEN)
        {
            self.try_pseudo_surface_gen(key, &mut m, priority);
        }

        self.metastate.insert(key, m);
    }

    fn try_pseudo_data_gen(&mut self, key: ChunkKey, m: &mut ChunkMetastate, priority: i32) {
        let version = self.land_version();

        if key.scale_log2 == 0 {
            if !m.flags.contains(MetaFlags::NEEDS_L0_PSEUDO_DATA) && priority > 0 {
                // Avoid infinite adjacency creep around internal tickets
                return;
            }

            if !m.flags.contains(MetaFlags::HAS_CHUNK) {
                // Wait until at least our own chunk loads
                return;
            }

            let my_item = self
                .land_state
                .chunk_table
                .find(key)
                .expect("HAS_CHUNK implies a chunk table entry");
            if !my_item.has_value() {
                // Empty chunk, "generate" empty pseudo data immediately
                m.flags.insert(MetaFlags::HAS_PSEUDO_DATA);
                release_internal_ticket(&mut self.chunk_tickets, m);
                self.land_state.pseudo_chunk_data_table.insert(version, key, None);
                return;
            }

            let mut refs: [Option<Arc<Chunk>>; 7] = Default::default();
            refs[0] = my_item.value_ptr();

            let mut all_found = true;
            let mut have_nonempty = false;

            for (dir, (dx, dy, dz)) in super::chunk::FACE_DIRECTIONS.iter().enumerate() {
                let neighbor = ChunkKey::new_lod0(key.base() + IVec3::new(*dx, *dy, *dz));
                match self.land_state.chunk_table.find(neighbor) {
                    Some(item) => {
                        refs[dir + 1] = item.value_ptr();
                        have_nonempty |= item.has_value();
                    }
                    None => all_found = false,
                }
            }

            if all_found {
                if !have_nonempty {
                    // All neighbors empty too
                    m.flags.insert(MetaFlags::HAS_PSEUDO_DATA);
                    release_internal_ticket(&mut self.chunk_tickets, m);
                    self.land_state.pseudo_chunk_data_table.insert(version, key, None);
                    return;
                }

                m.flags.insert(MetaFlags::PENDING_PSEUDO_DATA_GEN);
                let sender = self.sender.clone();
                TaskBuilder::new(&self.task_service)
                    .enqueue_task(move |_| build_impostor(key, &refs, &sender));
                return;
            }

            if m.internal_ticket == ChunkTicket::INVALID_TICKET_ID {
                // Claim the 6-neighbor cross until dependencies load
                m.internal_ticket = self.add_internal_ticket(
                    ChunkTicketArea::Octahedron(super::ticket::ChunkTicketOctahedronArea {
                        pivot: key,
                        scaled_radius: 1,
                    }),
                    priority + 1,
                );
            }
            return;
        }

        if key.scale_log2 <= Consts::MAX_DIRECT_GENERATE_LOD {
            // Small enough to sample the surface function directly
            m.flags.insert(MetaFlags::PENDING_PSEUDO_DATA_GEN);
            let sender = self.sender.clone();
            TaskBuilder::new(&self.task_service)
                .enqueue_task(move |_| job_generate_pseudo_chunk(key, &sender));
            return;
        }

        // Large LOD: aggregate the 2x2x2 child-LOD cube
        let child_scale = key.scale_log2 - 1;
        let half = key.scale_multiplier() / 2;
        let base = key.base();

        let mut deps: [Option<Arc<PseudoChunkData>>; 8] = Default::default();
        let mut all_found = true;
        let mut have_nonempty = false;

        for (slot, dep) in deps.iter_mut().enumerate() {
            let offset = IVec3::new(
                ((slot >> 1) & 1) as i32,
                ((slot >> 2) & 1) as i32,
                (slot & 1) as i32,
            ) * half;
            let child = ChunkKey::new(base + offset, child_scale);

            match self.land_state.pseudo_chunk_data_table.find(child) {
                Some(item) => {
                    *dep = item.value_ptr();
                    have_nonempty |= item.has_value();
                }
                None => {
                    all_found = false;
                    if child.scale_log2 == 0 {
                        // The chunk must produce L0 pseudo data so it can
                        // be aggregated one level up
                        self.metastate
                            .entry(child)
                            .or_default()
                            .flags
                            .insert(MetaFlags::NEEDS_L0_PSEUDO_DATA);
                    }
                }
            }
        }

        if all_found {
            if !have_nonempty {
                m.flags.insert(MetaFlags::HAS_PSEUDO_DATA);
                release_internal_ticket(&mut self.chunk_tickets, m);
                self.land_state.pseudo_chunk_data_table.insert(version, key, None);
                return;
            }

            m.flags.insert(MetaFlags::PENDING_PSEUDO_DATA_GEN);
            let sender = self.sender.clone();
            TaskBuilder::new(&self.task_service)
                .enqueue_task(move |_| job_generate_impostor8(key, deps, &sender));
            return;
        }

        if m.internal_ticket == ChunkTicket::INVALID_TICKET_ID {
            // Claim the child-LOD cube
            m.internal_ticket = self.add_internal_ticket(
                ChunkTicketArea::Box(super::ticket::ChunkTicketBoxArea {
                    begin: ChunkKey::new(base, child_scale),
                    end: ChunkKey::new(base + key.scale_multiplier(), child_scale),
                }),
                priority + 5,
            );
        }
    }

    fn try_pseudo_surface_gen(&mut self, key: ChunkKey, m: &mut ChunkMetastate, priority: i32) {
        if !m.flags.contains(MetaFlags::HAS_PSEUDO_DATA)
            || m.flags.contains(MetaFlags::PENDING_PSEUDO_DATA_GEN)
        {
            // Wait for at least our own pseudo data
            return;
        }

        let version = self.land_version();

        let my_item = self
            .land_state
            .pseudo_chunk_data_table
            .find(key)
            .expect("HAS_PSEUDO_DATA implies a table entry");
        if !my_item.has_value() {
            // Empty region, empty surface
            m.flags.insert(MetaFlags::HAS_PSEUDO_SURFACE);
            release_internal_ticket(&mut self.chunk_tickets, m);
            self.land_state
                .pseudo_chunk_surface_table
                .insert(version, key, None);
            return;
        }

        let step = key.scale_multiplier();
        let mut refs: [Option<Arc<PseudoChunkData>>; 7] = Default::default();
        refs[0] = my_item.value_ptr();

        let mut all_found = true;
        let mut have_nonempty = false;

        for (dir, (dx, dy, dz)) in super::chunk::FACE_DIRECTIONS.iter().enumerate() {
            let neighbor =
                ChunkKey::new(key.base() + IVec3::new(*dx, *dy, *dz) * step, key.scale_log2);
            match self.land_state.pseudo_chunk_data_table.find(neighbor) {
                Some(item) => {
                    refs[dir + 1] = item.value_ptr();
                    have_nonempty |= item.has_value();
                }
                None => all_found = false,
            }
        }

        if all_found {
            if !have_nonempty {
                m.flags.insert(MetaFlags::HAS_PSEUDO_SURFACE);
                release_internal_ticket(&mut self.chunk_tickets, m);
                self.land_state
                    .pseudo_chunk_surface_table
                    .insert(version, key, None);
                return;
            }

            m.flags.insert(MetaFlags::PENDING_PSEUDO_SURFACE_GEN);
            let sender = self.sender.clone();
            TaskBuilder::new(&self.task_service)
                .enqueue_task(move |_| job_generate_pseudo_surface(key, refs, &sender));
            return;
        }

        if m.internal_ticket == ChunkTicket::INVALID_TICKET_ID {
            m.internal_ticket = self.add_internal_ticket(
                ChunkTicketArea::Octahedron(super::ticket::ChunkTicketOctahedronArea {
                    pivot: key,
                    scaled_radius: 1,
                }),
                priority + 1,
            );
        }
    }

    fn add_internal_ticket(&mut self, area: ChunkTicketArea, priority: i32) -> u64 {
        let id = self.staging.tickets.lock().alloc_id();
        self.chunk_tickets.insert(id, TicketState { area, priority });
        // New keys to visit on the next rescan
        self.keys_to_update.clear();
        id
    }

    fn cleanup_stale_keys(&mut self, tick_id: TickId) {
        let version = self.tick_id.0 as u64;
        let LandServiceInner {
            keys_lru_check_order,
            metastate,
            land_state,
            chunk_tickets,
            ..
        } = self;

        keys_lru_check_order.visit_oldest(tick_id.0, CLEANUP_VISITS_PER_TICK, |key| {
            let Some(m) = metastate.get(&key) else {
                // Gone already, stop tracking
                return None;
            };

            let stale_at = m.last_referenced_tick + STALE_CHUNK_AGE_THRESHOLD;
            if stale_at > tick_id {
                return Some(stale_at.0);
            }

            if m.flags.intersects(MetaFlags::ANY_PENDING) {
                // Jobs in flight, revisit shortly
                return Some((tick_id + 1).0);
            }

            if m.internal_ticket != ChunkTicket::INVALID_TICKET_ID {
                chunk_tickets.remove(&m.internal_ticket);
            }

            land_state.chunk_table.erase(version, key);
            land_state.pseudo_chunk_data_table.erase(version, key);
            land_state.pseudo_chunk_surface_table.erase(version, key);
            if let Some(path) = key_to_tree_path(key) {
                land_state.residency_tree.remove(path, tick_id);
            }
            metastate.remove(&key);
            None
        });
    }
}
