//! Fixed-tick simulation thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use glam::DVec3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::control::{SaveRequest, StartRequest};
use super::state::{PlayerStateMessage, WorldState};
use super::tick::TickId;
use crate::land::LandService;
use crate::svc::{MessagingService, TaskBuilder, TaskService};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    /// Simulation tick interval in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 10 }
    }
}

enum SimCommand {
    Save(SaveRequest),
    Stop(SaveRequest),
}

/// Input accumulated by message handlers between ticks
#[derive(Default)]
struct PendingInput {
    player: Option<PlayerStateMessage>,
    chunk_loading_position: Option<DVec3>,
}

/// Runs world save requests as detached tasks against a snapshot
fn save_world_task(state: Arc<WorldState>, request: SaveRequest) -> impl std::future::Future<Output = ()> {
    async move {
        log::warn!(
            "world save/load is not yet implemented, discarding save of tick {:?}",
            state.tick_id
        );

        if let Some(progress) = &request.progress_callback {
            const STEPS: u32 = 5;
            for step in 0..=STEPS {
                progress(step as f32 / STEPS as f32);
            }
        }

        if let Some(result) = request.result_callback {
            result(Ok(()));
        }
    }
}

/// Drives the simulation: one thread, fixed tick rate. Each tick drains
/// inbound messages, advances the land service, and publishes a fresh
/// immutable snapshot through an atomic pointer swap.
pub struct SimThread {
    last_state: Arc<ArcSwap<WorldState>>,
    cmd_queue: Arc<Mutex<VecDeque<SimCommand>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SimThread {
    pub fn spawn(
        task_service: Arc<TaskService>,
        land_service: Arc<LandService>,
        messaging: &MessagingService,
        cfg: SimConfig,
        start_request: StartRequest,
    ) -> anyhow::Result<Arc<SimThread>> {
        let mut queue = messaging.register_agent(super::control::WorldControlService::SERVICE_UID)?;

        let pending_input = Arc::new(Mutex::new(PendingInput::default()));
        {
            let pending_input = pending_input.clone();
            queue.register_handler::<PlayerStateMessage, _>(move |msg, _| {
                let mut pending = pending_input.lock();
                if !msg.lock_chunk_loading_position {
                    pending.chunk_loading_position = Some(msg.player_position);
                }
                pending.player = Some(*msg);
                Ok(())
            });
        }

        let me = Arc::new(SimThread {
            last_state: Arc::new(ArcSwap::from_pointee(WorldState::default())),
            cmd_queue: Arc::new(Mutex::new(VecDeque::new())),
            join_handle: Mutex::new(None),
        });

        let thread_me = me.clone();
        let handle = std::thread::Builder::new()
            .name("world-sim".to_owned())
            .spawn(move || {
                thread_proc(
                    thread_me,
                    task_service,
                    land_service,
                    queue,
                    pending_input,
                    cfg,
                    start_request,
                );
            })?;

        *me.join_handle.lock() = Some(handle);
        Ok(me)
    }

    /// Most recently published snapshot
    pub fn last_state(&self) -> Arc<WorldState> {
        self.last_state.load_full()
    }

    pub fn request_save(&self, request: SaveRequest) {
        self.cmd_queue.lock().push_back(SimCommand::Save(request));
    }

    /// Requests a final save and a clean exit of the sim thread
    pub fn request_stop(&self, request: SaveRequest) {
        self.cmd_queue.lock().push_back(SimCommand::Stop(request));
    }

    /// Blocks until the sim thread has exited
    pub fn join(&self) {
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn thread_proc(
    me: Arc<SimThread>,
    task_service: Arc<TaskService>,
    land_service: Arc<LandService>,
    mut queue: crate::svc::MessageQueue,
    pending_input: Arc<Mutex<PendingInput>>,
    cfg: SimConfig,
    start_request: StartRequest,
) {
    log::info!("world sim thread started");

    if start_request.storage_directory.is_some() {
        log::warn!("world save/load is not yet implemented, generating a new world");
    }

    if let Some(progress) = &start_request.progress_callback {
        const STEPS: u32 = 5;
        for step in 0..=STEPS {
            progress(step as f32 / STEPS as f32);
        }
    }
    if let Some(result) = start_request.result_callback {
        // Nothing can fail in generated-world startup
        result(Ok(()));
    }

    let tick_interval = Duration::from_millis(cfg.tick_interval_ms.max(1));
    let mut next_tick_time = Instant::now() + tick_interval;
    let mut stop = false;

    while !stop {
        let now = Instant::now();

        let mut due = now;
        while due >= next_tick_time {
            update(&me, &land_service, &mut queue, &pending_input);
            next_tick_time += tick_interval;

            process_commands(&me, &task_service, &mut stop);
            if stop {
                break;
            }
            due = Instant::now();
        }

        if !stop {
            std::thread::sleep(next_tick_time.saturating_duration_since(Instant::now()));
        }
    }

    log::info!("world sim thread stopped");
}

fn update(
    me: &SimThread,
    land_service: &LandService,
    queue: &mut crate::svc::MessageQueue,
    pending_input: &Mutex<PendingInput>,
) {
    let last_state = me.last_state.load_full();

    let mut next_state = (*last_state).clone();
    next_state.tick_id = last_state.tick_id.next();

    // Receive player input accumulated since the previous tick
    queue.poll_messages();
    {
        let mut pending = pending_input.lock();
        if let Some(msg) = pending.player.take() {
            next_state
                .player
                .update_state(msg.player_position, msg.player_orientation);
        }
    }

    land_service.do_tick(next_state.tick_id);
    next_state.land = land_service.state_for_copy();

    me.last_state.store(Arc::new(next_state));
}

fn process_commands(me: &SimThread, task_service: &TaskService, stop: &mut bool) {
    loop {
        let command = me.cmd_queue.lock().pop_front();
        let Some(command) = command else {
            return;
        };

        match command {
            SimCommand::Save(request) => {
                TaskBuilder::new(task_service)
                    .enqueue_async(save_world_task(me.last_state(), request));
            }
            SimCommand::Stop(request) => {
                // No more updates after the stop flag is raised
                *stop = true;
                TaskBuilder::new(task_service)
                    .enqueue_async(save_world_task(me.last_state(), request));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Uid;
    use crate::svc::TaskServiceConfig;
    use glam::DQuat;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup() -> (Arc<TaskService>, MessagingService, Arc<LandService>) {
        let task = Arc::new(TaskService::new(TaskServiceConfig { num_threads: 2 }));
        let messaging = MessagingService::new();
        let land = Arc::new(LandService::new(task.clone(), &messaging).unwrap());
        (task, messaging, land)
    }

    #[test]
    fn test_ticks_advance_and_publish() {
        let (task, messaging, land) = setup();

        let sim = SimThread::spawn(
            task,
            land,
            &messaging,
            SimConfig { tick_interval_ms: 1 },
            StartRequest::default(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let state = sim.last_state();
        assert!(state.tick_id > TickId(0));

        // Snapshots are immutable; later publishes leave held ones behind
        let held = sim.last_state();
        std::thread::sleep(Duration::from_millis(50));
        assert!(sim.last_state().tick_id > held.tick_id);

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        sim.request_stop(SaveRequest {
            progress_callback: None,
            result_callback: Some(Box::new(move |result| {
                assert!(result.is_ok());
                flag.store(true, Ordering::SeqCst);
            })),
        });
        sim.join();

        // The final save task runs on the worker pool
        for _ in 0..100 {
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_player_input_message() {
        let (task, messaging, land) = setup();

        let sim = SimThread::spawn(
            task,
            land,
            &messaging,
            SimConfig { tick_interval_ms: 1 },
            StartRequest::default(),
        )
        .unwrap();

        let input = messaging.create_sender(Uid::parse("00000000-00000000-00000000-00000123"));
        let position = DVec3::new(10.0, 20.0, 30.0);
        input.send(
            crate::world::control::WorldControlService::SERVICE_UID,
            PlayerStateMessage {
                player_position: position,
                player_orientation: DQuat::IDENTITY,
                lock_chunk_loading_position: false,
            },
        );

        let mut seen = false;
        for _ in 0..200 {
            if sim.last_state().player.position == position {
                seen = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(seen, "player input never reached the published state");

        sim.request_stop(SaveRequest::default());
        sim.join();
    }
}
