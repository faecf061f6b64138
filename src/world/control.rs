//! Asynchronous world lifecycle control.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::sim_thread::{SimConfig, SimThread};
use super::state::WorldState;
use crate::core::{Uid, UidRegistry};
use crate::land::LandService;
use crate::svc::{MessagingService, TaskService};

pub type ProgressCallback = Box<dyn Fn(f32) + Send>;
pub type ResultCallback = Box<dyn FnOnce(anyhow::Result<()>) + Send>;

/// Parameters of an asynchronous world start.
#[derive(Default)]
pub struct StartRequest {
    /// World storage location; `None` generates a fresh world
    pub storage_directory: Option<PathBuf>,
    /// Invoked with 0..=1 while the world loads
    pub progress_callback: Option<ProgressCallback>,
    pub result_callback: Option<ResultCallback>,
}

/// Parameters of an asynchronous world save (or save-and-stop).
#[derive(Default)]
pub struct SaveRequest {
    pub progress_callback: Option<ProgressCallback>,
    pub result_callback: Option<ResultCallback>,
}

struct ControlInner {
    task_service: Arc<TaskService>,
    land_service: Arc<LandService>,
    messaging: Arc<MessagingService>,
    sim_config: SimConfig,
    sim_thread: Option<Arc<SimThread>>,
}

/// Start/save/stop entry point of the simulation. All three operations
/// are asynchronous; outcomes are reported through the request
/// callbacks.
pub struct WorldControlService {
    inner: Mutex<ControlInner>,
}

impl WorldControlService {
    pub const SERVICE_UID: Uid = Uid::parse("d8a1c4e7-92f50b36-7c18ad09-e3b62f44");

    pub fn new(
        task_service: Arc<TaskService>,
        land_service: Arc<LandService>,
        messaging: Arc<MessagingService>,
        sim_config: SimConfig,
    ) -> Self {
        UidRegistry::register(Self::SERVICE_UID, "world::ControlService");

        Self {
            inner: Mutex::new(ControlInner {
                task_service,
                land_service,
                messaging,
                sim_config,
                sim_thread: None,
            }),
        }
    }

    pub fn async_start_world(&self, request: StartRequest) {
        let mut inner = self.inner.lock();

        if inner.sim_thread.is_some() {
            log::warn!("attempt to start world with an already established connection");
            if let Some(result) = request.result_callback {
                result(Err(anyhow::anyhow!("world is already started")));
            }
            return;
        }

        match SimThread::spawn(
            inner.task_service.clone(),
            inner.land_service.clone(),
            &inner.messaging,
            inner.sim_config.clone(),
            request,
        ) {
            Ok(sim) => inner.sim_thread = Some(sim),
            Err(error) => log::error!("failed to start world sim thread: {error:#}"),
        }
    }

    pub fn async_save_world(&self, request: SaveRequest) {
        let inner = self.inner.lock();

        match &inner.sim_thread {
            Some(sim) => sim.request_save(request),
            None => {
                log::warn!("attempt to save world without an established connection");
                if let Some(result) = request.result_callback {
                    result(Err(anyhow::anyhow!("world is not started")));
                }
            }
        }
    }

    /// Saves and stops the world; the sim thread exits after scheduling
    /// the final save.
    pub fn async_stop_world(&self, request: SaveRequest) {
        let mut inner = self.inner.lock();

        match inner.sim_thread.take() {
            Some(sim) => {
                sim.request_stop(request);
                sim.join();
            }
            None => {
                log::warn!("attempt to stop world without an established connection");
                if let Some(result) = request.result_callback {
                    result(Err(anyhow::anyhow!("world is not started")));
                }
            }
        }
    }

    /// Latest published snapshot, `None` before the world starts
    pub fn last_state(&self) -> Option<Arc<WorldState>> {
        self.inner.lock().sim_thread.as_ref().map(|sim| sim.last_state())
    }
}

impl crate::svc::NamedService for WorldControlService {
    const SERVICE_UID: Uid = WorldControlService::SERVICE_UID;
}

impl Drop for WorldControlService {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(sim) = inner.sim_thread.take() {
            log::warn!("world control stopping with an established world connection! Auto-saving it.");
            sim.request_stop(SaveRequest::default());
            sim.join();
        }
    }
}
