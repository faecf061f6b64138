//! Engine assembly: wires the core services into a service locator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::land::LandService;
use crate::svc::{MessagingService, ServiceLocator, TaskService, TaskServiceConfig};
use crate::world::{SimConfig, WorldControlService};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub task: TaskServiceConfig,
    pub sim: SimConfig,
}

/// Owns the service locator with all standard factories registered.
/// Services are created lazily on first request and torn down in
/// reverse creation order when the engine drops.
pub struct Engine {
    locator: ServiceLocator,
}

impl Engine {
    pub fn create(config: EngineConfig) -> anyhow::Result<Engine> {
        let locator = ServiceLocator::new();

        let task_cfg = config.task.clone();
        locator.register_service_factory::<TaskService, _>(move |_| {
            Ok(Arc::new(TaskService::new(task_cfg.clone())))
        })?;

        locator.register_service_factory::<MessagingService, _>(|_| {
            Ok(Arc::new(MessagingService::new()))
        })?;

        locator.register_service_factory::<LandService, _>(|loc| {
            let task = loc.request_service::<TaskService>()?;
            let messaging = loc.request_service::<MessagingService>()?;
            Ok(Arc::new(LandService::new(task, &messaging)?))
        })?;

        let sim_cfg = config.sim.clone();
        locator.register_service_factory::<WorldControlService, _>(move |loc| {
            let task = loc.request_service::<TaskService>()?;
            let land = loc.request_service::<LandService>()?;
            let messaging = loc.request_service::<MessagingService>()?;
            Ok(Arc::new(WorldControlService::new(
                task,
                land,
                messaging,
                sim_cfg.clone(),
            )))
        })?;

        Ok(Engine { locator })
    }

    pub fn create_default() -> anyhow::Result<Engine> {
        Self::create(EngineConfig::default())
    }

    pub fn service_locator(&self) -> &ServiceLocator {
        &self.locator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{SaveRequest, StartRequest, TickId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_lazy_service_creation() {
        let engine = Engine::create_default().unwrap();
        let locator = engine.service_locator();

        assert!(locator.find_service::<TaskService>().is_none());
        locator.request_service::<TaskService>().unwrap();
        assert!(locator.find_service::<TaskService>().is_some());
        // Never requested, never created
        assert!(locator.find_service::<WorldControlService>().is_none());
    }

    #[test]
    fn test_world_lifecycle() {
        let engine = Engine::create(EngineConfig {
            task: crate::svc::TaskServiceConfig { num_threads: 2 },
            sim: crate::world::SimConfig { tick_interval_ms: 1 },
        })
        .unwrap();

        let control = engine
            .service_locator()
            .request_service::<WorldControlService>()
            .unwrap();

        let started = Arc::new(AtomicBool::new(false));
        {
            let started = started.clone();
            control.async_start_world(StartRequest {
                storage_directory: None,
                progress_callback: None,
                result_callback: Some(Box::new(move |result| {
                    assert!(result.is_ok());
                    started.store(true, Ordering::SeqCst);
                })),
            });
        }

        // Let the simulation run a few ticks
        let mut ticked = false;
        for _ in 0..300 {
            if let Some(state) = control.last_state() {
                if state.tick_id > TickId(5) {
                    ticked = true;
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(started.load(Ordering::SeqCst));
        assert!(ticked, "simulation never advanced");

        let saved = Arc::new(AtomicBool::new(false));
        {
            let saved = saved.clone();
            control.async_stop_world(SaveRequest {
                progress_callback: None,
                result_callback: Some(Box::new(move |result| {
                    assert!(result.is_ok());
                    saved.store(true, Ordering::SeqCst);
                })),
            });
        }

        for _ in 0..200 {
            if saved.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(saved.load(Ordering::SeqCst));
        assert!(control.last_state().is_none());
    }

    #[test]
    fn test_double_start_reports_error() {
        let engine = Engine::create(EngineConfig {
            task: crate::svc::TaskServiceConfig { num_threads: 2 },
            sim: crate::world::SimConfig { tick_interval_ms: 5 },
        })
        .unwrap();

        let control = engine
            .service_locator()
            .request_service::<WorldControlService>()
            .unwrap();

        control.async_start_world(StartRequest::default());

        let rejected = Arc::new(AtomicBool::new(false));
        {
            let rejected = rejected.clone();
            control.async_start_world(StartRequest {
                storage_directory: None,
                progress_callback: None,
                result_callback: Some(Box::new(move |result| {
                    assert!(result.is_err());
                    rejected.store(true, Ordering::SeqCst);
                })),
            });
        }
        assert!(rejected.load(Ordering::SeqCst));

        control.async_stop_world(SaveRequest::default());
    }
}
