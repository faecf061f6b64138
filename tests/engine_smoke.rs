//! End-to-end smoke test: full engine assembly, world lifecycle, player
//! input flowing into published snapshots, terrain pipeline producing
//! chunk data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glam::{DQuat, DVec3, IVec3};
use terravox::land::{ChunkKey, ChunkTicketArea, ChunkTicketOctahedronArea, ChunkTicketRequestMessage};
use terravox::prelude::*;
use terravox::svc::{RequestStatus, TaskServiceConfig};
use terravox::world::{PlayerStateMessage, SaveRequest, SimConfig, StartRequest};

fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init();
}

const INPUT_UID: Uid = Uid::parse("0badc0de-12345678-9abcdef0-00000042");

#[test]
fn world_lifecycle_end_to_end() {
    init_logging();

    let engine = Engine::create(EngineConfig {
        task: TaskServiceConfig { num_threads: 4 },
        sim: SimConfig { tick_interval_ms: 2 },
    })
    .unwrap();
    let locator = engine.service_locator();

    let control = locator.request_service::<WorldControlService>().unwrap();
    let messaging = locator.request_service::<MessagingService>().unwrap();

    let started = Arc::new(AtomicBool::new(false));
    {
        let started = started.clone();
        control.async_start_world(StartRequest {
            storage_directory: None,
            progress_callback: Some(Box::new(|p| assert!((0.0..=1.0).contains(&p)))),
            result_callback: Some(Box::new(move |result| {
                result.unwrap();
                started.store(true, Ordering::SeqCst);
            })),
        });
    }

    // Feed player input and request terrain around the spawn point
    let input = messaging.create_sender(INPUT_UID);
    let position = DVec3::new(1.0, 2.0, 3.0);
    input.send(
        WorldControlService::SERVICE_UID,
        PlayerStateMessage {
            player_position: position,
            player_orientation: DQuat::IDENTITY,
            lock_chunk_loading_position: false,
        },
    );

    let ticket_client = messaging
        .register_agent(Uid::parse("0badc0de-12345678-9abcdef0-00000043"))
        .unwrap();

    let pivot = ChunkKey::new_lod0(IVec3::new(0, 0, 0));
    let ticket_request = ticket_client.request_with_handle(
        LandService::SERVICE_UID,
        ChunkTicketRequestMessage {
            area: ChunkTicketArea::Octahedron(ChunkTicketOctahedronArea {
                pivot,
                scaled_radius: 1,
            }),
            ticket: None,
        },
    );

    // The sim thread polls input, ticks the land service, and publishes
    // snapshots; wait until everything shows up in one
    let mut observed_input = false;
    let mut observed_chunk = false;
    for _ in 0..500 {
        if let Some(state) = control.last_state() {
            observed_input |= state.player.position == position;
            observed_chunk |= state.land.chunk_table.find(pivot).is_some();
            if observed_input && observed_chunk && state.tick_id > TickId(10) {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(started.load(Ordering::SeqCst));
    assert_eq!(ticket_request.wait(), RequestStatus::Complete);
    assert!(ticket_request.payload().ticket.is_some());
    assert!(observed_input, "player input never published");
    assert!(observed_chunk, "terrain pipeline produced no chunk data");

    // Held snapshots stay consistent while the world advances
    let held = control.last_state().unwrap();
    let held_tick = held.tick_id;
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(held.tick_id, held_tick);
    assert!(control.last_state().unwrap().tick_id > held_tick);

    // Asynchronous save against the live world
    let saved = Arc::new(AtomicBool::new(false));
    {
        let saved = saved.clone();
        control.async_save_world(SaveRequest {
            progress_callback: None,
            result_callback: Some(Box::new(move |result| {
                result.unwrap();
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

    // Clean stop; dropping the ticket handle beforehand releases the area
    drop(ticket_request);
    let stopped = Arc::new(AtomicBool::new(false));
    {
        let stopped = stopped.clone();
        control.async_stop_world(SaveRequest {
            progress_callback: None,
            result_callback: Some(Box::new(move |result| {
                result.unwrap();
                stopped.store(true, Ordering::SeqCst);
            })),
        });
    }
    for _ in 0..200 {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(stopped.load(Ordering::SeqCst));
    assert!(control.last_state().is_none());
}
