//! Orchestrator integration tests: the scheduling pass, the assembled
//! engine's event wiring, and cooperative shutdown.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_core::clock::ManualClock;
use foreman_core::orchestrator;
use foreman_core::phase::catalog;
use foreman_core::queue::EnqueueRequest;
use foreman_core::registry::RegisterRequest;
use foreman_core::{Engine, EngineConfig};
use foreman_db::models::{AgentType, Priority, TaskStatus};
use foreman_db::queries::tasks as task_db;
use foreman_test_utils::{create_test_db, drop_test_db};

async fn setup() -> (Engine, String) {
    let (pool, db_name) = create_test_db().await;
    catalog::seed_phases(&pool).await.expect("seed phases");
    let clock = Arc::new(ManualClock::at(Utc::now()));
    let engine = Engine::with_clock(pool, EngineConfig::default(), clock);
    (engine, db_name)
}

async fn register_worker(engine: &Engine, capacity: i32) -> Uuid {
    engine
        .registry
        .register(RegisterRequest {
            agent_type: AgentType::Worker,
            capabilities: Vec::new(),
            capacity: Some(capacity),
            phase_id: None,
        })
        .await
        .unwrap()
        .id
}

fn task_req(ticket_id: Uuid) -> EnqueueRequest {
    EnqueueRequest {
        ticket_id,
        phase_id: "PHASE_IMPL".to_owned(),
        task_type: "work".to_owned(),
        description: "scheduled work".to_owned(),
        priority: Priority::Medium,
        dependencies: Vec::new(),
        timeout_seconds: None,
        max_retries: None,
    }
}

#[tokio::test]
async fn tick_assigns_up_to_capacity_across_agents() {
    let (engine, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("tick", "", Priority::Medium)
        .await
        .unwrap();
    for _ in 0..3 {
        engine.queue.enqueue(task_req(ticket.id)).await.unwrap();
    }

    let a1 = register_worker(&engine, 1).await;
    let a2 = register_worker(&engine, 1).await;

    let assigned = orchestrator::tick_once(&engine.queue, &engine.registry)
        .await
        .unwrap();
    assert_eq!(assigned, 2, "one assignment per available agent per tick");

    let a1_row = engine.registry.get(a1).await.unwrap();
    let a2_row = engine.registry.get(a2).await.unwrap();
    assert_eq!(a1_row.current_load + a2_row.current_load, 2);

    // Both agents full: the next tick assigns nothing.
    let assigned = orchestrator::tick_once(&engine.queue, &engine.registry)
        .await
        .unwrap();
    assert_eq!(assigned, 0);

    engine.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn engine_run_drives_a_ticket_into_design() {
    let (pool, db_name) = create_test_db().await;
    catalog::seed_phases(&pool).await.expect("seed phases");
    let engine = Arc::new(Engine::new(pool, EngineConfig::default()));

    let agent_id = register_worker(&engine, 1).await;
    let mut assigned_events = engine.bus.subscribe("task.assigned");

    let ticket = engine
        .phases
        .create_ticket("end to end", "", Priority::Medium)
        .await
        .unwrap();
    engine.phases.start_ticket(ticket.id).await.unwrap();

    let cancel = CancellationToken::new();
    let run_handle = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(1, cancel).await })
    };

    // Play the agent: complete whatever the orchestrator hands us, and feed
    // the requirements gate so the phase engine can advance the ticket.
    let drive = async {
        loop {
            let event = assigned_events
                .recv()
                .await
                .expect("bus closed unexpectedly");
            let task_id = event.entity_id;
            engine.queue.start(task_id, agent_id).await.unwrap();
            engine
                .queue
                .submit_result(
                    task_id,
                    agent_id,
                    None,
                    serde_json::json!({ "schema_version": 1 }),
                )
                .await
                .unwrap();

            let row = engine.phases.get_ticket(ticket.id).await.unwrap();
            if row.phase_id.as_deref() == Some("PHASE_REQUIREMENTS") {
                engine
                    .intake
                    .submit(ticket.id, "requirements_doc", "doc://req")
                    .await
                    .unwrap();
                engine
                    .intake
                    .submit(ticket.id, "acceptance_criteria", "doc://acc")
                    .await
                    .unwrap();
            }

            // Wait for the phase wiring to advance the ticket.
            for _ in 0..100 {
                let row = engine.phases.get_ticket(ticket.id).await.unwrap();
                if row.phase_id.as_deref() == Some("PHASE_DESIGN") {
                    return;
                }
                tokio::time::sleep(StdDuration::from_millis(100)).await;
            }
        }
    };

    tokio::time::timeout(StdDuration::from_secs(60), drive)
        .await
        .expect("ticket should reach PHASE_DESIGN before the deadline");

    let row = engine.phases.get_ticket(ticket.id).await.unwrap();
    assert_eq!(row.phase_id.as_deref(), Some("PHASE_DESIGN"));

    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(10), run_handle)
        .await
        .expect("engine should stop after cancellation")
        .unwrap();

    engine.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancellation_stops_the_worker_between_transactions() {
    let (engine, db_name) = setup().await;
    let engine = Arc::new(engine);

    let cancel = CancellationToken::new();
    let handle = {
        let queue = Arc::clone(&engine.queue);
        let registry = Arc::clone(&engine.registry);
        let bus = engine.bus.clone();
        let config = engine.config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator::run_orchestrator(queue, registry, bus, config, cancel).await
        })
    };

    // Let it run a few ticks, then stop it.
    tokio::time::sleep(StdDuration::from_millis(600)).await;
    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("worker should exit promptly")
        .unwrap();

    engine.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn assignment_survives_competition_for_one_task() {
    let (engine, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("contention", "", Priority::Medium)
        .await
        .unwrap();
    let task = engine.queue.enqueue(task_req(ticket.id)).await.unwrap();

    let a1 = register_worker(&engine, 1).await;
    let a2 = register_worker(&engine, 1).await;

    let (r1, r2) = tokio::join!(
        engine.queue.next_assignment(a1),
        engine.queue.next_assignment(a2),
    );
    let r1 = r1.unwrap();
    let r2 = r2.unwrap();

    let winners = [r1.is_some(), r2.is_some()]
        .iter()
        .filter(|x| **x)
        .count();
    assert_eq!(winners, 1, "exactly one agent wins the task");

    let row = task_db::get_task(&engine.pool, task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Assigned);

    engine.pool.close().await;
    drop_test_db(&db_name).await;
}
