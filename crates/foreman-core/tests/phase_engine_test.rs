//! Integration tests for the phase engine: ticket lifecycle, gate
//! evaluation, auto-transition, successor nomination, and regression.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use foreman_core::clock::{Clock, ManualClock};
use foreman_core::phase::{AdvanceOutcome, catalog};
use foreman_core::registry::RegisterRequest;
use foreman_core::{Engine, EngineConfig, EngineError};
use foreman_db::models::{AgentType, Priority, TaskStatus, TicketStatus};
use foreman_db::queries::{events as event_db, tasks as task_db, tickets as ticket_db};
use foreman_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn setup() -> (Engine, Arc<ManualClock>, String) {
    let (pool, db_name) = create_test_db().await;
    catalog::seed_phases(&pool).await.expect("seed phases");
    let clock = Arc::new(ManualClock::at(Utc::now()));
    let engine = Engine::with_clock(pool, EngineConfig::default(), clock.clone());
    (engine, clock, db_name)
}

async fn teardown(engine: Engine, db_name: &str) {
    engine.pool.close().await;
    drop_test_db(db_name).await;
}

async fn register_worker(engine: &Engine) -> Uuid {
    engine
        .registry
        .register(RegisterRequest {
            agent_type: AgentType::Worker,
            capabilities: Vec::new(),
            capacity: Some(4),
            phase_id: None,
        })
        .await
        .unwrap()
        .id
}

/// Drive every open task in the ticket's current phase to `completed`,
/// submitting `result` as the envelope.
async fn complete_phase_tasks(engine: &Engine, ticket_id: Uuid, agent_id: Uuid, result: serde_json::Value) {
    let ticket = engine.phases.get_ticket(ticket_id).await.unwrap();
    let phase_id = ticket.phase_id.clone().expect("ticket should have a phase");
    let tasks = task_db::list_tasks_in_phase(&engine.pool, ticket_id, &phase_id)
        .await
        .unwrap();
    for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
        let assigned = engine
            .queue
            .next_assignment(agent_id)
            .await
            .unwrap()
            .expect("task should be assignable");
        assert_eq!(assigned.id, task.id);
        engine.queue.start(task.id, agent_id).await.unwrap();
        let status = engine
            .queue
            .submit_result(task.id, agent_id, None, result.clone())
            .await
            .unwrap();
        if status == TaskStatus::UnderReview {
            engine.queue.approve(task.id).await.unwrap();
        }
    }
}

fn envelope() -> serde_json::Value {
    serde_json::json!({ "schema_version": 1, "summary": "done" })
}

// ---------------------------------------------------------------------------
// Ticket lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_ticket_enters_initial_phase_and_seeds() {
    let (engine, _clock, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("build the widget", "a widget", Priority::High)
        .await
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Pending);
    assert!(ticket.phase_id.is_none());

    let started = engine.phases.start_ticket(ticket.id).await.unwrap();
    assert_eq!(started.status, TicketStatus::InProgress);
    assert_eq!(started.phase_id.as_deref(), Some("PHASE_REQUIREMENTS"));

    let tasks = task_db::list_tasks_for_ticket(&engine.pool, ticket.id).await.unwrap();
    assert_eq!(tasks.len(), 1, "the phase template seeds one task");
    assert_eq!(tasks[0].task_type, "seed");
    assert_eq!(tasks[0].priority, Priority::High, "seed inherits ticket priority");

    // Starting twice is an illegal transition.
    assert!(matches!(
        engine.phases.start_ticket(ticket.id).await,
        Err(EngineError::IllegalTransition { .. })
    ));

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn block_and_unblock_roundtrip() {
    let (engine, _clock, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("blockable", "", Priority::Medium)
        .await
        .unwrap();

    // A pending ticket cannot be blocked.
    assert!(matches!(
        engine.phases.block(ticket.id, "too soon").await,
        Err(EngineError::IllegalTransition { .. })
    ));

    engine.phases.start_ticket(ticket.id).await.unwrap();
    engine.phases.block(ticket.id, "waiting on vendor").await.unwrap();
    assert_eq!(
        engine.phases.get_ticket(ticket.id).await.unwrap().status,
        TicketStatus::Blocked
    );

    engine.phases.unblock(ticket.id).await.unwrap();
    assert_eq!(
        engine.phases.get_ticket(ticket.id).await.unwrap().status,
        TicketStatus::InProgress
    );

    teardown(engine, &db_name).await;
}

// ---------------------------------------------------------------------------
// Gate evaluation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gate_needs_terminal_tasks_and_satisfied_criteria() {
    let (engine, _clock, db_name) = setup().await;
    let agent_id = register_worker(&engine).await;

    let ticket = engine
        .phases
        .create_ticket("gated", "", Priority::Medium)
        .await
        .unwrap();
    engine.phases.start_ticket(ticket.id).await.unwrap();

    // Seed task still open: not ready.
    assert_eq!(
        engine.phases.try_advance(ticket.id).await.unwrap(),
        AdvanceOutcome::NotReady
    );

    complete_phase_tasks(&engine, ticket.id, agent_id, envelope()).await;

    // Tasks done but no gate criteria satisfied yet: still not ready.
    assert_eq!(
        engine.phases.try_advance(ticket.id).await.unwrap(),
        AdvanceOutcome::NotReady
    );

    // Satisfy the requirements gate via result intake.
    engine
        .intake
        .submit(ticket.id, "requirements_doc", "doc://req-1")
        .await
        .unwrap();
    assert_eq!(
        engine.phases.try_advance(ticket.id).await.unwrap(),
        AdvanceOutcome::NotReady,
        "one of two criteria satisfied"
    );

    engine
        .intake
        .submit(ticket.id, "acceptance_criteria", "doc://acc-1")
        .await
        .unwrap();
    let outcome = engine.phases.try_advance(ticket.id).await.unwrap();
    assert_eq!(
        outcome,
        AdvanceOutcome::Advanced {
            to_phase: "PHASE_DESIGN".to_owned()
        }
    );

    let ticket_row = engine.phases.get_ticket(ticket.id).await.unwrap();
    assert_eq!(ticket_row.phase_id.as_deref(), Some("PHASE_DESIGN"));
    assert_eq!(ticket_row.status, TicketStatus::InProgress);

    // The new phase got its seed task.
    let design_tasks =
        task_db::list_tasks_in_phase(&engine.pool, ticket.id, "PHASE_DESIGN")
            .await
            .unwrap();
    assert_eq!(design_tasks.len(), 1);

    // The transition is durably recorded.
    assert!(
        event_db::has_event_of_type(&engine.pool, "phase.transitioned", ticket.id)
            .await
            .unwrap()
    );

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn multiple_successors_without_nomination_blocks() {
    let (engine, clock, db_name) = setup().await;
    let agent_id = register_worker(&engine).await;

    let ticket = engine
        .phases
        .create_ticket("ambiguous", "", Priority::Medium)
        .await
        .unwrap();
    engine.phases.start_ticket(ticket.id).await.unwrap();

    // Jump the ticket straight onto the fork phase.
    let row = engine.phases.get_ticket(ticket.id).await.unwrap();
    ticket_db::set_phase(
        &engine.pool,
        ticket.id,
        "PHASE_TESTING",
        None,
        row.version,
        clock.now(),
    )
    .await
    .unwrap();
    // Retire the requirements seed so only the testing task counts.
    let seeds = task_db::list_tasks_in_phase(&engine.pool, ticket.id, "PHASE_REQUIREMENTS")
        .await
        .unwrap();
    for seed in &seeds {
        engine.queue.cancel(seed.id, "jumped ahead").await.unwrap();
    }

    engine
        .queue
        .enqueue(foreman_core::queue::EnqueueRequest {
            ticket_id: ticket.id,
            phase_id: "PHASE_TESTING".to_owned(),
            task_type: "work".to_owned(),
            description: "run the suite".to_owned(),
            priority: Priority::Medium,
            dependencies: Vec::new(),
            timeout_seconds: None,
            max_retries: None,
        })
        .await
        .unwrap();

    // Complete the testing task without nominating a successor.
    complete_phase_tasks(&engine, ticket.id, agent_id, envelope()).await;
    engine
        .intake
        .submit(ticket.id, "test_report", "doc://report-1")
        .await
        .unwrap();

    let outcome = engine.phases.try_advance(ticket.id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Ambiguous);
    assert_eq!(
        engine.phases.get_ticket(ticket.id).await.unwrap().status,
        TicketStatus::Blocked
    );

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn nominated_successor_completes_the_workflow() {
    let (engine, clock, db_name) = setup().await;
    let agent_id = register_worker(&engine).await;

    let ticket = engine
        .phases
        .create_ticket("nominated", "", Priority::Medium)
        .await
        .unwrap();
    engine.phases.start_ticket(ticket.id).await.unwrap();

    let row = engine.phases.get_ticket(ticket.id).await.unwrap();
    ticket_db::set_phase(
        &engine.pool,
        ticket.id,
        "PHASE_TESTING",
        None,
        row.version,
        clock.now(),
    )
    .await
    .unwrap();
    let seeds = task_db::list_tasks_in_phase(&engine.pool, ticket.id, "PHASE_REQUIREMENTS")
        .await
        .unwrap();
    for seed in &seeds {
        engine.queue.cancel(seed.id, "jumped ahead").await.unwrap();
    }

    engine
        .queue
        .enqueue(foreman_core::queue::EnqueueRequest {
            ticket_id: ticket.id,
            phase_id: "PHASE_TESTING".to_owned(),
            task_type: "work".to_owned(),
            description: "run the suite".to_owned(),
            priority: Priority::Medium,
            dependencies: Vec::new(),
            timeout_seconds: None,
            max_retries: None,
        })
        .await
        .unwrap();

    let nominating = serde_json::json!({
        "schema_version": 1,
        "summary": "all green",
        "next_phase": "PHASE_DONE"
    });
    complete_phase_tasks(&engine, ticket.id, agent_id, nominating).await;
    engine
        .intake
        .submit(ticket.id, "test_report", "doc://report-2")
        .await
        .unwrap();

    let outcome = engine.phases.try_advance(ticket.id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Completed);

    let ticket_row = engine.phases.get_ticket(ticket.id).await.unwrap();
    assert_eq!(ticket_row.status, TicketStatus::Completed);
    assert_eq!(ticket_row.phase_id.as_deref(), Some("PHASE_DONE"));

    teardown(engine, &db_name).await;
}

// ---------------------------------------------------------------------------
// Regression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn regress_cancels_open_tasks_and_reseeds() {
    let (engine, clock, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("regression", "", Priority::Medium)
        .await
        .unwrap();
    engine.phases.start_ticket(ticket.id).await.unwrap();

    let row = engine.phases.get_ticket(ticket.id).await.unwrap();
    ticket_db::set_phase(
        &engine.pool,
        ticket.id,
        "PHASE_TESTING",
        None,
        row.version,
        clock.now(),
    )
    .await
    .unwrap();
    let open = engine
        .queue
        .enqueue(foreman_core::queue::EnqueueRequest {
            ticket_id: ticket.id,
            phase_id: "PHASE_TESTING".to_owned(),
            task_type: "work".to_owned(),
            description: "to be cancelled".to_owned(),
            priority: Priority::Medium,
            dependencies: Vec::new(),
            timeout_seconds: None,
            max_retries: None,
        })
        .await
        .unwrap();

    // Regress forward is rejected.
    assert!(matches!(
        engine.phases.regress(ticket.id, "PHASE_DONE", "nope").await,
        Err(EngineError::Validation(_))
    ));

    engine
        .phases
        .regress(ticket.id, "PHASE_IMPL", "tests exposed design gap")
        .await
        .unwrap();

    let ticket_row = engine.phases.get_ticket(ticket.id).await.unwrap();
    assert_eq!(ticket_row.phase_id.as_deref(), Some("PHASE_IMPL"));
    assert_eq!(ticket_row.status, TicketStatus::InProgress);

    let cancelled = task_db::get_task(&engine.pool, open.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let impl_tasks = task_db::list_tasks_in_phase(&engine.pool, ticket.id, "PHASE_IMPL")
        .await
        .unwrap();
    assert_eq!(impl_tasks.len(), 1, "target phase reseeded");

    teardown(engine, &db_name).await;
}
