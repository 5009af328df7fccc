//! Integration tests for the agent registry: registration defaults,
//! heartbeat behaviour, and the staleness sweep with work requeueing.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use foreman_core::clock::{Clock, ManualClock};
use foreman_core::phase::catalog;
use foreman_core::queue::EnqueueRequest;
use foreman_core::registry::RegisterRequest;
use foreman_core::{Engine, EngineConfig, EngineError};
use foreman_db::models::{AgentStatus, AgentType, Priority, TaskStatus};
use foreman_db::queries::tasks as task_db;
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

fn worker(capabilities: &[&str], capacity: Option<i32>) -> RegisterRequest {
    RegisterRequest {
        agent_type: AgentType::Worker,
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        capacity,
        phase_id: None,
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_defaults() {
    let (engine, _clock, db_name) = setup().await;

    let agent = engine
        .registry
        .register(worker(&["rust"], None))
        .await
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.current_load, 0);
    assert_eq!(agent.capacity, 1, "capacity defaults to 1");
    assert_eq!(agent.authority_level, 1, "workers get authority 1");

    let guardian = engine
        .registry
        .register(RegisterRequest {
            agent_type: AgentType::Guardian,
            capabilities: Vec::new(),
            capacity: None,
            phase_id: None,
        })
        .await
        .unwrap();
    assert_eq!(guardian.authority_level, 4);

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn register_rejects_bad_input() {
    let (engine, _clock, db_name) = setup().await;

    assert!(matches!(
        engine.registry.register(worker(&[], Some(0))).await,
        Err(EngineError::Validation(_))
    ));

    let mut req = worker(&[], None);
    req.phase_id = Some("PHASE_NOPE".to_owned());
    assert!(matches!(
        engine.registry.register(req).await,
        Err(EngineError::Validation(_))
    ));

    teardown(engine, &db_name).await;
}

// ---------------------------------------------------------------------------
// Heartbeats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_updates_timestamp_only() {
    let (engine, clock, db_name) = setup().await;

    let agent = engine.registry.register(worker(&[], None)).await.unwrap();

    clock.advance(Duration::seconds(10));
    engine.registry.heartbeat(agent.id, None).await.unwrap();
    let after_first = engine.registry.get(agent.id).await.unwrap();
    assert_eq!(after_first.last_heartbeat, clock.now());
    assert_eq!(after_first.status, AgentStatus::Idle);
    assert_eq!(after_first.current_load, 0);

    // Repeating at the same instant changes nothing but the timestamp.
    engine.registry.heartbeat(agent.id, None).await.unwrap();
    let after_second = engine.registry.get(agent.id).await.unwrap();
    assert_eq!(after_second.last_heartbeat, after_first.last_heartbeat);
    assert_eq!(after_second.status, after_first.status);
    assert_eq!(after_second.current_load, after_first.current_load);
    assert_eq!(after_second.capacity, after_first.capacity);

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn heartbeat_hint_and_errors() {
    let (engine, _clock, db_name) = setup().await;

    let agent = engine.registry.register(worker(&[], None)).await.unwrap();

    engine
        .registry
        .heartbeat(agent.id, Some(AgentStatus::Busy))
        .await
        .unwrap();
    assert_eq!(
        engine.registry.get(agent.id).await.unwrap().status,
        AgentStatus::Busy
    );

    // Engine-owned statuses cannot be self-reported.
    assert!(matches!(
        engine
            .registry
            .heartbeat(agent.id, Some(AgentStatus::Degraded))
            .await,
        Err(EngineError::Validation(_))
    ));

    assert!(matches!(
        engine.registry.heartbeat(Uuid::new_v4(), None).await,
        Err(EngineError::NotFound { .. })
    ));

    teardown(engine, &db_name).await;
}

// ---------------------------------------------------------------------------
// Staleness sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_agent_degraded_and_work_requeued() {
    let (engine, clock, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("stale test", "", Priority::Medium)
        .await
        .unwrap();
    let agent = engine.registry.register(worker(&[], None)).await.unwrap();

    let task = engine
        .queue
        .enqueue(EnqueueRequest {
            ticket_id: ticket.id,
            phase_id: "PHASE_IMPL".to_owned(),
            task_type: "work".to_owned(),
            description: "long running".to_owned(),
            priority: Priority::Medium,
            dependencies: Vec::new(),
            timeout_seconds: None,
            max_retries: None,
        })
        .await
        .unwrap();

    let assigned = engine.queue.next_assignment(agent.id).await.unwrap().unwrap();
    assert_eq!(assigned.id, task.id);
    engine.queue.start(task.id, agent.id).await.unwrap();
    engine.registry.heartbeat(agent.id, None).await.unwrap();

    // No heartbeats for 91 seconds.
    clock.advance(Duration::seconds(91));
    let stale = engine.registry.mark_stale(clock.now(), 90).await.unwrap();
    assert_eq!(stale, vec![agent.id]);

    let agent_row = engine.registry.get(agent.id).await.unwrap();
    assert_eq!(agent_row.status, AgentStatus::Degraded);
    assert_eq!(agent_row.current_load, 0);

    let task_row = task_db::get_task(&engine.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Pending);
    assert_eq!(task_row.retry_count, 1);
    assert!(task_row.assigned_agent_id.is_none());

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn heartbeat_exactly_at_threshold_is_not_stale() {
    let (engine, clock, db_name) = setup().await;

    let agent = engine.registry.register(worker(&[], None)).await.unwrap();
    engine.registry.heartbeat(agent.id, None).await.unwrap();

    clock.advance(Duration::seconds(90));
    let stale = engine.registry.mark_stale(clock.now(), 90).await.unwrap();
    assert!(stale.is_empty(), "equality is not staleness");

    clock.advance(Duration::seconds(1));
    let stale = engine.registry.mark_stale(clock.now(), 90).await.unwrap();
    assert_eq!(stale, vec![agent.id]);

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn stale_task_with_exhausted_budget_fails() {
    let (engine, clock, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("exhausted", "", Priority::Medium)
        .await
        .unwrap();
    let agent = engine.registry.register(worker(&[], None)).await.unwrap();

    let task = engine
        .queue
        .enqueue(EnqueueRequest {
            ticket_id: ticket.id,
            phase_id: "PHASE_IMPL".to_owned(),
            task_type: "work".to_owned(),
            description: "no budget".to_owned(),
            priority: Priority::Medium,
            dependencies: Vec::new(),
            timeout_seconds: None,
            max_retries: Some(0),
        })
        .await
        .unwrap();
    engine.queue.next_assignment(agent.id).await.unwrap().unwrap();
    engine.queue.start(task.id, agent.id).await.unwrap();
    engine.registry.heartbeat(agent.id, None).await.unwrap();

    clock.advance(Duration::seconds(120));
    engine.registry.mark_stale(clock.now(), 90).await.unwrap();

    let task_row = task_db::get_task(&engine.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Failed);

    teardown(engine, &db_name).await;
}

// ---------------------------------------------------------------------------
// Eligibility and termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn find_eligible_honors_capabilities() {
    let (engine, _clock, db_name) = setup().await;

    let skilled = engine
        .registry
        .register(worker(&["rust", "sql"], None))
        .await
        .unwrap();
    engine.registry.register(worker(&["docs"], None)).await.unwrap();

    let eligible = engine
        .registry
        .find_eligible("PHASE_IMPL", &["rust".to_owned()])
        .await
        .unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].id, skilled.id);

    teardown(engine, &db_name).await;
}

#[tokio::test]
async fn terminate_requires_idle_agent() {
    let (engine, _clock, db_name) = setup().await;

    let ticket = engine
        .phases
        .create_ticket("terminate", "", Priority::Medium)
        .await
        .unwrap();
    let agent = engine.registry.register(worker(&[], None)).await.unwrap();
    engine
        .queue
        .enqueue(EnqueueRequest {
            ticket_id: ticket.id,
            phase_id: "PHASE_IMPL".to_owned(),
            task_type: "work".to_owned(),
            description: "busy work".to_owned(),
            priority: Priority::Medium,
            dependencies: Vec::new(),
            timeout_seconds: None,
            max_retries: None,
        })
        .await
        .unwrap();
    engine.queue.next_assignment(agent.id).await.unwrap().unwrap();

    assert!(matches!(
        engine.registry.terminate(agent.id).await,
        Err(EngineError::Validation(_))
    ));

    let idle = engine.registry.register(worker(&[], None)).await.unwrap();
    engine.registry.terminate(idle.id).await.unwrap();
    assert_eq!(
        engine.registry.get(idle.id).await.unwrap().status,
        AgentStatus::Terminated
    );

    teardown(engine, &db_name).await;
}
