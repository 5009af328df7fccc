//! Integration tests for the task query layer: candidate selection,
//! optimistic transitions, dependency blocking, and the timeout sweep.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::{AgentType, Priority, TaskStatus};
use foreman_db::queries::agents::{self as agent_db, NewAgent};
use foreman_db::queries::phases::{self as phase_db, PhaseDef};
use foreman_db::queries::tasks::{self as task_db, CandidateParams, NewTask};
use foreman_db::queries::tickets::{self as ticket_db, NewTicket};
use foreman_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

const PHASE: &str = "PHASE_IMPL";

fn default_params() -> CandidateParams {
    CandidateParams {
        w_p: 0.45,
        w_a: 0.55,
        age_ceiling_s: 3600.0,
    }
}

async fn seed_phase(pool: &PgPool, id: &str, order: i32) {
    phase_db::upsert_phase(
        pool,
        &PhaseDef {
            id: id.to_owned(),
            display_name: id.to_owned(),
            sequence_order: order,
            allowed_transitions: Vec::new(),
            is_terminal: false,
            requires_review: false,
            done_definitions: vec!["done".to_owned()],
            expected_outputs: vec!["artifact".to_owned()],
            initial_prompt: String::new(),
            next_steps: String::new(),
        },
    )
    .await
    .expect("failed to seed phase");
}

async fn create_ticket(pool: &PgPool) -> Uuid {
    ticket_db::insert_ticket(
        pool,
        &NewTicket {
            title: "test ticket".to_owned(),
            description: String::new(),
            priority: Priority::Medium,
            phase_id: None,
        },
    )
    .await
    .expect("failed to insert ticket")
    .id
}

async fn create_agent(pool: &PgPool) -> Uuid {
    agent_db::insert_agent(
        pool,
        &NewAgent {
            agent_type: AgentType::Worker,
            phase_id: None,
            capabilities: Vec::new(),
            capacity: 1,
            authority_level: 1,
        },
    )
    .await
    .expect("failed to insert agent")
    .id
}

fn new_task(ticket_id: Uuid, priority: Priority, dependencies: Vec<Uuid>) -> NewTask {
    NewTask {
        ticket_id,
        phase_id: PHASE.to_owned(),
        task_type: "work".to_owned(),
        description: "do the thing".to_owned(),
        priority,
        dependencies,
        max_retries: 3,
        timeout_seconds: None,
        not_before: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Insert / fetch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;

    let dep = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Low, vec![]))
        .await
        .unwrap();
    let task = task_db::insert_task(&pool, &new_task(ticket_id, Priority::High, vec![dep.id]))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.version, 0);
    assert!(task.assigned_agent_id.is_none());

    let fetched = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.dependencies.0, vec![dep.id]);
    assert_eq!(fetched.priority, Priority::High);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Candidate selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn candidate_ordering_follows_priority_for_fresh_tasks() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;

    let low = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Low, vec![]))
        .await
        .unwrap();
    let high = task_db::insert_task(&pool, &new_task(ticket_id, Priority::High, vec![]))
        .await
        .unwrap();
    let medium = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();

    let candidate = task_db::lock_next_candidate(&pool, None, Utc::now(), &default_params())
        .await
        .unwrap()
        .expect("one candidate expected");
    assert_eq!(candidate.id, high.id, "high beats medium and low");

    // Retire the high task; medium should be next, then low.
    task_db::mark_cancelled(&pool, high.id, TaskStatus::Pending, Utc::now())
        .await
        .unwrap();
    let candidate = task_db::lock_next_candidate(&pool, None, Utc::now(), &default_params())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.id, medium.id);

    task_db::mark_cancelled(&pool, medium.id, TaskStatus::Pending, Utc::now())
        .await
        .unwrap();
    let candidate = task_db::lock_next_candidate(&pool, None, Utc::now(), &default_params())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.id, low.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dependencies_gate_candidates() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;
    let agent_id = create_agent(&pool).await;

    let t1 = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();
    let t2 = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Critical, vec![t1.id]))
        .await
        .unwrap();

    // T2 outranks T1 on priority but its dependency is not completed.
    let candidate = task_db::lock_next_candidate(&pool, None, Utc::now(), &default_params())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.id, t1.id, "only T1 is eligible");

    // Drive T1 to completed; now T2 becomes eligible.
    task_db::mark_assigned(&pool, t1.id, agent_id).await.unwrap();
    task_db::mark_started(&pool, t1.id, Utc::now()).await.unwrap();
    task_db::mark_completed(&pool, t1.id, TaskStatus::Running, None, Utc::now())
        .await
        .unwrap();

    let candidate = task_db::lock_next_candidate(&pool, None, Utc::now(), &default_params())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.id, t2.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn backoff_window_excludes_candidates() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;

    let mut req = new_task(ticket_id, Priority::High, vec![]);
    req.not_before = Utc::now() + Duration::seconds(60);
    task_db::insert_task(&pool, &req).await.unwrap();

    let candidate = task_db::lock_next_candidate(&pool, None, Utc::now(), &default_params())
        .await
        .unwrap();
    assert!(candidate.is_none(), "task inside backoff window is hidden");

    let candidate = task_db::lock_next_candidate(
        &pool,
        None,
        Utc::now() + Duration::seconds(61),
        &default_params(),
    )
    .await
    .unwrap();
    assert!(candidate.is_some(), "task visible after the window passes");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn phase_filter_restricts_candidates() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    seed_phase(&pool, "PHASE_OTHER", 2).await;
    let ticket_id = create_ticket(&pool).await;

    task_db::insert_task(&pool, &new_task(ticket_id, Priority::High, vec![]))
        .await
        .unwrap();

    let candidate =
        task_db::lock_next_candidate(&pool, Some("PHASE_OTHER"), Utc::now(), &default_params())
            .await
            .unwrap();
    assert!(candidate.is_none(), "wrong phase scope must not match");

    let candidate =
        task_db::lock_next_candidate(&pool, Some(PHASE), Utc::now(), &default_params())
            .await
            .unwrap();
    assert!(candidate.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn equal_scores_break_by_created_at() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;

    let now = Utc::now();
    let mut first = new_task(ticket_id, Priority::Medium, vec![]);
    first.not_before = now;
    let first = task_db::insert_task(&pool, &first).await.unwrap();
    let second = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();
    assert!(first.created_at <= second.created_at);

    // Evaluate far in the future so both age terms saturate and the scores
    // are exactly equal.
    let candidate = task_db::lock_next_candidate(
        &pool,
        None,
        now + Duration::seconds(7200),
        &default_params(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(candidate.id, first.id, "older task wins the tie");

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Optimistic transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transition_requires_expected_status() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;
    let agent_id = create_agent(&pool).await;

    let task = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();

    // Starting a pending task affects zero rows.
    let rows = task_db::mark_started(&pool, task.id, Utc::now()).await.unwrap();
    assert_eq!(rows, 0);

    let rows = task_db::mark_assigned(&pool, task.id, agent_id).await.unwrap();
    assert_eq!(rows, 1);

    // Double-assign affects zero rows.
    let rows = task_db::mark_assigned(&pool, task.id, agent_id).await.unwrap();
    assert_eq!(rows, 0);

    let rows = task_db::mark_started(&pool, task.id, Utc::now()).await.unwrap();
    assert_eq!(rows, 1);

    let fetched = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Running);
    assert!(fetched.started_at.is_some());
    assert_eq!(fetched.version, 2, "each transition bumps the version");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_requeue_clears_agent_and_bumps_count() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;
    let agent_id = create_agent(&pool).await;

    let task = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();
    task_db::mark_assigned(&pool, task.id, agent_id).await.unwrap();
    task_db::mark_started(&pool, task.id, Utc::now()).await.unwrap();

    let not_before = Utc::now() + Duration::seconds(2);
    let rows = task_db::requeue_for_retry(
        &pool,
        task.id,
        TaskStatus::Running,
        not_before,
        "transient failure",
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let fetched = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Pending);
    assert_eq!(fetched.retry_count, 1);
    assert!(fetched.assigned_agent_id.is_none());
    assert!(fetched.started_at.is_none());
    assert_eq!(fetched.error_message.as_deref(), Some("transient failure"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Dependency blocking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependents_blocked_by_containment_query() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;

    let dep = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();
    let child = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![dep.id]))
        .await
        .unwrap();
    let bystander = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();

    let blocked = task_db::mark_dependents_blocked(&pool, dep.id).await.unwrap();
    assert_eq!(blocked, vec![child.id]);

    let child = task_db::get_task(&pool, child.id).await.unwrap().unwrap();
    assert_eq!(child.status, TaskStatus::Blocked);
    let bystander = task_db::get_task(&pool, bystander.id).await.unwrap().unwrap();
    assert_eq!(bystander.status, TaskStatus::Pending);

    // A blocked task never comes back as a candidate.
    let candidate = task_db::lock_next_candidate(&pool, None, Utc::now(), &default_params())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.id, bystander.id);

    // Until it is explicitly requeued.
    let rows = task_db::unblock_task(&pool, child.id).await.unwrap();
    assert_eq!(rows, 1);
    let child = task_db::get_task(&pool, child.id).await.unwrap().unwrap();
    assert_eq!(child.status, TaskStatus::Pending);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Timeout sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_sweep_is_strict_and_scoped() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;
    let agent_id = create_agent(&pool).await;

    let started = Utc::now();

    let mut overdue = new_task(ticket_id, Priority::Medium, vec![]);
    overdue.timeout_seconds = Some(30);
    let overdue = task_db::insert_task(&pool, &overdue).await.unwrap();
    task_db::mark_assigned(&pool, overdue.id, agent_id).await.unwrap();
    task_db::mark_started(&pool, overdue.id, started).await.unwrap();

    let mut no_deadline = new_task(ticket_id, Priority::Medium, vec![]);
    no_deadline.timeout_seconds = None;
    let no_deadline = task_db::insert_task(&pool, &no_deadline).await.unwrap();

    // Exactly at the deadline: not overdue (strict inequality).
    let swept = task_db::sweep_mark_timed_out(&pool, started + Duration::seconds(30))
        .await
        .unwrap();
    assert!(swept.is_empty());

    // One second past the deadline: swept.
    let swept = task_db::sweep_mark_timed_out(&pool, started + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].id, overdue.id);
    assert_eq!(swept[0].status, TaskStatus::TimedOut);

    let untouched = task_db::get_task(&pool, no_deadline.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Pending);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ticket_progress_counts_by_status() {
    let (pool, db_name) = create_test_db().await;
    seed_phase(&pool, PHASE, 1).await;
    let ticket_id = create_ticket(&pool).await;
    let agent_id = create_agent(&pool).await;

    let a = task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();
    task_db::insert_task(&pool, &new_task(ticket_id, Priority::Medium, vec![]))
        .await
        .unwrap();

    task_db::mark_assigned(&pool, a.id, agent_id).await.unwrap();
    task_db::mark_started(&pool, a.id, Utc::now()).await.unwrap();
    task_db::mark_completed(&pool, a.id, TaskStatus::Running, None, Utc::now())
        .await
        .unwrap();

    let progress = task_db::get_ticket_progress(&pool, ticket_id).await.unwrap();
    assert_eq!(progress.total, 2);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.pending, 1);

    assert_eq!(
        task_db::count_open_in_phase(&pool, ticket_id, PHASE).await.unwrap(),
        1
    );
    assert_eq!(
        task_db::count_completed_in_phase(&pool, ticket_id, PHASE)
            .await
            .unwrap(),
        1
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
