//! `foreman serve`: the HTTP command surface.
//!
//! Exposes the engine's operations as JSON endpoints. The transport adds
//! naming and serialisation only; every behaviour lives in foreman-core.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use foreman_core::discovery::BranchRequest;
use foreman_core::queue::{EnqueueRequest, FailureOutcome};
use foreman_core::registry::RegisterRequest;
use foreman_core::{Engine, EngineError};
use foreman_db::models::{
    Agent, AgentStatus, AgentType, Discovery, DiscoveryType, EventRow, GuardianAction, Priority,
    Task, TaskStatus, Ticket,
};
use foreman_db::queries::tasks::TicketProgress;
use foreman_db::queries::{events as event_db, tasks as task_db, tickets as ticket_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::IllegalTransition { .. }
            | EngineError::WrongAgent { .. }
            | EngineError::StaleVersion { .. } => StatusCode::CONFLICT,
            EngineError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            EngineError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTicketBody {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_priority")]
    priority: Priority,
}

fn default_priority() -> Priority {
    Priority::Medium
}

#[derive(Debug, Deserialize)]
struct EnqueueTaskBody {
    ticket_id: Uuid,
    phase_id: String,
    #[serde(default = "default_task_type")]
    task_type: String,
    description: String,
    #[serde(default = "default_priority")]
    priority: Priority,
    #[serde(default)]
    dependencies: Vec<Uuid>,
    #[serde(default)]
    timeout_seconds: Option<i64>,
    #[serde(default)]
    max_retries: Option<i32>,
}

fn default_task_type() -> String {
    "work".to_owned()
}

#[derive(Debug, Deserialize)]
struct RegisterAgentBody {
    agent_type: AgentType,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    capacity: Option<i32>,
    #[serde(default)]
    phase_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    #[serde(default)]
    status: Option<AgentStatus>,
}

#[derive(Debug, Deserialize)]
struct AgentActionBody {
    agent_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct SubmitResultBody {
    agent_id: Uuid,
    #[serde(default)]
    status_hint: Option<String>,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct FailTaskBody {
    agent_id: Uuid,
    error: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct FeedbackBody {
    feedback: String,
}

#[derive(Debug, Deserialize)]
struct RegressBody {
    to_phase: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct SubmissionBody {
    artifact_kind: String,
    artifact_ref: String,
}

#[derive(Debug, Deserialize)]
struct DiscoveryBody {
    source_task_id: Uuid,
    discovery_type: DiscoveryType,
    description: String,
    spawn_phase_id: String,
    spawn_description: String,
    #[serde(default)]
    spawn_priority: Option<Priority>,
    #[serde(default)]
    priority_boost: bool,
}

#[derive(Debug, Deserialize)]
struct GuardianCancelBody {
    task_id: Uuid,
    reason: String,
    initiated_by: String,
    authority: i32,
}

#[derive(Debug, Deserialize)]
struct GuardianReallocateBody {
    from_agent: Uuid,
    to_agent: Uuid,
    amount: i32,
    reason: String,
    initiated_by: String,
    authority: i32,
}

#[derive(Debug, Deserialize)]
struct GuardianOverrideBody {
    task_id: Uuid,
    new_priority: Priority,
    reason: String,
    initiated_by: String,
    authority: i32,
}

#[derive(Debug, Deserialize)]
struct GuardianRevertBody {
    action_id: Uuid,
    reason: String,
    initiated_by: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    pending: i64,
    blocked: i64,
    assigned: i64,
    running: i64,
    under_review: i64,
    completed: i64,
    failed: i64,
    cancelled: i64,
    timed_out: i64,
    total: i64,
}

impl From<TicketProgress> for ProgressResponse {
    fn from(p: TicketProgress) -> Self {
        Self {
            pending: p.pending,
            blocked: p.blocked,
            assigned: p.assigned,
            running: p.running,
            under_review: p.under_review,
            completed: p.completed,
            failed: p.failed,
            cancelled: p.cancelled,
            timed_out: p.timed_out,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
struct TicketDetailResponse {
    #[serde(flatten)]
    ticket: Ticket,
    progress: ProgressResponse,
    tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
struct AssignmentResponse {
    task: Option<Task>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: TaskStatus,
}

#[derive(Debug, Serialize)]
struct FailResponse {
    retried: bool,
}

#[derive(Debug, Serialize)]
struct DiscoveryResponse {
    discovery: Discovery,
    task: Task,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/tickets", post(create_ticket).get(list_tickets))
        .route("/api/tickets/{id}", get(get_ticket_detail))
        .route("/api/tickets/{id}/start", post(start_ticket))
        .route("/api/tickets/{id}/block", post(block_ticket))
        .route("/api/tickets/{id}/unblock", post(unblock_ticket))
        .route("/api/tickets/{id}/regress", post(regress_ticket))
        .route("/api/tickets/{id}/submissions", post(submit_workflow_result))
        .route("/api/tickets/{id}/events", get(list_ticket_events))
        .route("/api/tasks", post(enqueue_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/result", post(submit_task_result))
        .route("/api/tasks/{id}/fail", post(fail_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/approve", post(approve_task))
        .route("/api/tasks/{id}/reject", post(reject_task))
        .route("/api/agents", post(register_agent).get(list_agents))
        .route("/api/agents/{id}/heartbeat", post(heartbeat))
        .route("/api/assignments", post(next_assignment))
        .route("/api/discoveries", post(record_discovery))
        .route("/api/guardian/cancel-task", post(guardian_cancel))
        .route("/api/guardian/reallocate", post(guardian_reallocate))
        .route("/api/guardian/override-priority", post(guardian_override))
        .route("/api/guardian/revert", post(guardian_revert))
        .route("/api/guardian/actions", get(list_guardian_actions))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Bind and serve until the process is stopped.
pub async fn run_serve(engine: Engine, addr: &str) -> Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let app = build_router(Arc::new(engine));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("foreman API listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_ticket(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<CreateTicketBody>,
) -> Result<Json<Ticket>, AppError> {
    let ticket = engine
        .phases
        .create_ticket(&body.title, &body.description, body.priority)
        .await?;
    Ok(Json(ticket))
}

async fn list_tickets(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<Ticket>>, AppError> {
    Ok(Json(ticket_db::list_tickets(&engine.pool).await?))
}

async fn get_ticket_detail(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TicketDetailResponse>, AppError> {
    let ticket = engine.phases.get_ticket(id).await?;
    let progress = task_db::get_ticket_progress(&engine.pool, id).await?;
    let tasks = task_db::list_tasks_for_ticket(&engine.pool, id).await?;
    Ok(Json(TicketDetailResponse {
        ticket,
        progress: progress.into(),
        tasks,
    }))
}

async fn start_ticket(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ticket>, AppError> {
    Ok(Json(engine.phases.start_ticket(id).await?))
}

async fn block_ticket(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReasonBody>,
) -> Result<StatusCode, AppError> {
    engine.phases.block(id, &body.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unblock_ticket(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    engine.phases.unblock(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn regress_ticket(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<RegressBody>,
) -> Result<StatusCode, AppError> {
    engine.phases.regress(id, &body.to_phase, &body.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_workflow_result(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SubmissionBody>,
) -> Result<Json<foreman_db::models::WorkflowSubmission>, AppError> {
    let submission = engine
        .intake
        .submit(id, &body.artifact_kind, &body.artifact_ref)
        .await?;
    Ok(Json(submission))
}

async fn list_ticket_events(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<EventRow>>, AppError> {
    let events = event_db::list_for_entity(&engine.pool, "ticket", id, query.limit).await?;
    Ok(Json(events))
}

async fn enqueue_task(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<EnqueueTaskBody>,
) -> Result<Json<Task>, AppError> {
    let task = engine
        .queue
        .enqueue(EnqueueRequest {
            ticket_id: body.ticket_id,
            phase_id: body.phase_id,
            task_type: body.task_type,
            description: body.description,
            priority: body.priority,
            dependencies: body.dependencies,
            timeout_seconds: body.timeout_seconds,
            max_retries: body.max_retries,
        })
        .await?;
    Ok(Json(task))
}

async fn get_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    let task = task_db::get_task(&engine.pool, id)
        .await?
        .ok_or_else(|| EngineError::not_found("task", id))?;
    Ok(Json(task))
}

async fn next_assignment(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<AgentActionBody>,
) -> Result<Json<AssignmentResponse>, AppError> {
    let task = engine.queue.next_assignment(body.agent_id).await?;
    Ok(Json(AssignmentResponse { task }))
}

async fn start_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<AgentActionBody>,
) -> Result<StatusCode, AppError> {
    engine.queue.start(id, body.agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_task_result(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SubmitResultBody>,
) -> Result<Json<StatusResponse>, AppError> {
    let status = engine
        .queue
        .submit_result(id, body.agent_id, body.status_hint.as_deref(), body.result)
        .await?;
    Ok(Json(StatusResponse { status }))
}

async fn fail_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<FailTaskBody>,
) -> Result<Json<FailResponse>, AppError> {
    let outcome = engine
        .queue
        .fail(id, body.agent_id, &body.error, body.category.as_deref())
        .await?;
    Ok(Json(FailResponse {
        retried: outcome == FailureOutcome::Retried,
    }))
}

async fn cancel_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReasonBody>,
) -> Result<StatusCode, AppError> {
    engine.queue.cancel(id, &body.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn approve_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    engine.queue.approve(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reject_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<FeedbackBody>,
) -> Result<StatusCode, AppError> {
    engine.queue.reject(id, &body.feedback).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_agent(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<RegisterAgentBody>,
) -> Result<Json<Agent>, AppError> {
    let agent = engine
        .registry
        .register(RegisterRequest {
            agent_type: body.agent_type,
            capabilities: body.capabilities,
            capacity: body.capacity,
            phase_id: body.phase_id,
        })
        .await?;
    Ok(Json(agent))
}

async fn list_agents(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<Agent>>, AppError> {
    Ok(Json(engine.registry.list().await?))
}

async fn heartbeat(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(body): Json<HeartbeatBody>,
) -> Result<StatusCode, AppError> {
    engine.registry.heartbeat(id, body.status).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn record_discovery(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<DiscoveryBody>,
) -> Result<Json<DiscoveryResponse>, AppError> {
    let (discovery, task) = engine
        .discovery
        .record_and_branch(BranchRequest {
            source_task_id: body.source_task_id,
            discovery_type: body.discovery_type,
            description: body.description,
            spawn_phase_id: body.spawn_phase_id,
            spawn_description: body.spawn_description,
            spawn_priority: body.spawn_priority,
            priority_boost: body.priority_boost,
        })
        .await?;
    Ok(Json(DiscoveryResponse { discovery, task }))
}

async fn guardian_cancel(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<GuardianCancelBody>,
) -> Result<Json<GuardianAction>, AppError> {
    let action = engine
        .guardian
        .cancel_task(body.task_id, &body.reason, &body.initiated_by, body.authority)
        .await?;
    Ok(Json(action))
}

async fn guardian_reallocate(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<GuardianReallocateBody>,
) -> Result<Json<GuardianAction>, AppError> {
    let action = engine
        .guardian
        .reallocate_capacity(
            body.from_agent,
            body.to_agent,
            body.amount,
            &body.reason,
            &body.initiated_by,
            body.authority,
        )
        .await?;
    Ok(Json(action))
}

async fn guardian_override(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<GuardianOverrideBody>,
) -> Result<Json<GuardianAction>, AppError> {
    let action = engine
        .guardian
        .override_priority(
            body.task_id,
            body.new_priority,
            &body.reason,
            &body.initiated_by,
            body.authority,
        )
        .await?;
    Ok(Json(action))
}

async fn guardian_revert(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<GuardianRevertBody>,
) -> Result<Json<GuardianAction>, AppError> {
    let action = engine
        .guardian
        .revert(body.action_id, &body.reason, &body.initiated_by)
        .await?;
    Ok(Json(action))
}

async fn list_guardian_actions(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<GuardianAction>>, AppError> {
    Ok(Json(engine.guardian.list(query.limit).await?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use foreman_core::EngineConfig;
    use foreman_test_utils::{create_test_db, drop_test_db};

    use super::*;

    #[tokio::test]
    async fn create_and_fetch_ticket_over_http() {
        let (pool, db_name) = create_test_db().await;
        let engine = Arc::new(Engine::new(pool.clone(), EngineConfig::default()));
        let app = build_router(engine);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tickets")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "title": "http ticket",
                            "priority": "high"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let ticket: Ticket = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ticket.title, "http ticket");

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/tickets/{}", ticket.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn missing_ticket_is_404_with_json_error() {
        let (pool, db_name) = create_test_db().await;
        let engine = Arc::new(Engine::new(pool.clone(), EngineConfig::default()));
        let app = build_router(engine);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/tickets/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body.get("error").is_some());

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
