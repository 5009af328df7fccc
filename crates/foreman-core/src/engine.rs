//! Engine assembly: constructs every component from its collaborators and
//! wires the event-bus couplings (task completion and workflow-result
//! validation feed the phase engine's gate evaluation).

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::discovery::DiscoveryService;
use crate::error::EngineError;
use crate::events::topics;
use crate::guardian::Guardian;
use crate::intake::ResultIntake;
use crate::monitor::HealthMonitor;
use crate::orchestrator;
use crate::phase::PhaseEngine;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;

/// The assembled orchestration kernel.
///
/// Construction wires every component from the same pool, bus, clock, and
/// config; nothing reads global state, so tests can assemble an engine
/// against a temporary database and a manual clock.
pub struct Engine {
    pub pool: PgPool,
    pub config: EngineConfig,
    pub bus: EventBus,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<AgentRegistry>,
    pub phases: Arc<PhaseEngine>,
    pub discovery: Arc<DiscoveryService>,
    pub guardian: Arc<Guardian>,
    pub intake: Arc<ResultIntake>,
    pub monitor: Arc<HealthMonitor>,
}

impl Engine {
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let bus = EventBus::default();
        let queue = Arc::new(TaskQueue::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&clock),
            config.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&clock),
            config.clone(),
        ));
        let phases = Arc::new(PhaseEngine::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&clock),
            config.clone(),
        ));
        let discovery = Arc::new(DiscoveryService::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&clock),
            config.clone(),
        ));
        let guardian = Arc::new(Guardian::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&clock),
            config.clone(),
        ));
        let intake = Arc::new(ResultIntake::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&clock),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            bus.clone(),
            clock,
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&queue),
        ));

        Self {
            pool,
            config,
            bus,
            queue,
            registry,
            phases,
            discovery,
            guardian,
            intake,
            monitor,
        }
    }

    /// Run the engine: `workers` orchestrator loops, the health monitor's
    /// three sweeps, and the phase wiring. Returns once `cancel` fires and
    /// every loop has reached a safe point.
    pub async fn run(&self, workers: usize, cancel: CancellationToken) {
        let mut handles = Vec::new();

        for worker in 0..workers.max(1) {
            let queue = Arc::clone(&self.queue);
            let registry = Arc::clone(&self.registry);
            let bus = self.bus.clone();
            let config = self.config.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!(worker, "orchestrator worker started");
                orchestrator::run_orchestrator(queue, registry, bus, config, cancel).await;
            }));
        }

        {
            let monitor = Arc::clone(&self.monitor);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                monitor.run(cancel).await;
            }));
        }

        {
            let phases = Arc::clone(&self.phases);
            let bus = self.bus.clone();
            handles.push(tokio::spawn(async move {
                run_phase_wiring(phases, bus, cancel).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "engine loop panicked");
            }
        }
    }
}

/// Route bus events into the phase engine: a completed task or a validated
/// workflow result both re-evaluate the owning ticket's gate.
async fn run_phase_wiring(phases: Arc<PhaseEngine>, bus: EventBus, cancel: CancellationToken) {
    let mut completed = bus.subscribe(topics::TASK_COMPLETED);
    let mut validated = bus.subscribe(topics::WORKFLOW_RESULT_VALIDATED);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = completed.recv() => {
                let Some(event) = event else { break };
                match phases.on_task_completed(event.entity_id).await {
                    Ok(outcome) => {
                        tracing::debug!(task_id = %event.entity_id, ?outcome, "gate evaluated");
                    }
                    Err(EngineError::NotFound { .. }) => {}
                    Err(e) => {
                        tracing::error!(
                            task_id = %event.entity_id,
                            error = %e,
                            "gate evaluation failed"
                        );
                    }
                }
            }
            event = validated.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = phases.try_advance(event.entity_id).await {
                    tracing::error!(
                        ticket_id = %event.entity_id,
                        error = %e,
                        "gate evaluation after result validation failed"
                    );
                }
            }
        }
    }
}
