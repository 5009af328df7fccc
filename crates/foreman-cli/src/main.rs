mod agent_cmds;
mod config;
mod guardian_cmds;
mod init_cmd;
mod log_cmd;
mod run_cmd;
mod serve_cmd;
mod status_cmd;
mod task_cmds;
mod ticket_cmds;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

use foreman_core::Engine;
use foreman_db::pool;

#[derive(Parser)]
#[command(name = "foreman", about = "Multi-agent workflow orchestration engine")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/foreman")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the database: create it, run migrations, seed phases
    DbInit,
    /// Run the engine: orchestrator workers plus health sweeps
    Run {
        /// Number of concurrent orchestrator workers
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Serve the HTTP command surface
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:7180")]
        addr: String,
    },
    /// Ticket management
    Ticket {
        #[command(subcommand)]
        command: TicketCommands,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Agent management
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Guardian interventions (authority level 4 required)
    Guardian {
        #[command(subcommand)]
        command: GuardianCommands,
    },
    /// Show ticket progress (omit ticket_id to list all tickets)
    Status {
        /// Ticket ID (omit to list all tickets)
        ticket_id: Option<String>,
    },
    /// Show the durable event log for an entity
    Log {
        /// Entity type: ticket, task, agent, guardian_action
        entity_type: String,
        /// Entity ID
        entity_id: String,
        /// Maximum events to show
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum TicketCommands {
    /// Create a ticket
    Create {
        title: String,
        /// Longer description of the work
        #[arg(long, default_value = "")]
        description: String,
        /// critical, high, medium, or low
        #[arg(long, default_value = "medium")]
        priority: String,
    },
    /// Show a ticket with its tasks
    Show { ticket_id: String },
    /// List all tickets
    List,
    /// Start a pending ticket on the initial phase
    Start { ticket_id: String },
    /// Block a ticket
    Block {
        ticket_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Unblock a ticket
    Unblock { ticket_id: String },
    /// Regress a ticket to an earlier phase
    Regress {
        ticket_id: String,
        to_phase: String,
        #[arg(long)]
        reason: String,
    },
    /// Submit a workflow result artifact for the ticket's current phase
    Submit {
        ticket_id: String,
        /// Artifact kind, e.g. design_doc
        artifact_kind: String,
        /// Reference to the artifact (URL, path, commit)
        artifact_ref: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Enqueue a task
    Enqueue {
        ticket_id: String,
        phase_id: String,
        description: String,
        #[arg(long, default_value = "work")]
        task_type: String,
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Task IDs this task depends on
        #[arg(long)]
        depends_on: Vec<String>,
        #[arg(long)]
        timeout_seconds: Option<i64>,
        #[arg(long)]
        max_retries: Option<i32>,
    },
    /// Show a task
    Show { task_id: String },
    /// Claim the next assignment for an agent
    Assign { agent_id: String },
    /// Start an assigned task (agent mode)
    Start { task_id: String, agent_id: String },
    /// Submit a task result (agent mode); reads the result JSON from a file
    Submit {
        task_id: String,
        agent_id: String,
        /// Path to the result envelope JSON ("-" for stdin)
        result_file: String,
        #[arg(long)]
        status_hint: Option<String>,
    },
    /// Report a task failure (agent mode)
    Fail {
        task_id: String,
        agent_id: String,
        #[arg(long)]
        error: String,
        /// Failure category for retry classification
        #[arg(long)]
        category: Option<String>,
    },
    /// Cancel a task
    Cancel {
        task_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Approve a task awaiting review
    Approve { task_id: String },
    /// Reject a task awaiting review back to the agent
    Reject {
        task_id: String,
        #[arg(long)]
        feedback: String,
    },
    /// Requeue a blocked task
    Unblock { task_id: String },
    /// Record a discovery and branch a new task from it
    Discover {
        /// Task the agent was executing
        source_task_id: String,
        /// bug, optimization, clarification, ...
        discovery_type: String,
        description: String,
        spawn_phase: String,
        spawn_description: String,
        #[arg(long)]
        spawn_priority: Option<String>,
        /// Raise the spawned task one priority level
        #[arg(long)]
        boost: bool,
    },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register an agent
    Register {
        /// worker, monitor, watchdog, or guardian
        #[arg(long, default_value = "worker")]
        agent_type: String,
        /// Capability tags
        #[arg(long)]
        capability: Vec<String>,
        #[arg(long)]
        capacity: Option<i32>,
        /// Scope the agent to one phase
        #[arg(long)]
        phase: Option<String>,
    },
    /// List agents
    List,
    /// Send a heartbeat for an agent
    Heartbeat {
        agent_id: String,
        /// idle or busy
        #[arg(long)]
        status: Option<String>,
    },
    /// Take an agent out of service
    Terminate { agent_id: String },
}

#[derive(Subcommand)]
pub enum GuardianCommands {
    /// Force-cancel a task
    CancelTask {
        task_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        initiated_by: String,
        #[arg(long)]
        authority: i32,
    },
    /// Move capacity between agents
    Reallocate {
        from_agent: String,
        to_agent: String,
        amount: i32,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        initiated_by: String,
        #[arg(long)]
        authority: i32,
    },
    /// Override a task's priority
    OverridePriority {
        task_id: String,
        new_priority: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        initiated_by: String,
        #[arg(long)]
        authority: i32,
    },
    /// Mark a guardian action reverted (audit only)
    Revert {
        action_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        initiated_by: String,
    },
    /// List recent guardian actions
    Actions {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

/// Build the engine against the resolved database and engine config.
async fn build_engine(database_url: Option<&str>) -> Result<Engine> {
    let db_config = config::resolve_db_config(database_url);
    let engine_config = config::resolve_engine_config();
    let pool = pool::create_pool_with_deadline(&db_config, engine_config.store_deadline()).await?;
    Ok(Engine::new(pool, engine_config))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("foreman=info")),
        )
        .init();

    let cli = Cli::parse();
    let db_flag = cli.database_url.as_deref();

    match cli.command {
        Commands::Init { db_url, force } => init_cmd::run_init(&db_url, force),
        Commands::DbInit => init_cmd::run_db_init(db_flag).await,
        Commands::Run { workers } => {
            let engine = build_engine(db_flag).await?;
            run_cmd::run_engine(engine, workers).await
        }
        Commands::Serve { addr } => {
            let engine = build_engine(db_flag).await?;
            serve_cmd::run_serve(engine, &addr).await
        }
        Commands::Ticket { command } => {
            let engine = build_engine(db_flag).await?;
            ticket_cmds::run(&engine, command).await
        }
        Commands::Task { command } => {
            let engine = build_engine(db_flag).await?;
            task_cmds::run(&engine, command).await
        }
        Commands::Agent { command } => {
            let engine = build_engine(db_flag).await?;
            agent_cmds::run(&engine, command).await
        }
        Commands::Guardian { command } => {
            let engine = build_engine(db_flag).await?;
            guardian_cmds::run(&engine, command).await
        }
        Commands::Status { ticket_id } => {
            let engine = build_engine(db_flag).await?;
            status_cmd::run_status(&engine, ticket_id.as_deref()).await
        }
        Commands::Log {
            entity_type,
            entity_id,
            limit,
        } => {
            let engine = build_engine(db_flag).await?;
            log_cmd::run_log(&engine, &entity_type, &entity_id, limit).await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "foreman", &mut std::io::stdout());
            Ok(())
        }
    }
}
