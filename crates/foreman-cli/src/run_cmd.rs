//! `foreman run`: the engine's long-running process.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use foreman_core::Engine;

/// Run orchestrator workers and health sweeps until Ctrl-C.
pub async fn run_engine(engine: Engine, workers: usize) -> Result<()> {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, stopping at next safe point");
                cancel.cancel();
            }
        });
    }

    println!("foreman engine running ({workers} worker(s)); Ctrl-C to stop");
    engine.run(workers, cancel).await;
    println!("engine stopped");
    Ok(())
}
