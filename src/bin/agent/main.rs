use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};

use group_agent::agent::DecisionLoop;
use group_agent::api::HttpBackend;
use group_agent::brain::HttpProviderFactory;
use group_agent::config::{AgentConfig, BrowserMode};
use group_agent::face::Monitor;
use group_agent::hands::{AdsPowerProvider, AttachProvider};
use group_agent::logging;
use group_agent::page::PageProvider;
use group_agent::supervisor::Supervisor;
use group_agent::types::Task;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    logging::init();

    let config = AgentConfig::parse();
    config.validate()?;
    info!(api = %config.api_url, browser = ?config.browser, "starting agent");

    let backend = Arc::new(
        HttpBackend::new(&config.api_url, config.api_token.clone())?
            .with_ai_override(config.local_ai_config()),
    );
    let pages: Arc<dyn PageProvider> = match config.browser {
        BrowserMode::Adspower => Arc::new(AdsPowerProvider::new(&config.adspower_url)?),
        BrowserMode::Attach => Arc::new(AttachProvider::new(&config.chrome_debug_url)?),
    };

    let mut agent = DecisionLoop::new(backend.clone(), pages, Arc::new(HttpProviderFactory))
        .with_settings(config.loop_settings())
        .with_pacing(config.pacing());
    if let Some(dir) = config.artifacts_dir() {
        info!(dir = %dir.display(), "failure artifacts directory");
        agent = agent.with_artifacts_dir(dir);
    }
    if let Some(addr) = config.monitor_addr {
        let monitor = Monitor::default();
        let bound = monitor.serve(addr).await?;
        info!("monitor at http://{bound}");
        agent = agent.with_monitor(monitor);
    }

    if let Some(path) = &config.task_file {
        let task = load_task(path)?;
        let outcome = agent.execute_task(&task).await;
        if !outcome.is_finished() {
            bail!("task {} failed", task.task_id);
        }
        return Ok(());
    }

    let supervisor = Supervisor::new(backend, agent, config.supervisor());
    let outcome = supervisor
        .run(shutdown_signal())
        .await
        .context("task polling stopped")?;
    info!(
        finished = outcome.finished,
        failed = outcome.failed,
        stop = ?outcome.stop,
        "agent stopped"
    );
    Ok(())
}

fn load_task(path: &Path) -> Result<Task> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read task file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse task file {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, finishing current task");
}
