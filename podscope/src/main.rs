use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use podscope::agent::Agent;
use podscope::cli::Args;
use podscope::config::AgentConfig;
use podscope::preflight;
use podscope::service;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = AgentConfig::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.http.listen = listen;
    }
    if let Some(region) = args.region {
        config.runtime.region = region;
    }

    preflight::run_preflight_checks(&config.bpf.object_dir)?;
    if args.dry_run {
        println!("environment and config ok");
        return Ok(());
    }

    let listen = config.http.listen.clone();
    let agent = Agent::bootstrap(config, args.config.clone())
        .await
        .context("bootstrap agent")?;
    agent.start().await.context("start probes")?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind control plane on {listen}"))?;
    info!("control plane listening on http://{listen}");

    let router = service::router(Arc::clone(&agent));
    let server = {
        let shutdown = agent.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
    };
    tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("control plane server: {e}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    agent.stop().await;
    Ok(())
}
