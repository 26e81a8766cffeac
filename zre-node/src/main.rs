// ZRE node daemon: beacon discovery, peer inbox, event log.

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use zre_node::{config, Event, Node};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("zre-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new().context("cannot start runtime")?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let mut node = Node::new(cfg);
    node.start().await.context("cannot start node")?;
    tracing::info!(
        uuid = %node.uuid(),
        name = node.name(),
        endpoint = node.endpoint().unwrap_or_default(),
        "running"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            event = node.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }
    node.stop().await;
    // Drain what the shutdown produced, ending with STOP.
    while let Some(event) = node.recv().await {
        log_event(&event);
    }
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::Enter { peer, name, endpoint, .. } => {
            tracing::info!(%peer, name = %name, endpoint = %endpoint, "ENTER")
        }
        Event::Whisper { peer, content, .. } => {
            tracing::info!(%peer, frames = content.len(), "WHISPER")
        }
        Event::Shout { peer, group, content, .. } => {
            tracing::info!(%peer, group = %group, frames = content.len(), "SHOUT")
        }
        other => tracing::info!(peer = ?other.peer(), group = ?other.group(), "{}", other.kind()),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
