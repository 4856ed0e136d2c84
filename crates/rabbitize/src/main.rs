mod artifacts;
mod browser;
mod cdp;
mod cli;
mod command;
mod error;
mod llm;
mod metrics;
mod overlay;
mod preview;
mod queue;
mod server;
mod session;
mod stability;
mod video;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::preview::FrameTopic;
use crate::queue::{CommandQueue, QueueCallbacks, QueueRequest};
use crate::server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is reserved for the EXECUTION_SUMMARY line; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rabbitize=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();
    let batch = cli.batch()?;
    let batch_mode = batch.is_some();

    let frames = FrameTopic::new();
    let queue = CommandQueue::spawn(cli.engine_config(), frames.clone());

    let (end_tx, mut end_rx) = tokio::sync::mpsc::unbounded_channel();
    queue.set_callbacks(QueueCallbacks {
        on_session_end: Some(Box::new(move |summary| {
            let _ = end_tx.send(summary.clone());
        })),
        ..Default::default()
    });

    if let Some(commands) = batch {
        let url = cli
            .batch_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--batch-commands requires --batch-url"))?;
        info!(commands = commands.len(), url = %url, "running batch");
        queue.enqueue(QueueRequest::Start {
            url,
            client_id: cli.client_id.clone(),
            test_id: cli.test_id.clone(),
            session_id: cli.session_id.clone(),
            total_commands: Some(commands.len() as u64),
        });
        for command in commands {
            queue.enqueue(QueueRequest::Execute { command });
        }
        queue.enqueue(QueueRequest::End {
            quick_cleanup: false,
            auto_inactivity: false,
        });
    }

    let state = AppState {
        queue: queue.clone(),
        frames,
    };
    let port = cli.port;
    tokio::spawn(async move {
        if let Err(e) = server::serve(state, port).await {
            warn!(error = %format!("{e:#}"), "HTTP server exited");
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                terminate(&queue, "SIGINT").await;
            }
            _ = sigterm.recv() => {
                terminate(&queue, "SIGTERM").await;
            }
            ended = end_rx.recv() => {
                if ended.is_some() && (batch_mode || cli.exit_on_end) {
                    info!("session ended cleanly, exiting");
                    return Ok(());
                }
            }
        }
    }
}

/// Best-effort teardown on termination signals, then a non-zero exit.
async fn terminate(queue: &CommandQueue, signal: &str) -> ! {
    warn!(signal, "termination signal received, quick-ending session");
    queue.enqueue(QueueRequest::End {
        quick_cleanup: true,
        auto_inactivity: false,
    });
    // Give the consumer a moment to release the browser.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    std::process::exit(130);
}
