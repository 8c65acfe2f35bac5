mod cli;

use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use jobmill_engine::{SubmitRequest, start_engine};

use crate::cli::Cli;

#[derive(Debug, Clone, Copy)]
enum ShutdownEvent {
    Graceful,
    Immediate,
}

/// First CTRL+C asks for a graceful drain, the second exits immediately.
fn spawn_ctrl_c_handler(tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let _ = tx.send(ShutdownEvent::Graceful);
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(ShutdownEvent::Immediate);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config()?;

    info!(
        store_dir = %cli.store_dir.display(),
        "jobmill {} starting",
        env!("CARGO_PKG_VERSION")
    );
    let engine = start_engine(config).await?;
    let client = engine.client();

    if cli.smoke {
        let mut request = SubmitRequest::new("helloworld");
        request.args = vec![json!(1)];
        let jobid = client.submit(request).await?;
        info!(jobid, "submitted smoke job");
        match client
            .wait_for_result(&jobid, Duration::from_secs(30), Duration::from_millis(100))
            .await
        {
            Ok(result) => info!(jobid, %result, "smoke job completed"),
            Err(err) => error!(jobid, "smoke job failed: {err:#}"),
        }
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown_tx);

    info!("serving; press CTRL+C to stop");
    loop {
        match shutdown_rx.recv().await {
            Some(ShutdownEvent::Graceful) => {
                info!("stop requested, finishing in-flight jobs (press CTRL+C again to exit immediately)");
                engine.request_stop();
                break;
            }
            Some(ShutdownEvent::Immediate) | None => std::process::exit(130),
        }
    }

    // The collector drains once the last client is gone.
    drop(client);

    // A second CTRL+C during the drain still exits immediately.
    let wait = engine.wait();
    tokio::pin!(wait);
    let mut signals_open = true;
    loop {
        tokio::select! {
            res = &mut wait => {
                res?;
                break;
            }
            ev = shutdown_rx.recv(), if signals_open => match ev {
                Some(ShutdownEvent::Immediate) => std::process::exit(130),
                Some(ShutdownEvent::Graceful) => {}
                None => signals_open = false,
            },
        }
    }

    info!("stopped");
    Ok(())
}
