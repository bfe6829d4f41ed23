use asfa_core::config::AppConfig;
use asfa_core::utils::format_bytes;
use asfa_core::{AppCommand, AppEvent, run_backend};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{HELP, parse_command};

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::Status(text) => println!("{}", text),
        AppEvent::Error(text) => println!("error: {}", text),
        AppEvent::JobQueued { queue, job_id } => println!("[{}] queued {}", queue, job_id),
        // Per-chunk progress is too chatty for a terminal; `progress` asks for totals
        AppEvent::JobProgress { .. } => {}
        AppEvent::JobStatus {
            queue,
            job_id,
            status,
        } => println!("[{}] {} {}", queue, job_id, status),
        AppEvent::JobFinished { queue, job_id } => println!("[{}] {} finished", queue, job_id),
        AppEvent::JobError {
            queue,
            job_id,
            message,
        } => println!("[{}] {} failed: {}", queue, job_id, message),
        AppEvent::DuplicateFound { path } => println!("already there: {}", path.display()),
        AppEvent::QueueStatus { queue, text } => println!("[{}] {}", queue, text),
        AppEvent::QueueProgress {
            queue,
            snapshot,
            text,
        } => println!("[{}] {} ({:.0}%)", queue, text, snapshot.percent),
        AppEvent::QueueIdle { queue, duplicates } => {
            println!("[{}] all done", queue);
            for path in duplicates {
                println!("  skipped duplicate {}", path.display());
            }
        }
        AppEvent::PeerDiscovered { username, addr } => println!("peer {} at {}", username, addr),
        AppEvent::ServerStarted { identity } => {
            println!("sharing as '{}' on {}", identity.username, identity.addr)
        }
        AppEvent::ServerStopped => println!("server stopped"),
        AppEvent::UserAuthorized { username } => println!("authorized {}", username),
        AppEvent::UserRevoked { username } => println!("revoked {}", username),
        AppEvent::Listing { location, rows } => {
            println!("{}", location);
            for row in rows {
                println!(
                    "  {:?}\t{:?}\t{}\t{}",
                    row.kind,
                    row.existence,
                    format_bytes(row.size),
                    row.name
                );
            }
        }
        AppEvent::BrowseFailed { message } => println!("browse failed: {}", message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::load();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(
        "Config dir: {:?}, sharing port {}",
        asfa_core::config::get_config_dir(),
        config.server_port
    );

    let (tx_cmd, rx_cmd) = mpsc::channel::<AppCommand>(1000);
    let (tx_event, mut rx_event) = mpsc::channel::<AppEvent>(1000);

    let backend = tokio::spawn(run_backend(config, rx_cmd, tx_event));

    let printer = tokio::spawn(async move {
        while let Some(event) = rx_event.recv().await {
            print_event(&event);
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(cmd) => {
                let quit = cmd == AppCommand::Shutdown;
                if tx_cmd.send(cmd).await.is_err() || quit {
                    break;
                }
            }
            Err(e) => println!("{}\n{}", e, HELP),
        }
    }

    drop(tx_cmd);
    backend.await?;
    // Let the last events through, then give up on stragglers
    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
    Ok(())
}
