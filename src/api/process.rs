//! Operator helper subprocesses: each receives the peer events it is
//! entitled to as JSON lines on stdin and may write the same commands
//! the channel accepts back on stdout. A helper that keeps dying is
//! restarted a bounded number of times and then abandoned.

use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio::sync::{broadcast, mpsc};

use super::command::ApiRequest;
use super::messages::ApiEvent;
use crate::config::ProcessConfigSpec;

/// Give up on a helper after this many deaths within the window
const MAX_RESTARTS: u32 = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(63);

pub fn spawn_all(
    processes: Vec<ProcessConfigSpec>,
    requests: mpsc::UnboundedSender<ApiRequest>,
    events: broadcast::Sender<ApiEvent>,
) {
    for spec in processes {
        let requests = requests.clone();
        let events = events.clone();
        tokio::spawn(async move {
            run(spec, requests, events).await;
        });
    }
}

async fn run(
    spec: ProcessConfigSpec,
    requests: mpsc::UnboundedSender<ApiRequest>,
    events: broadcast::Sender<ApiEvent>,
) {
    let mut window_start = Instant::now();
    let mut restarts: u32 = 0;
    loop {
        if window_start.elapsed() > RESTART_WINDOW {
            window_start = Instant::now();
            restarts = 0;
        }
        if restarts >= MAX_RESTARTS {
            error!(
                "helper '{}' died {} times in {:?}, giving up",
                spec.name, restarts, RESTART_WINDOW
            );
            return;
        }

        let child = ProcessCommand::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!("cannot start helper '{}': {}", spec.name, err);
                restarts += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("helper '{}' started", spec.name);

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let mut lines = stdout.map(|out| BufReader::new(out).lines());
        let mut event_rx = events.subscribe();

        loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => warn!("helper '{}' exited: {}", spec.name, status),
                        Err(err) => warn!("helper '{}' lost: {}", spec.name, err),
                    }
                    break;
                }
                event = event_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if let Some(stdin) = stdin.as_mut() {
                                let line = event.to_json() + "\n";
                                if stdin.write_all(line.as_bytes()).await.is_err() {
                                    debug!("helper '{}' stopped reading events", spec.name);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("helper '{}' lagged, {} events dropped", spec.name, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                line = async {
                    match lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                }, if lines.is_some() => {
                    match line {
                        Ok(Some(line)) => {
                            let line = line.trim().to_string();
                            if line.is_empty() {
                                continue;
                            }
                            let response = super::server::dispatch(&line, &requests).await;
                            if let Some(reason) = response.error {
                                warn!(
                                    "helper '{}' command '{}' rejected: {}",
                                    spec.name, line, reason
                                );
                            }
                        }
                        Ok(None) | Err(_) => {
                            // stdout closed; wait() will pick up the exit
                            lines = None;
                        }
                    }
                }
            }
        }
        restarts += 1;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
