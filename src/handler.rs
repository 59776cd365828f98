//! Runtime wiring: the listener, the reactor loop, the command channel,
//! helper processes and signal handling.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use net2::TcpBuilder;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::flag;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use crate::api::command::{ApiRequest, ApiResponse, Command};
use crate::api::messages::{ApiEvent, PeerEvent};
use crate::api::{process, server};
use crate::config::{self, ServerConfig};
use crate::session::{SessionManager, SessionUpdate};

/// Reactor anti-spin guard: past this many passes within one second the
/// loop sleeps briefly instead of burning the CPU
const MAX_LOOP_PASSES: u32 = 2000;
const SPIN_SLEEP: Duration = Duration::from_millis(100);

fn bind_listener(addr: IpAddr, port: u16) -> io::Result<TcpListener> {
    let builder = match addr {
        IpAddr::V4(_) => TcpBuilder::new_v4()?,
        IpAddr::V6(_) => TcpBuilder::new_v6()?,
    };
    builder.reuse_address(true)?;
    builder.bind((addr, port))?;
    let listener = builder.listen(1024)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

pub async fn serve(config_path: String, config: ServerConfig) -> io::Result<()> {
    let config = Arc::new(config);
    // The shared port first, then one listener per dedicated peer port
    let mut listeners = Vec::with_capacity(2);
    for port in config.listen_ports() {
        listeners.push(bind_listener(config.listen, port)?);
        info!("listening on {}:{}", config.listen, port);
    }

    // Sessions report events over mpsc; a forwarder fans them out to
    // channel subscribers and helper processes
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ApiEvent>();
    let (broadcast_tx, _) = broadcast::channel::<ApiEvent>(1024);
    {
        let broadcast_tx = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let _ = broadcast_tx.send(event);
            }
        });
    }

    let (api_tx, mut api_rx) = mpsc::unbounded_channel::<ApiRequest>();
    {
        let api_config = config.api.clone();
        let api_tx = api_tx.clone();
        let broadcast_tx = broadcast_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = server::run(api_config, api_tx, broadcast_tx).await {
                error!("command channel failed: {}", err);
            }
        });
    }
    process::spawn_all(config.processes.clone(), api_tx.clone(), broadcast_tx.clone());

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let reload_flag = Arc::new(AtomicBool::new(false));
    let restart_flag = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, shutdown_flag.clone())?;
    flag::register(SIGINT, shutdown_flag.clone())?;
    flag::register(SIGHUP, reload_flag.clone())?;
    flag::register(SIGUSR1, restart_flag.clone())?;

    let mut manager = SessionManager::new(config.clone(), listeners, event_tx);
    let mut shutting_down = false;

    let mut window_start = Instant::now();
    let mut passes: u32 = 0;

    loop {
        // Signals are consumed between passes only, and a reload waits
        // for in-flight flushes so no update is cut in half
        if shutdown_flag.swap(false, Ordering::Relaxed) && !shutting_down {
            info!("shutdown requested, draining sessions");
            let _ = broadcast_tx.send(ApiEvent::new(
                None,
                PeerEvent::Signal {
                    name: "shutdown".to_string(),
                },
            ));
            manager.shutdown().await;
            shutting_down = true;
        }
        if reload_flag.swap(false, Ordering::Relaxed) && !shutting_down {
            if manager.is_flushing().await {
                // Try again next pass
                reload_flag.store(true, Ordering::Relaxed);
            } else {
                info!("reloading configuration from {}", config_path);
                let _ = broadcast_tx.send(ApiEvent::new(
                    None,
                    PeerEvent::Signal {
                        name: "reload".to_string(),
                    },
                ));
                match config::from_file(&config_path) {
                    Ok(new_config) => manager.apply_config(Arc::new(new_config)).await,
                    Err(err) => error!("reload failed, keeping old configuration: {}", err),
                }
            }
        }
        if restart_flag.swap(false, Ordering::Relaxed) && !shutting_down {
            info!("restart requested, bouncing every session");
            manager.restart_all().await;
        }

        tokio::select! {
            request = api_rx.recv() => {
                if let Some(ApiRequest { command, reply }) = request {
                    if matches!(command, Command::Shutdown) {
                        let _ = reply.send(ApiResponse::shutdown());
                        shutdown_flag.store(true, Ordering::Relaxed);
                    } else {
                        let response = manager.handle_command(command).await;
                        let _ = reply.send(response);
                    }
                }
            }
            update = manager.get_update() => {
                match update {
                    Ok(Some(SessionUpdate::Learned(addr, parsed))) => {
                        debug!(
                            "update from {}: {} announced, {} withdrawn",
                            addr,
                            parsed.update.announces.len(),
                            parsed.update.withdraws.len()
                        );
                    }
                    Ok(Some(SessionUpdate::Ended(addrs))) => {
                        for addr in addrs {
                            debug!("session with {} ended", addr);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!("reactor pass failed: {}", err),
                }
            }
        }

        if shutting_down && manager.session_count().await == 0 {
            info!("all sessions closed, exiting");
            return Ok(());
        }

        // Busy-spin guard
        passes += 1;
        if window_start.elapsed() >= Duration::from_secs(1) {
            window_start = Instant::now();
            passes = 0;
        } else if passes > MAX_LOOP_PASSES {
            tokio::time::sleep(SPIN_SLEEP).await;
        }
    }
}
