use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use tether_crypto::{KeyPair, key_to_base64};
use tether_sync::{KeyMaterial, StaticCredentials, SyncConfig, SyncService, WebSocketConnector};

const USAGE: &str = "usage: tether [watch] [SESSION_ID...] | tether keygen";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug".into()),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().cloned().unwrap_or_default();
    match command.as_str() {
        "keygen" => {
            keygen();
            Ok(())
        }
        "help" | "-h" | "--help" => {
            println!("{}", USAGE);
            Ok(())
        }
        "watch" => {
            args.remove(0);
            watch(args).await
        }
        _ => watch(args).await,
    }
}

/// Print a fresh X25519 key pair. The public half goes to the peer.
fn keygen() {
    let pair = KeyPair::generate();
    println!("TETHER_SECRET_KEY={}", key_to_base64(&pair.secret_key()));
    println!("TETHER_PUBLIC_KEY={}", key_to_base64(&pair.public_key()));
}

async fn watch(mut sessions: Vec<String>) -> anyhow::Result<()> {
    // Config
    let config = SyncConfig::from_env()?;
    let token = std::env::var("TETHER_TOKEN").context("TETHER_TOKEN is not set")?;
    let keys = match (
        std::env::var("TETHER_SECRET_KEY"),
        std::env::var("TETHER_PEER_PUBLIC_KEY"),
    ) {
        (Ok(secret), Ok(peer)) => Some(KeyMaterial::from_base64(&secret, &peer)?),
        (Err(_), Err(_)) => None,
        _ => bail!("TETHER_SECRET_KEY and TETHER_PEER_PUBLIC_KEY must be set together"),
    };
    if sessions.is_empty() {
        if let Ok(list) = std::env::var("TETHER_SESSIONS") {
            sessions = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    let credentials = Arc::new(StaticCredentials::new(token, keys));
    let service = SyncService::new(config, Arc::new(WebSocketConnector), credentials);

    let mut status = service.status_changes();
    let mut session_rx = service.session_updates();
    let mut message_rx = service.message_updates();
    let mut error_rx = service.sync_errors();
    let mut paused_rx = service.revival_paused_events();
    let mut revived_rx = service.revived_events();

    for session_id in &sessions {
        service.subscribe(session_id.as_str()).await?;
    }

    if let Err(e) = service.connect().await {
        if e.needs_repair() {
            return Err(e).context("device is not paired; run `tether keygen` and exchange keys");
        }
        warn!("initial connection failed: {}", e);
    }

    info!("watching {} session(s), press ctrl-c to stop", sessions.len());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                info!("status: {}", current);
            }
            result = session_rx.recv() => match result {
                Ok(session) => info!(
                    session_id = %session.id,
                    seq = session.seq,
                    active = session.active,
                    "session updated"
                ),
                Err(RecvError::Lagged(n)) => warn!("session updates lagged by {}", n),
                Err(RecvError::Closed) => break,
            },
            result = message_rx.recv() => match result {
                Ok(message) => info!(
                    session_id = %message.session_id,
                    message_id = %message.id,
                    seq = message.seq,
                    "message received"
                ),
                Err(RecvError::Lagged(n)) => warn!("message updates lagged by {}", n),
                Err(RecvError::Closed) => break,
            },
            result = error_rx.recv() => match result {
                Ok(e) => error!("sync error: {}", e),
                Err(RecvError::Lagged(n)) => warn!("sync errors lagged by {}", n),
                Err(RecvError::Closed) => break,
            },
            result = paused_rx.recv() => {
                if let Ok(event) = result {
                    warn!(
                        machine_id = %event.machine_id,
                        "session revival paused: {} (resumes at {:?})",
                        event.reason,
                        event.resumes_at_utc()
                    );
                }
            }
            result = revived_rx.recv() => {
                if let Ok(event) = result {
                    info!(
                        "session {} revived as {}",
                        event.original_session_id, event.new_session_id
                    );
                }
            }
        }
    }

    service.disconnect().await;
    Ok(())
}
