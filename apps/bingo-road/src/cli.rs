use std::sync::Arc;

use anyhow::{anyhow, Result};
use bingo_core::{SessionSnapshot, SyncEnvelope};
use bingo_sync::{ConnectionStatus, HttpEventTransport, SyncManager};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "bingo-road")]
#[command(about = "Bingo Road session server and stream watcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to listen on (overrides BINGO_ROAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Redis URL for the shared store (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow a session's change stream and print every frame
    Watch {
        /// Session server URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Join code of the session
        #[arg(short, long)]
        code: String,

        /// Watch as this player (they are always shown online)
        #[arg(short, long)]
        player_id: Option<String>,
    },
}

impl Cli {
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = self.redis_url.as_ref().filter(|url| !url.trim().is_empty()) {
            config.redis_url = Some(url.trim().to_string());
        }
    }
}

pub async fn run_watch(url: String, code: String, player_id: Option<String>) -> Result<()> {
    let code = crate::codes::normalize_code(&code);
    let mut manager = SyncManager::new(Arc::new(HttpEventTransport::new(url.as_str())));
    let mut status = manager.status();
    let mut frames = manager.connect(&code, player_id.as_deref());
    debug!("watching {} on {}", code, url);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(envelope) => println!("{}", describe(&envelope)),
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                eprintln!("[{code}] {current:?}");
                if current == ConnectionStatus::NotFound {
                    return Err(anyhow!("session {code} not found"));
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    manager.disconnect();
    Ok(())
}

fn describe(envelope: &SyncEnvelope) -> String {
    match envelope {
        SyncEnvelope::Full(SessionSnapshot {
            session,
            online_count,
        }) => {
            let marks: usize = session.items.iter().map(|item| item.marked_by.len()).sum();
            let winner = session
                .winner
                .as_ref()
                .map(|w| format!(" winner={}", w.display_name))
                .unwrap_or_default();
            format!(
                "{} full v{} \"{}\" players={} online={} marks={}{}",
                timestamp(session.last_modified_at),
                session.version,
                session.title,
                session.players.len(),
                online_count,
                marks,
                winner
            )
        }
        SyncEnvelope::Delta(delta) => {
            let mut line = format!(
                "{} delta",
                delta
                    .last_modified_at
                    .map(timestamp)
                    .unwrap_or_else(|| "-".to_string())
            );
            if let Some(version) = delta.version {
                line.push_str(&format!(" v{version}"));
            }
            if let Some(players) = &delta.players {
                line.push_str(&format!(" players={}", players.len()));
            }
            if let Some(online) = delta.online_count {
                line.push_str(&format!(" online={online}"));
            }
            if let Some(items) = &delta.items {
                line.push_str(&format!(" items={}", items.len()));
            }
            line
        }
    }
}

fn timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
