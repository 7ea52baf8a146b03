//! Newline-delimited JSON protocol.
//!
//! One request per line, tagged by `op`; one response line per request.
//! After `listen`, committed events on the channel are interleaved with
//! responses as `{"event": {...}}` lines until `unlisten` or disconnect.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::coordinator::{BatchItem, OccupationCoordinator, OccupationError, validate_id};
use crate::events::OccupationEvent;
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::store::MemoryRecordStore;

fn default_subtask() -> SubtaskId {
    DEFAULT_SUBTASK.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Take {
        unit_id: UnitId,
        actor_id: ActorId,
        #[serde(default = "default_subtask")]
        subtask: SubtaskId,
    },
    Pause {
        unit_id: UnitId,
        actor_id: ActorId,
        #[serde(default = "default_subtask")]
        subtask: SubtaskId,
    },
    Complete {
        unit_id: UnitId,
        actor_id: ActorId,
        #[serde(default = "default_subtask")]
        subtask: SubtaskId,
    },
    Abandon {
        unit_id: UnitId,
        actor_id: ActorId,
        #[serde(default = "default_subtask")]
        subtask: SubtaskId,
    },
    Heartbeat {
        unit_id: UnitId,
        actor_id: ActorId,
    },
    TakeBatch {
        unit_ids: Vec<UnitId>,
        actor_id: ActorId,
        #[serde(default = "default_subtask")]
        subtask: SubtaskId,
    },
    PauseBatch {
        unit_ids: Vec<UnitId>,
        actor_id: ActorId,
        #[serde(default = "default_subtask")]
        subtask: SubtaskId,
    },
    CompleteBatch {
        unit_ids: Vec<UnitId>,
        actor_id: ActorId,
        #[serde(default = "default_subtask")]
        subtask: SubtaskId,
    },
    RegisterUnit {
        unit_id: UnitId,
    },
    GetUnit {
        unit_id: UnitId,
    },
    HotSpots,
    Stats,
    Listen {
        #[serde(default)]
        channel: Option<String>,
    },
    Unlisten,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),
}

/// Everything a connection needs. Shared by all connections.
pub struct ServerState {
    pub coordinator: Arc<OccupationCoordinator>,
    pub store: Arc<MemoryRecordStore>,
    pub hub: Arc<NotifyHub>,
}

pub async fn process_connection<S>(socket: S, state: Arc<ServerState>) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut events: Option<broadcast::Receiver<OccupationEvent>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let err = OccupationError::LimitExceeded("request line too long");
                        // The codec is finished after an error; reply and hang up.
                        framed.send(error_json(&err).to_string()).await?;
                        break;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match serde_json::from_str::<Command>(&line) {
                    Ok(cmd) => {
                        metrics::counter!(observability::REQUESTS_TOTAL, "command" => observability::command_label(&cmd))
                            .increment(1);
                        execute(&state, cmd, &mut events).await
                    }
                    Err(e) => error_json(&OccupationError::InvalidRequest(e.to_string())),
                };
                framed.send(reply.to_string()).await?;
            }
            event = next_event(&mut events) => {
                match event {
                    Ok(ev) => framed.send(json!({ "event": ev }).to_string()).await?,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "listener fell behind, events dropped"),
                    Err(RecvError::Closed) => events = None,
                }
            }
        }
    }
    debug!("connection closed");
    Ok(())
}

/// Pending forever when not listening, so the select arm stays idle.
async fn next_event(
    events: &mut Option<broadcast::Receiver<OccupationEvent>>,
) -> Result<OccupationEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn execute(
    state: &ServerState,
    cmd: Command,
    events: &mut Option<broadcast::Receiver<OccupationEvent>>,
) -> Value {
    let c = &state.coordinator;
    let result: Result<Value, OccupationError> = match cmd {
        Command::Take { unit_id, actor_id, subtask } => {
            c.take(&unit_id, &actor_id, &subtask).await.map(receipt_json)
        }
        Command::Pause { unit_id, actor_id, subtask } => {
            c.pause(&unit_id, &actor_id, &subtask).await.map(receipt_json)
        }
        Command::Complete { unit_id, actor_id, subtask } => {
            c.complete(&unit_id, &actor_id, &subtask).await.map(receipt_json)
        }
        Command::Abandon { unit_id, actor_id, subtask } => {
            c.abandon(&unit_id, &actor_id, &subtask).await.map(receipt_json)
        }
        Command::Heartbeat { unit_id, actor_id } => c
            .heartbeat(&unit_id, &actor_id)
            .await
            .map(|ttl| json!({ "ok": true, "ttl_secs": ttl.as_secs() })),
        Command::TakeBatch { unit_ids, actor_id, subtask } => {
            c.take_batch(&unit_ids, &actor_id, &subtask).await.map(batch_json)
        }
        Command::PauseBatch { unit_ids, actor_id, subtask } => {
            c.pause_batch(&unit_ids, &actor_id, &subtask).await.map(batch_json)
        }
        Command::CompleteBatch { unit_ids, actor_id, subtask } => {
            c.complete_batch(&unit_ids, &actor_id, &subtask).await.map(batch_json)
        }
        Command::RegisterUnit { unit_id } => register_unit(state, &unit_id).await,
        Command::GetUnit { unit_id } => c
            .get_unit(&unit_id)
            .await
            .map(|unit| json!({ "ok": true, "unit": unit })),
        Command::HotSpots => Ok(json!({ "ok": true, "hot_spots": c.monitor().hot_spots() })),
        Command::Stats => Ok(json!({
            "ok": true,
            "units": state.store.unit_count(),
            "contention": c.monitor().snapshot(),
        })),
        Command::Listen { channel } => {
            let channel = channel.unwrap_or_else(|| c.event_channel().to_string());
            *events = Some(state.hub.subscribe(&channel));
            Ok(json!({ "ok": true, "listening": channel }))
        }
        Command::Unlisten => {
            *events = None;
            Ok(json!({ "ok": true }))
        }
    };
    result.unwrap_or_else(|e| error_json(&e))
}

async fn register_unit(state: &ServerState, unit_id: &str) -> Result<Value, OccupationError> {
    validate_id("unit_id", unit_id)?;
    let version = state.store.register_unit(unit_id).await?;
    Ok(json!({ "ok": true, "unit_id": unit_id, "version": version }))
}

fn receipt_json(receipt: OperationReceipt) -> Value {
    json!({ "ok": true, "receipt": receipt })
}

fn batch_json(items: Vec<BatchItem>) -> Value {
    let results: Vec<Value> = items
        .into_iter()
        .map(|item| match item.outcome {
            Ok(receipt) => json!({ "unit_id": item.unit_id, "ok": true, "receipt": receipt }),
            Err(e) => json!({ "unit_id": item.unit_id, "ok": false, "error": error_body(&e) }),
        })
        .collect();
    json!({ "ok": true, "results": results })
}

fn error_body(e: &OccupationError) -> Value {
    json!({ "kind": e.kind(), "status": e.status(), "message": e.to_string() })
}

fn error_json(e: &OccupationError) -> Value {
    json!({ "ok": false, "error": error_body(e) })
}
