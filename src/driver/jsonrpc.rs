//! JSON-RPC driver: newline-framed JSON over a local Unix stream socket.
//!
//! Inbound notifications carry an `envelope` object; `syncMessage` envelopes
//! become [`SyncMessage`]s and `dataMessage` envelopes become plain
//! [`Message`]s. Outbound calls are JSON-RPC requests correlated to their
//! responses by numeric id. Malformed frames are logged and dropped, never
//! fatal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{channels_of, ChannelSlot, Driver, DriverChannels, DriverError};
use crate::message::{Message, SyncMessage};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One inbound envelope, as nested inside a notification frame.
#[derive(Debug, Deserialize)]
struct Envelope {
    source: Option<String>,
    timestamp: Option<i64>,
    #[serde(rename = "syncMessage")]
    sync_message: Option<SyncEnvelope>,
    #[serde(rename = "dataMessage")]
    data_message: Option<DataEnvelope>,
}

#[derive(Debug, Deserialize)]
struct SyncEnvelope {
    #[serde(rename = "sentMessage")]
    sent_message: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    destination: Option<String>,
    message: Option<String>,
    timestamp: Option<i64>,
    #[serde(rename = "groupInfo")]
    group_info: Option<GroupInfo>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope {
    message: Option<String>,
    timestamp: Option<i64>,
    #[serde(rename = "groupInfo")]
    group_info: Option<GroupInfo>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct GroupInfo {
    #[serde(rename = "groupId")]
    group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    filename: Option<String>,
}

fn decode_group_id(info: Option<&GroupInfo>) -> Vec<u8> {
    info.and_then(|g| g.group_id.as_deref())
        .and_then(|b64| BASE64.decode(b64).ok())
        .unwrap_or_default()
}

fn decode_attachments(attachments: &[WireAttachment]) -> Vec<PathBuf> {
    attachments
        .iter()
        .filter_map(|a| a.filename.as_deref().map(PathBuf::from))
        .collect()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>;

/// Driver speaking line-framed JSON-RPC over a Unix socket.
pub struct JsonRpcDriver {
    socket_path: PathBuf,
    number: String,
    channels: ChannelSlot,
    stop_tx: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl JsonRpcDriver {
    /// Create a driver for the account `number` over the daemon socket at
    /// `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>, number: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            socket_path: socket_path.into(),
            number: number.into(),
            channels: ChannelSlot::default(),
            stop_tx,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Issue one JSON-RPC request and await its correlated response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.forget(id);
                return Err(DriverError::NotConnected);
            };
            let mut line = serde_json::to_string(&frame)?;
            line.push('\n');
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.forget(id);
                return Err(e.into());
            }
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(DriverError::Transport(message)),
            Err(_) => Err(DriverError::NotConnected),
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Route one response frame to its waiting request.
    fn resolve(&self, id: u64, outcome: Result<Value, String>) {
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(id, "response for unknown request id"),
        }
    }

    /// Decode one inbound frame: a response is correlated, an envelope is
    /// normalized, anything else is dropped with a warning.
    async fn handle_frame(&self, line: &str, channels: &DriverChannels) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        // Response to one of our requests?
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if let Some(err) = value.get("error") {
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_owned();
                self.resolve(id, Err(message));
                return;
            }
            if let Some(result) = value.get("result") {
                self.resolve(id, Ok(result.clone()));
                return;
            }
        }

        // Notification: envelope at top level or under params.
        let envelope = value
            .get("envelope")
            .or_else(|| value.get("params").and_then(|p| p.get("envelope")));
        let Some(envelope) = envelope else {
            warn!("dropping frame with no envelope");
            return;
        };
        let envelope: Envelope = match serde_json::from_value(envelope.clone()) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        self.dispatch_envelope(envelope, channels).await;
    }

    async fn dispatch_envelope(&self, envelope: Envelope, channels: &DriverChannels) {
        let Some(source) = envelope.source else {
            warn!("dropping envelope without source");
            return;
        };

        if let Some(sent) = envelope.sync_message.and_then(|s| s.sent_message) {
            let Some(text) = sent.message else {
                warn!("dropping sync message without message body");
                return;
            };
            let sync = SyncMessage::new(
                sent.timestamp.or(envelope.timestamp).unwrap_or_default(),
                source,
                sent.destination.unwrap_or_default(),
                decode_group_id(sent.group_info.as_ref()),
                text,
                decode_attachments(&sent.attachments),
            );
            if channels.sync_messages.send(sync).await.is_err() {
                debug!("sync channel closed");
            }
            return;
        }

        if let Some(data) = envelope.data_message {
            let Some(text) = data.message else {
                warn!("dropping data message without message body");
                return;
            };
            let msg = Message::new(
                data.timestamp.or(envelope.timestamp).unwrap_or_default(),
                source,
                self.number.clone(),
                decode_group_id(data.group_info.as_ref()),
                text,
                decode_attachments(&data.attachments),
            );
            if channels.messages.send(msg).await.is_err() {
                debug!("message channel closed");
            }
            return;
        }

        debug!("ignoring envelope of unknown kind");
    }

    fn attachment_strings(attachments: &[PathBuf]) -> Vec<String> {
        attachments
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    fn timestamp_of(result: &Value) -> i64 {
        result
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for JsonRpcDriver {
    async fn self_number(&self) -> Result<String, DriverError> {
        Ok(self.number.clone())
    }

    async fn send_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        recipient: &str,
        notify_self: bool,
    ) -> Result<i64, DriverError> {
        let result = self
            .request(
                "send",
                json!({
                    "recipient": [recipient],
                    "message": text,
                    "attachments": Self::attachment_strings(attachments),
                }),
            )
            .await?;

        if notify_self && recipient != self.number {
            if let Err(e) = self
                .request(
                    "send",
                    json!({
                        "recipient": [self.number],
                        "message": text,
                        "attachments": Self::attachment_strings(attachments),
                    }),
                )
                .await
            {
                warn!(error = %e, "note-to-self copy failed");
            }
        }

        Ok(Self::timestamp_of(&result))
    }

    async fn send_group_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        group_id: &[u8],
    ) -> Result<i64, DriverError> {
        let result = self
            .request(
                "send",
                json!({
                    "groupId": BASE64.encode(group_id),
                    "message": text,
                    "attachments": Self::attachment_strings(attachments),
                }),
            )
            .await?;
        Ok(Self::timestamp_of(&result))
    }

    async fn group_name(&self, group_id: &[u8]) -> Result<String, DriverError> {
        let wanted = BASE64.encode(group_id);
        let result = self.request("listGroups", json!({})).await?;
        let groups = result.as_array().cloned().unwrap_or_default();
        groups
            .iter()
            .find(|g| g.get("id").and_then(Value::as_str) == Some(wanted.as_str()))
            .and_then(|g| g.get("name").and_then(Value::as_str))
            .map(str::to_owned)
            .ok_or_else(|| DriverError::Transport(format!("unknown group {wanted}")))
    }

    fn set_interface(&self, channels: DriverChannels) {
        if let Ok(mut slot) = self.channels.lock() {
            *slot = Some(channels);
        }
    }

    async fn run(&self) -> Result<(), DriverError> {
        let channels = channels_of(&self.channels)?;
        let mut stop = self.stop_tx.subscribe();

        info!(socket = %self.socket_path.display(), "connecting to JSON-RPC socket");
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let mut lines = BufReader::new(read_half).lines();
        let result = loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => self.handle_frame(&line, &channels).await,
                        Ok(None) => {
                            info!("JSON-RPC socket closed by peer");
                            break Ok(());
                        }
                        Err(e) => break Err(DriverError::from(e)),
                    }
                }
                _ = stop.changed() => {
                    info!("JSON-RPC driver stopped");
                    break Ok(());
                }
            }
        };

        *self.writer.lock().await = None;
        // Unblock anything still waiting on a response.
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        result
    }

    async fn close(&self) {
        let _ = self.stop_tx.send(true);
    }
}
