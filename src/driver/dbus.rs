//! D-Bus driver: signal-cli's `org.asamk.Signal` interface.
//!
//! Inbound traffic arrives as bus signals matched by name on the well-known
//! interface; `MessageReceived` and `SyncMessageReceived` are normalized,
//! receipts and the structured `*V2` variants are recognized and silently
//! ignored. Outbound calls map 1:1 onto the interface methods.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use zbus::{proxy, MatchRule, MessageStream};

use super::{channels_of, ChannelSlot, Driver, DriverChannels, DriverError};
use crate::message::{Message, SyncMessage};

/// The well-known signal-cli bus interface.
const SIGNAL_INTERFACE: &str = "org.asamk.Signal";

/// Which bus the signal-cli daemon is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DBusBus {
    /// The per-login session bus.
    Session,
    /// The system-wide bus.
    System,
}

#[proxy(
    interface = "org.asamk.Signal",
    default_service = "org.asamk.Signal",
    default_path = "/org/asamk/Signal"
)]
trait Signal {
    #[zbus(name = "getSelfNumber")]
    fn get_self_number(&self) -> zbus::Result<String>;

    #[zbus(name = "sendMessage")]
    fn send_message(
        &self,
        message: &str,
        attachments: Vec<String>,
        recipient: &str,
    ) -> zbus::Result<i64>;

    #[zbus(name = "sendNoteToSelfMessage")]
    fn send_note_to_self_message(
        &self,
        message: &str,
        attachments: Vec<String>,
    ) -> zbus::Result<i64>;

    #[zbus(name = "sendGroupMessage")]
    fn send_group_message(
        &self,
        message: &str,
        attachments: Vec<String>,
        group_id: Vec<u8>,
    ) -> zbus::Result<i64>;

    #[zbus(name = "getGroupName")]
    fn get_group_name(&self, group_id: Vec<u8>) -> zbus::Result<String>;
}

/// Positional arguments of `MessageReceived`.
type MessageArgs = (i64, String, Vec<u8>, String, Vec<String>);
/// Positional arguments of `SyncMessageReceived`.
type SyncMessageArgs = (i64, String, String, Vec<u8>, String, Vec<String>);

/// Driver speaking to a signal-cli daemon over D-Bus.
pub struct DBusDriver {
    bus: DBusBus,
    channels: ChannelSlot,
    stop_tx: watch::Sender<bool>,
    connected: tokio::sync::OnceCell<(zbus::Connection, SignalProxy<'static>)>,
}

impl DBusDriver {
    /// Create a driver attached to `bus`.
    pub fn new(bus: DBusBus) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            bus,
            channels: ChannelSlot::default(),
            stop_tx,
            connected: tokio::sync::OnceCell::new(),
        }
    }

    /// Connect (once) and return the shared connection and proxy.
    async fn ensure_connected(
        &self,
    ) -> Result<&(zbus::Connection, SignalProxy<'static>), DriverError> {
        self.connected
            .get_or_try_init(|| async {
                let conn = match self.bus {
                    DBusBus::Session => zbus::Connection::session().await?,
                    DBusBus::System => zbus::Connection::system().await?,
                };
                let proxy = SignalProxy::new(&conn).await?;
                info!(bus = ?self.bus, "connected to signal-cli over D-Bus");
                Ok::<_, DriverError>((conn, proxy))
            })
            .await
    }

    fn attachment_strings(attachments: &[PathBuf]) -> Vec<String> {
        attachments
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    /// Map one bus signal by member name onto the inbound channels.
    async fn handle_signal(
        &self,
        msg: &zbus::Message,
        self_number: &str,
        channels: &DriverChannels,
    ) {
        let header = msg.header();
        let Some(member) = header.member() else {
            return;
        };
        match member.as_str() {
            "MessageReceived" => {
                let (timestamp, sender, group_id, text, attachments): MessageArgs =
                    match msg.body().deserialize() {
                        Ok(args) => args,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed MessageReceived");
                            return;
                        }
                    };
                let msg = Message::new(
                    timestamp,
                    sender,
                    self_number.to_owned(),
                    group_id,
                    text,
                    attachments.into_iter().map(PathBuf::from).collect(),
                );
                if channels.messages.send(msg).await.is_err() {
                    debug!("message channel closed");
                }
            }
            "SyncMessageReceived" => {
                let (timestamp, source, destination, group_id, text, attachments): SyncMessageArgs =
                    match msg.body().deserialize() {
                        Ok(args) => args,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed SyncMessageReceived");
                            return;
                        }
                    };
                let sync = SyncMessage::new(
                    timestamp,
                    source,
                    destination,
                    group_id,
                    text,
                    attachments.into_iter().map(PathBuf::from).collect(),
                );
                if channels.sync_messages.send(sync).await.is_err() {
                    debug!("sync channel closed");
                }
            }
            // Receipts carry no commands; V2 variants duplicate the classic
            // signals with structured payloads we do not consume.
            "ReceiptReceived" => {}
            name if name.ends_with("V2") => {}
            other => debug!(signal = other, "ignoring unknown bus signal"),
        }
    }
}

#[async_trait]
impl Driver for DBusDriver {
    async fn self_number(&self) -> Result<String, DriverError> {
        let (_, proxy) = self.ensure_connected().await?;
        Ok(proxy.get_self_number().await?)
    }

    async fn send_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        recipient: &str,
        notify_self: bool,
    ) -> Result<i64, DriverError> {
        let (_, proxy) = self.ensure_connected().await?;
        let timestamp = proxy
            .send_message(text, Self::attachment_strings(attachments), recipient)
            .await?;
        if notify_self {
            if let Err(e) = proxy
                .send_note_to_self_message(text, Self::attachment_strings(attachments))
                .await
            {
                warn!(error = %e, "note-to-self copy failed");
            }
        }
        Ok(timestamp)
    }

    async fn send_group_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        group_id: &[u8],
    ) -> Result<i64, DriverError> {
        let (_, proxy) = self.ensure_connected().await?;
        Ok(proxy
            .send_group_message(text, Self::attachment_strings(attachments), group_id.to_vec())
            .await?)
    }

    async fn group_name(&self, group_id: &[u8]) -> Result<String, DriverError> {
        let (_, proxy) = self.ensure_connected().await?;
        Ok(proxy.get_group_name(group_id.to_vec()).await?)
    }

    fn set_interface(&self, channels: DriverChannels) {
        if let Ok(mut slot) = self.channels.lock() {
            *slot = Some(channels);
        }
    }

    async fn run(&self) -> Result<(), DriverError> {
        let channels = channels_of(&self.channels)?;
        let mut stop = self.stop_tx.subscribe();

        let (conn, proxy) = self.ensure_connected().await?;
        let self_number = proxy.get_self_number().await?;

        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(SIGNAL_INTERFACE)
            .map_err(zbus::Error::from)?
            .build();
        let mut stream = MessageStream::for_match_rule(rule, conn, None).await?;

        info!("D-Bus driver listening for bus signals");
        loop {
            tokio::select! {
                signal = stream.next() => {
                    match signal {
                        Some(Ok(msg)) => self.handle_signal(&msg, &self_number, &channels).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "bus stream error");
                            return Err(e.into());
                        }
                        None => {
                            info!("bus connection closed");
                            return Ok(());
                        }
                    }
                }
                _ = stop.changed() => {
                    info!("D-Bus driver stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self.stop_tx.send(true);
    }
}
