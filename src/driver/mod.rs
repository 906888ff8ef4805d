//! Wire-level adapters to concrete messenger transports.
//!
//! Every transport implements [`Driver`]: the account hands over its inbound
//! channels via [`Driver::set_interface`], spawns [`Driver::run`], and sends
//! through the outbound methods. The three variants are interchangeable.

pub mod console;
pub mod dbus;
pub mod jsonrpc;

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{Message, SyncMessage};

/// Errors shared by all drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// A send was attempted before the transport was connected, or after
    /// close.
    #[error("driver is not connected")]
    NotConnected,
    /// The transport returned a frame we could not decode.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// D-Bus failure.
    #[error("dbus error: {0}")]
    DBus(#[from] zbus::Error),
    /// Socket-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure on the wire.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Inbound senders handed to a driver before its receive loop starts.
#[derive(Debug, Clone)]
pub struct DriverChannels {
    /// Sink for normalized personal/group messages.
    pub messages: mpsc::Sender<Message>,
    /// Sink for linked-device sync messages.
    pub sync_messages: mpsc::Sender<SyncMessage>,
}

/// Shared holder for the channels, set once by the account.
pub(crate) type ChannelSlot = Mutex<Option<DriverChannels>>;

/// A wire-level adapter to one concrete messenger transport.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The phone-number identity of the account behind this transport.
    async fn self_number(&self) -> Result<String, DriverError>;

    /// Send a personal message; returns the server-assigned timestamp
    /// (0 when the transport has no notion of one).
    ///
    /// With `notify_self`, a copy is also delivered to the own number so
    /// linked devices see the reply.
    async fn send_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        recipient: &str,
        notify_self: bool,
    ) -> Result<i64, DriverError>;

    /// Send to a group; returns the server-assigned timestamp.
    async fn send_group_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        group_id: &[u8],
    ) -> Result<i64, DriverError>;

    /// Resolve a group id to its human-readable name.
    async fn group_name(&self, group_id: &[u8]) -> Result<String, DriverError>;

    /// Hand over the inbound channels. Must be called before [`Driver::run`].
    fn set_interface(&self, channels: DriverChannels);

    /// Blocking receive loop: pushes inbound events onto the channels from
    /// [`Driver::set_interface`] until a transport error or [`Driver::close`].
    ///
    /// # Errors
    ///
    /// Terminates with the transport error that ended the loop.
    async fn run(&self) -> Result<(), DriverError>;

    /// Release the transport and unblock [`Driver::run`].
    async fn close(&self);
}

/// Fetch the channels out of a slot, or fail with [`DriverError::NotConnected`].
pub(crate) fn channels_of(slot: &ChannelSlot) -> Result<DriverChannels, DriverError> {
    slot.lock()
        .ok()
        .and_then(|guard| guard.clone())
        .ok_or(DriverError::NotConnected)
}
