//! Canonical inbound message types shared by all drivers.
//!
//! Every transport normalizes its wire format into [`Message`] (or
//! [`SyncMessage`] for linked-device traffic) before anything else in the
//! process sees it. The derived `chat` field is the stable routing key for
//! per-conversation state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The access-control name of any non-group conversation.
///
/// Group chats are keyed by the hex of their group id; every direct chat
/// shares this single literal in access-control trees.
pub const DIRECT_CHAT: &str = "direct";

/// A normalized inbound message.
///
/// Produced by the drivers and by the perioder (virtual messages); the two
/// are indistinguishable once inside the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned timestamp in milliseconds; correlates receipts.
    pub timestamp: i64,
    /// Phone-number-shaped identity of the sender.
    pub sender: String,
    /// Receiving identity: self for inbound private messages, the sender
    /// itself for note-to-self.
    pub receiver: String,
    /// Opaque group identifier; empty for direct chats.
    #[serde(default)]
    pub group_id: Vec<u8>,
    /// Stable routing key: hex of `group_id` when in a group, else the
    /// counterpart phone number. Always set.
    pub chat: String,
    /// Message text.
    pub text: String,
    /// Paths of downloaded attachment files, in wire order.
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

impl Message {
    /// Build a message, deriving the `chat` routing key.
    pub fn new(
        timestamp: i64,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        group_id: Vec<u8>,
        text: impl Into<String>,
        attachments: Vec<PathBuf>,
    ) -> Self {
        let sender = sender.into();
        let chat = derive_chat(&group_id, &sender);
        Self {
            timestamp,
            sender,
            receiver: receiver.into(),
            group_id,
            chat,
            text: text.into(),
            attachments,
        }
    }

    /// Whether this message originated in a group chat.
    pub fn is_group(&self) -> bool {
        !self.group_id.is_empty()
    }

    /// The chat name used for access-control lookups: the hex group id in a
    /// group, the literal [`DIRECT_CHAT`] otherwise.
    pub fn act_chat(&self) -> &str {
        if self.is_group() {
            &self.chat
        } else {
            DIRECT_CHAT
        }
    }

    /// Shallow copy with replaced text, used when one inbound message fans
    /// out into several command lines.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.text = text.into();
        copy
    }
}

/// A message our own account sent from a linked device.
///
/// Identical to [`Message`] plus the destination the linked device sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// The wrapped message.
    pub message: Message,
    /// Where the linked device sent the message.
    pub destination: String,
}

impl SyncMessage {
    /// Build a sync message, deriving the chat key from the counterpart.
    ///
    /// The counterpart of a linked-device message is its destination (the
    /// source is ourselves); an absent destination means note-to-self.
    pub fn new(
        timestamp: i64,
        source: impl Into<String>,
        destination: impl Into<String>,
        group_id: Vec<u8>,
        text: impl Into<String>,
        attachments: Vec<PathBuf>,
    ) -> Self {
        let source = source.into();
        let destination = destination.into();
        let counterpart = if destination.is_empty() {
            source.clone()
        } else {
            destination.clone()
        };
        let chat = derive_chat(&group_id, &counterpart);
        Self {
            message: Message {
                timestamp,
                sender: source,
                receiver: counterpart,
                group_id,
                chat,
                text: text.into(),
                attachments,
            },
            destination,
        }
    }
}

/// Derive the routing key: hex group id if in a group, else the counterpart
/// phone number.
pub fn derive_chat(group_id: &[u8], counterpart: &str) -> String {
    if group_id.is_empty() {
        counterpart.to_owned()
    } else {
        hex::encode(group_id)
    }
}
