//! Two-level access-control trees.
//!
//! The root carries a default capability and one child per user; each user
//! carries its own default and one leaf per chat. `Unset` inherits from the
//! parent level, and a lookup that stays `Unset` through every level is a
//! rejection.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::DIRECT_CHAT;

/// A single permission value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Explicitly permitted.
    Allow,
    /// Explicitly denied.
    Block,
    /// Not decided at this level; inherit from the parent.
    #[default]
    Unset,
}

/// Why an access check did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// Some level resolved to an explicit `Block`.
    Blocked,
    /// Every level was `Unset`.
    FullyUnset,
}

/// Validation errors raised when an ACT is loaded from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActError {
    /// A user key does not look like a phone number.
    #[error("ACT user {0:?} does not match phone-number syntax")]
    BadUser(String),
    /// A chat key is neither a hex string nor the direct-chat literal.
    #[error("ACT chat {0:?} must be a hex string or {DIRECT_CHAT:?}")]
    BadChat(String),
}

/// Leaf of the tree: a chat-level capability, no children.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActLeaf {
    /// Capability for this exact (user, chat) pair.
    #[serde(default)]
    pub default: Capability,
}

/// Per-user node: a user-level default plus chat leaves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActUser {
    /// Capability used when the chat has no leaf (or its leaf is unset).
    #[serde(default)]
    pub default: Capability,
    /// Chat name (hex group id or [`DIRECT_CHAT`]) to leaf.
    #[serde(default)]
    pub children: HashMap<String, ActLeaf>,
}

/// An access-control tree.
///
/// Immutable after load; freely shared between tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Act {
    /// Capability used when the user has no entry (or their entry is unset).
    #[serde(default)]
    pub default: Capability,
    /// User identity to per-user node.
    #[serde(default)]
    pub children: HashMap<String, ActUser>,
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+[0-9]{3,}$").expect("static regex"))
}

/// Whether `user` has phone-number syntax (`+` followed by 3+ digits).
pub fn is_valid_user(user: &str) -> bool {
    phone_regex().is_match(user)
}

/// Whether `chat` is a valid ACT chat key: hex or the direct-chat literal.
pub fn is_valid_chat(chat: &str) -> bool {
    chat == DIRECT_CHAT || (!chat.is_empty() && chat.chars().all(|c| c.is_ascii_hexdigit()))
}

impl Act {
    /// Validate all user and chat keys.
    ///
    /// # Errors
    ///
    /// Returns the first key that fails phone-number or chat syntax.
    pub fn validate(&self) -> Result<(), ActError> {
        for (user, node) in &self.children {
            if !is_valid_user(user) {
                return Err(ActError::BadUser(user.clone()));
            }
            for chat in node.children.keys() {
                if !is_valid_chat(chat) {
                    return Err(ActError::BadChat(chat.clone()));
                }
            }
        }
        Ok(())
    }

    /// Resolve the effective capability for `(user, chat)`.
    ///
    /// The lookup cascades: a missing or unset leaf falls back to the user
    /// default, a missing or unset user falls back to the root default.
    pub fn resolve(&self, user: &str, chat: &str) -> Capability {
        let Some(node) = self.children.get(user) else {
            return self.default;
        };
        let user_default = match node.default {
            Capability::Unset => self.default,
            set => set,
        };
        let Some(leaf) = node.children.get(chat) else {
            return user_default;
        };
        match leaf.default {
            Capability::Unset => user_default,
            set => set,
        }
    }

    /// Access check: `Ok` only for an effective `Allow`.
    ///
    /// # Errors
    ///
    /// [`Denial::Blocked`] on an explicit block, [`Denial::FullyUnset`] when
    /// no level decided.
    pub fn check(&self, user: &str, chat: &str) -> Result<(), Denial> {
        match self.resolve(user, chat) {
            Capability::Allow => Ok(()),
            Capability::Block => Err(Denial::Blocked),
            Capability::Unset => Err(Denial::FullyUnset),
        }
    }
}
