//! Keyed delta store: "what changed since last time" for module output.
//!
//! Each module owns its own differ, keyed by (chat, user). Only the most
//! recently observed list is kept per key; a diff renders removed items
//! before added ones, one line each.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An element a differ can compare and render.
///
/// Equality is plain value equality; an empty rendering hides the line
/// (used where removals are not user-visible).
pub trait DiffItem: PartialEq + Clone {
    /// Line shown when the item is new relative to the stored list.
    fn add_string(&self) -> String;
    /// Line shown when the item vanished from the stored list.
    fn rem_string(&self) -> String;
}

/// Plain strings diff as `> s` / `< s` lines.
impl DiffItem for String {
    fn add_string(&self) -> String {
        format!("> {self}")
    }

    fn rem_string(&self) -> String {
        format!("< {self}")
    }
}

/// Per-(chat, user) store of the last observed list.
///
/// Serializable so modules can persist their differ as part of their state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: DeserializeOwned"
))]
pub struct Differ<T> {
    store: HashMap<String, HashMap<String, Vec<T>>>,
}

impl<T> Default for Differ<T> {
    fn default() -> Self {
        Self {
            store: HashMap::new(),
        }
    }
}

impl<T: DiffItem> Differ<T> {
    /// Empty differ.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the delta of `current` against the stored list for
    /// `(chat, user)` without updating the store.
    ///
    /// A key never seen before produces the full add list; an unchanged
    /// list produces the empty string.
    pub fn diff(&self, chat: &str, user: &str, current: &[T]) -> String {
        let empty: &[T] = &[];
        let prior = self
            .store
            .get(chat)
            .and_then(|users| users.get(user))
            .map_or(empty, Vec::as_slice);
        render_delta(prior, current)
    }

    /// As [`Differ::diff`], then replace the stored list with `current`.
    pub fn diff_store(&mut self, chat: &str, user: &str, current: &[T]) -> String {
        let out = self.diff(chat, user, current);
        self.store
            .entry(chat.to_owned())
            .or_default()
            .insert(user.to_owned(), current.to_vec());
        out
    }
}

/// Removed lines first, then added lines, newline-joined, empty renderings
/// suppressed.
fn render_delta<T: DiffItem>(prior: &[T], current: &[T]) -> String {
    let mut lines = Vec::new();
    for old in prior {
        if !current.contains(old) {
            let line = old.rem_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
    }
    for new in current {
        if !prior.contains(new) {
            let line = new.add_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
    }
    lines.join("\n")
}
