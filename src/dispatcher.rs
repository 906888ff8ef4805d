//! Top-level router: inbound message → command lines → modules.
//!
//! The hottest path in the process. Every inbound message — real or
//! virtual — passes the server-wide user ACT, the `-r` group-name unwrap,
//! the `\n`/`|` line split, and per line the prefix index plus the module's
//! own ACT before the module runs. Virtual messages injected through
//! [`Dispatcher::virt_rcv`] re-enter the exact same path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::act::{Act, ActError, Denial};
use crate::config::HandlerConfig;
use crate::message::Message;
use crate::module::{Module, VirtRcv};

/// Errors raised while building the dispatcher. All of them are start-up
/// failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Two modules claim the same prefix.
    #[error("prefix {prefix:?} is claimed by both {first} and {second}")]
    DuplicatePrefix {
        /// The colliding prefix.
        prefix: String,
        /// Module that registered it first.
        first: String,
        /// Module that tried to register it again.
        second: String,
    },
    /// A prefix contains whitespace.
    #[error("module {module}: prefix {prefix:?} must be whitespace-free")]
    BadPrefix {
        /// Offending module.
        module: String,
        /// Offending prefix.
        prefix: String,
    },
    /// A module's ACT failed syntax validation.
    #[error("module {module}: {source}")]
    ModuleAct {
        /// Offending module.
        module: String,
        /// Underlying validation error.
        source: ActError,
    },
    /// The server-wide user ACT failed syntax validation.
    #[error("server user ACT: {0}")]
    UserAct(#[from] ActError),
    /// A module rejected its own configuration.
    #[error("module {module} configuration invalid: {reason}")]
    ModuleConfig {
        /// Offending module.
        module: String,
        /// The module's own validation error.
        reason: anyhow::Error,
    },
}

struct ModuleEntry {
    module: Arc<dyn Module>,
    config: HandlerConfig,
}

/// The router. Shared across tasks behind an `Arc`.
pub struct Dispatcher {
    account: Arc<Account>,
    users: Act,
    modules: HashMap<String, ModuleEntry>,
    prefix_index: HashMap<String, String>,
    virt_tx: mpsc::UnboundedSender<Message>,
    virt_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("prefix_index", &self.prefix_index)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Build the router: validate every module and ACT, index prefixes,
    /// reject duplicates.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`]; the process should refuse to start.
    pub fn new(
        account: Arc<Account>,
        users: Act,
        modules: Vec<(Arc<dyn Module>, HandlerConfig)>,
    ) -> Result<Arc<Self>, DispatchError> {
        users.validate()?;

        let mut entries = HashMap::new();
        let mut prefix_index: HashMap<String, String> = HashMap::new();

        for (module, config) in modules {
            let name = module.name().to_owned();

            config
                .act
                .validate()
                .map_err(|source| DispatchError::ModuleAct {
                    module: name.clone(),
                    source,
                })?;
            module
                .validate()
                .map_err(|reason| DispatchError::ModuleConfig {
                    module: name.clone(),
                    reason,
                })?;

            for prefix in &config.prefixes {
                if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
                    return Err(DispatchError::BadPrefix {
                        module: name.clone(),
                        prefix: prefix.clone(),
                    });
                }
                if let Some(first) = prefix_index.insert(prefix.clone(), name.clone()) {
                    return Err(DispatchError::DuplicatePrefix {
                        prefix: prefix.clone(),
                        first,
                        second: name,
                    });
                }
            }

            entries.insert(name, ModuleEntry { module, config });
        }

        let (virt_tx, virt_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            account,
            users,
            modules: entries,
            prefix_index,
            virt_tx,
            virt_rx: Mutex::new(Some(virt_rx)),
        }))
    }

    /// The injector handed to modules and the perioder: messages sent here
    /// re-enter [`Dispatcher::handle`].
    pub fn virt_rcv(self: &Arc<Self>) -> VirtRcv {
        let virt_tx = self.virt_tx.clone();
        Arc::new(move |msg: Message| {
            if virt_tx.send(msg).is_err() {
                warn!("dispatcher gone, dropping virtual message");
            }
        })
    }

    /// Start every module, drain the virtual-message queue, and register
    /// with the account's inbound channels.
    ///
    /// # Errors
    ///
    /// Fails when a module's `start` fails.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        for entry in self.modules.values() {
            entry
                .module
                .start(self.virt_rcv())
                .await
                .with_context(|| format!("starting module {}", entry.module.name()))?;
        }

        // Virtual messages re-enter the same handle path as wire messages.
        if let Some(mut virt_rx) = self.virt_rx.lock().ok().and_then(|mut g| g.take()) {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(msg) = virt_rx.recv().await {
                    dispatcher.handle(msg).await;
                }
            });
        }

        let dispatcher = Arc::clone(self);
        self.account.add_message_handler(Box::new(move |msg| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.handle(msg).await;
            });
        }));

        // Commands typed on a linked device arrive as sync messages; the
        // inner message goes through the same path.
        let dispatcher = Arc::clone(self);
        self.account.add_sync_message_handler(Box::new(move |sync| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.handle(sync.message).await;
            });
        }));

        info!(modules = self.modules.len(), "dispatcher started");
        Ok(())
    }

    /// Shut every module down, persisting their state.
    pub async fn close(self: &Arc<Self>) {
        for entry in self.modules.values() {
            entry.module.close(self.virt_rcv()).await;
        }
        info!("dispatcher closed");
    }

    /// Route one inbound message. Virtual and wire messages are
    /// indistinguishable here.
    pub async fn handle(self: &Arc<Self>, mut msg: Message) {
        // Server-wide user authorization.
        if let Err(denial) = self.users.check(&msg.sender, msg.act_chat()) {
            info!(sender = %msg.sender, ?denial, "user rejected by server ACT");
            return;
        }

        // Group-name alias: "-r" resolves to the group's human name, which
        // is then dispatched like any typed command.
        if msg.text == "-r" {
            if !msg.is_group() {
                debug!(sender = %msg.sender, "-r outside a group, dropping");
                return;
            }
            match self.account.group_name(&msg.group_id).await {
                Ok(name) => msg.text = name,
                Err(e) => {
                    warn!(error = %e, chat = %msg.chat, "group name lookup failed");
                    return;
                }
            }
        }

        // One Signal message may carry several commands: newline or pipe.
        for line in msg.text.split(['\n', '|']) {
            self.handle_line(&msg, line);
        }
    }

    /// Route a single command line; the module runs on its own task.
    fn handle_line(self: &Arc<Self>, msg: &Message, line: &str) {
        let (prefix, remainder) = match line.split_once(' ') {
            Some((prefix, remainder)) => (prefix, remainder),
            None => (line, ""),
        };

        let Some(name) = self.prefix_index.get(prefix) else {
            debug!(prefix, "no module for prefix, dropping line");
            return;
        };
        let Some(entry) = self.modules.get(name) else {
            return;
        };

        if let Err(denial) = entry.config.act.check(&msg.sender, msg.act_chat()) {
            info!(
                sender = %msg.sender,
                chat = %msg.act_chat(),
                module = %name,
                ?denial,
                "line rejected by module ACT"
            );
            return;
        }

        // Shallow copy so concurrent lines never race on the text.
        let copy = msg.with_text(remainder);
        let module = Arc::clone(&entry.module);
        let account = Arc::clone(&self.account);
        let virt = self.virt_rcv();
        tokio::spawn(async move {
            module.handle(copy, account, virt).await;
        });
    }
}
