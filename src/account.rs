//! Transport-agnostic façade over a [`Driver`].
//!
//! The account owns the inbound event channels and the handler-registration
//! protocol: registrations funnel through a channel consumed only by the
//! dispatch loop, so the handler list itself is single-writer single-reader
//! and a handler added before an event is guaranteed to see it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::driver::{Driver, DriverChannels, DriverError};
use crate::message::{Message, SyncMessage};

/// Sink for inbound personal/group messages.
///
/// Handlers are invoked sequentially on the dispatch loop; they are expected
/// to be cheap or to spawn their own work.
pub type MessageHandler = Box<dyn Fn(Message) + Send + 'static>;

/// Sink for inbound linked-device sync messages.
pub type SyncMessageHandler = Box<dyn Fn(SyncMessage) + Send + 'static>;

/// Errors from account operations.
#[derive(Debug, Error)]
pub enum AccountError {
    /// The underlying driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// The dispatch loop is not running.
    #[error("account is not listening")]
    NotListening,
}

enum Registration {
    Message(MessageHandler),
    Sync(SyncMessageHandler),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Listening,
    Stopped,
}

/// Inbound channel depth; transports block once the dispatcher falls this
/// far behind.
const CHANNEL_DEPTH: usize = 64;

/// A messenger account: one driver plus the inbound dispatch loop.
pub struct Account {
    driver: Arc<dyn Driver>,
    number: String,
    reg_tx: mpsc::UnboundedSender<Registration>,
    reg_rx: Mutex<Option<mpsc::UnboundedReceiver<Registration>>>,
    stop_tx: watch::Sender<bool>,
    state: Mutex<State>,
}

impl Account {
    /// Wrap a driver, resolving the account's own number.
    ///
    /// # Errors
    ///
    /// Fails when the driver cannot report the self number.
    pub async fn new(driver: Arc<dyn Driver>) -> Result<Self, AccountError> {
        let number = driver.self_number().await?;
        let (reg_tx, reg_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        info!(number, "account ready");
        Ok(Self {
            driver,
            number,
            reg_tx,
            reg_rx: Mutex::new(Some(reg_rx)),
            stop_tx,
            state: Mutex::new(State::Init),
        })
    }

    /// The account's own phone-number identity.
    pub fn number(&self) -> &str {
        &self.number
    }

    /// Register a sink for personal/group messages. May be called from any
    /// task, before or after listening starts.
    pub fn add_message_handler(&self, handler: MessageHandler) {
        if self.reg_tx.send(Registration::Message(handler)).is_err() {
            warn!("dispatch loop gone, dropping message handler registration");
        }
    }

    /// Register a sink for sync messages.
    pub fn add_sync_message_handler(&self, handler: SyncMessageHandler) {
        if self.reg_tx.send(Registration::Sync(handler)).is_err() {
            warn!("dispatch loop gone, dropping sync handler registration");
        }
    }

    /// Start the driver and the dispatch loop; returns once setup is
    /// complete. A second call is a no-op with a warning.
    pub fn listen(self: &Arc<Self>) {
        let (ready_tx, _ready_rx) = oneshot::channel();
        self.listen_with_ready(ready_tx);
    }

    /// As [`Account::listen`], signalling `ready` once the loop is armed.
    pub fn listen_with_ready(self: &Arc<Self>, ready: oneshot::Sender<()>) {
        {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *state != State::Init {
                warn!(state = ?*state, "listen called twice, ignoring");
                return;
            }
            *state = State::Listening;
        }

        let Some(mut reg_rx) = self.reg_rx.lock().ok().and_then(|mut g| g.take()) else {
            warn!("registration channel already taken, ignoring listen");
            return;
        };

        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(CHANNEL_DEPTH);
        let (sync_tx, mut sync_rx) = mpsc::channel::<SyncMessage>(CHANNEL_DEPTH);
        self.driver.set_interface(DriverChannels {
            messages: msg_tx,
            sync_messages: sync_tx,
        });

        // Driver pump: its own task, terminated by transport error or close.
        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move {
            match driver.run().await {
                Ok(()) => info!("driver receive loop ended"),
                Err(e) => error!(error = %e, "driver receive loop failed"),
            }
        });

        // Dispatch loop: the only consumer of the handler list.
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut message_handlers: Vec<MessageHandler> = Vec::new();
            let mut sync_handlers: Vec<SyncMessageHandler> = Vec::new();
            let _ = ready.send(());
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    Some(reg) = reg_rx.recv() => match reg {
                        Registration::Message(h) => message_handlers.push(h),
                        Registration::Sync(h) => sync_handlers.push(h),
                    },
                    Some(msg) = msg_rx.recv() => {
                        for handler in &message_handlers {
                            handler(msg.clone());
                        }
                    }
                    Some(sync) = sync_rx.recv() => {
                        for handler in &sync_handlers {
                            handler(sync.clone());
                        }
                    }
                }
            }
            info!("account dispatch loop stopped");
        });
    }

    /// Send to a group when `group_id` is nonempty, else to `recipient`.
    ///
    /// # Errors
    ///
    /// Propagates the driver's send failure.
    pub async fn send_generic(
        &self,
        text: &str,
        attachments: &[PathBuf],
        recipient: &str,
        group_id: &[u8],
        notify: bool,
    ) -> Result<i64, AccountError> {
        if group_id.is_empty() {
            Ok(self
                .driver
                .send_message(text, attachments, recipient, notify)
                .await?)
        } else {
            Ok(self
                .driver
                .send_group_message(text, attachments, group_id)
                .await?)
        }
    }

    /// Reply to `incoming` in its originating chat.
    ///
    /// For a message we sent ourselves (note-to-self), the counterpart is
    /// the receiver; otherwise it is the sender.
    ///
    /// # Errors
    ///
    /// Propagates the driver's send failure.
    pub async fn respond(
        &self,
        text: &str,
        attachments: &[PathBuf],
        incoming: &Message,
        notify: bool,
    ) -> Result<i64, AccountError> {
        let recipient = if incoming.sender == self.number {
            &incoming.receiver
        } else {
            &incoming.sender
        };
        self.send_generic(text, attachments, recipient, &incoming.group_id, notify)
            .await
    }

    /// Resolve a group's human-readable name via the driver.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub async fn group_name(&self, group_id: &[u8]) -> Result<String, AccountError> {
        Ok(self.driver.group_name(group_id).await?)
    }

    /// Stop the dispatch loop and close the driver.
    pub async fn close(&self) {
        {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *state = State::Stopped;
        }
        let _ = self.stop_tx.send(true);
        self.driver.close().await;
        info!("account closed");
    }
}
