//! The contract every command-producing module satisfies, plus shared
//! argument parsing.
//!
//! Modules receive already-authorized command lines from the dispatcher,
//! reply through the account, and may inject virtual messages back into the
//! dispatch path via the `virt_rcv` callback they are handed.

pub mod echo;
pub mod periodic;

use std::sync::Arc;

use async_trait::async_trait;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, warn};

use crate::account::Account;
use crate::cmdsplit;
use crate::message::Message;

/// Injector for virtual messages: anything passed here re-enters the
/// dispatcher as if it had arrived from the wire.
pub type VirtRcv = Arc<dyn Fn(Message) + Send + Sync + 'static>;

/// A user-invocable command module.
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable module name, used for prefix-index diagnostics and state
    /// file names.
    fn name(&self) -> &'static str;

    /// Handle one dispatched command line. The message text is the line
    /// remainder after the prefix. Errors are the module's own business:
    /// format them and send them back.
    async fn handle(&self, msg: Message, account: Arc<Account>, virt: VirtRcv);

    /// Initialize: load persisted state, kick off long-running work.
    ///
    /// # Errors
    ///
    /// A failure here aborts start-up.
    async fn start(&self, virt: VirtRcv) -> anyhow::Result<()>;

    /// Persist state and release resources.
    async fn close(&self, virt: VirtRcv);

    /// Configuration sanity check, run at dispatcher construction.
    ///
    /// # Errors
    ///
    /// A failure here aborts start-up.
    fn validate(&self) -> anyhow::Result<()>;
}

/// Outcome of parsing a command line against a clap parser.
#[derive(Debug)]
pub enum ArgOutcome<T> {
    /// The line parsed; here are the arguments.
    Parsed(T),
    /// The user asked for help; reply with the rendered text.
    Help(String),
    /// The line did not parse; reply with the diagnostic.
    Error(String),
}

/// Split `text` with the command splitter and parse it as `T`.
///
/// `prefix` becomes argv[0] so diagnostics and help name the command the
/// user actually typed.
pub fn parse_args<T: Parser>(prefix: &str, text: &str) -> ArgOutcome<T> {
    let tokens = match cmdsplit::split(text) {
        Ok(tokens) => tokens,
        Err(e) => return ArgOutcome::Error(e.to_string()),
    };
    let argv = std::iter::once(prefix.to_owned()).chain(tokens);
    match T::try_parse_from(argv) {
        Ok(parsed) => ArgOutcome::Parsed(parsed),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::DisplayHelp
                    | ErrorKind::DisplayVersion
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
        {
            ArgOutcome::Help(e.render().to_string())
        }
        Err(e) => ArgOutcome::Error(e.render().to_string()),
    }
}

/// Parse the message text as `T`, replying help or the parse diagnostic
/// directly to the originating chat when the module body must not run.
pub async fn parse_or_reply<T: Parser>(
    prefix: &str,
    msg: &Message,
    account: &Account,
) -> Option<T> {
    match parse_args::<T>(prefix, &msg.text) {
        ArgOutcome::Parsed(parsed) => Some(parsed),
        ArgOutcome::Help(help) => {
            if let Err(e) = account.respond(&help, &[], msg, false).await {
                warn!(error = %e, "failed to send help text");
            }
            None
        }
        ArgOutcome::Error(diag) => {
            if let Err(e) = account.respond(&diag, &[], msg, false).await {
                warn!(error = %e, "failed to send parse diagnostic");
            }
            None
        }
    }
}

/// Reply with a module error string, logging it; one notification attempt.
pub async fn reply_error(msg: &Message, account: &Account, text: &str) {
    error!(module_error = text, chat = %msg.chat, "module error");
    if let Err(e) = account.respond(text, &[], msg, false).await {
        warn!(error = %e, "failed to send error reply");
    }
}
