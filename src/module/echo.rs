//! Echo module: replies with its arguments.
//!
//! Small on purpose, but it exercises every seam a content module uses:
//! the respond facade, clap help rendering, the differ's delta mode, and
//! scoped temp attachments.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, warn};

use super::{parse_or_reply, reply_error, Module, VirtRcv};
use crate::account::Account;
use crate::attachment::TempAttachment;
use crate::differ::Differ;
use crate::message::Message;

#[derive(Parser, Debug)]
#[command(name = "echo", about = "echo arguments back", disable_version_flag = true)]
struct EchoArgs {
    /// Words to echo.
    #[arg(required = true)]
    words: Vec<String>,
    /// Reply only with the delta against the previous invocation in this
    /// chat.
    #[arg(short, long)]
    diff: bool,
    /// Send the reply as a text-file attachment.
    #[arg(short, long)]
    attach: bool,
}

/// The echo module. Owns its differ; persisted as module state.
pub struct Echo {
    state_path: PathBuf,
    differ: Mutex<Differ<String>>,
}

impl Echo {
    /// Create the module with its state file location.
    pub fn new(state_path: PathBuf) -> Self {
        Self {
            state_path,
            differ: Mutex::new(Differ::new()),
        }
    }

    fn render(&self, msg: &Message, args: &EchoArgs) -> Option<String> {
        if args.diff {
            let delta = match self.differ.lock() {
                Ok(mut differ) => differ.diff_store(&msg.chat, &msg.sender, &args.words),
                Err(poisoned) => {
                    poisoned
                        .into_inner()
                        .diff_store(&msg.chat, &msg.sender, &args.words)
                }
            };
            if delta.is_empty() {
                debug!(chat = %msg.chat, "no delta, staying quiet");
                return None;
            }
            Some(delta)
        } else {
            Some(args.words.join(" "))
        }
    }
}

#[async_trait]
impl Module for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn handle(&self, msg: Message, account: Arc<Account>, _virt: VirtRcv) {
        let Some(args) = parse_or_reply::<EchoArgs>(self.name(), &msg, &account).await else {
            return;
        };
        let Some(reply) = self.render(&msg, &args) else {
            return;
        };

        let result = if args.attach {
            // The attachment must outlive the send.
            match TempAttachment::with_contents(".txt", reply.as_bytes()) {
                Ok(attachment) => {
                    account
                        .respond("", &[attachment.path().to_path_buf()], &msg, false)
                        .await
                }
                Err(e) => {
                    reply_error(&msg, &account, &format!("attachment failed: {e}")).await;
                    return;
                }
            }
        } else {
            account.respond(&reply, &[], &msg, false).await
        };

        if let Err(e) = result {
            reply_error(&msg, &account, &format!("send failed: {e}")).await;
        }
    }

    async fn start(&self, _virt: VirtRcv) -> anyhow::Result<()> {
        match std::fs::read_to_string(&self.state_path) {
            Ok(contents) => {
                let restored: Differ<String> = serde_yaml::from_str(&contents)?;
                if let Ok(mut differ) = self.differ.lock() {
                    *differ = restored;
                }
                debug!(path = %self.state_path.display(), "echo state restored");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to read echo state, starting fresh"),
        }
        Ok(())
    }

    async fn close(&self, _virt: VirtRcv) {
        let snapshot = match self.differ.lock() {
            Ok(differ) => differ.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match serde_yaml::to_string(&snapshot) {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(&self.state_path, yaml) {
                    warn!(error = %e, "failed to persist echo state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize echo state"),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
