//! Periodic module: user-facing front-end to the perioder.
//!
//! `add` registers a reoccurring virtual message whose text is the
//! scheduled command; every firing re-injects it into the dispatcher, so
//! the scheduled command passes the same access control as a typed one.
//! Events survive restarts: records are written to YAML on close and
//! re-bound to the current injector on start.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use super::{parse_or_reply, reply_error, Module, VirtRcv};
use crate::account::Account;
use crate::cmdsplit;
use crate::message::Message;
use crate::perioder::{Callback, PerioderHandle, ReocEvent, ReocEventRecord};

#[derive(Parser, Debug)]
#[command(
    name = "periodic",
    about = "schedule reoccurring commands",
    disable_version_flag = true
)]
struct PeriodicArgs {
    #[command(subcommand)]
    cmd: PeriodicCmd,
}

#[derive(Subcommand, Debug)]
enum PeriodicCmd {
    /// Schedule a command to fire repeatedly.
    Add {
        /// Seconds between firings.
        #[arg(long)]
        every: u64,
        /// First firing as RFC 3339; defaults to now.
        #[arg(long)]
        start: Option<String>,
        /// Stop deadline as RFC 3339.
        #[arg(long)]
        until: Option<String>,
        /// The command line to re-inject, quoted or escaped as one
        /// argument.
        command: String,
    },
    /// List live scheduled commands.
    Ls,
    /// Cancel a scheduled command by id.
    Rm {
        /// Event id from `ls`.
        id: u64,
    },
}

/// The periodic module.
pub struct Periodic {
    state_path: PathBuf,
    perioder: PerioderHandle<Message>,
}

/// Build the injection callback for one event: each firing clones the
/// stored message back into the dispatch path.
fn inject(virt: VirtRcv) -> Callback<Message> {
    Arc::new(move |_now, event: &ReocEvent<Message>| {
        virt(event.metadata().clone());
    })
}

fn parse_instant(text: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad instant {text:?}: {e}"))
}

impl Periodic {
    /// Create the module over a perioder handle and its state file.
    pub fn new(state_path: PathBuf, perioder: PerioderHandle<Message>) -> Self {
        Self {
            state_path,
            perioder,
        }
    }

    fn add(
        &self,
        msg: &Message,
        virt: VirtRcv,
        every: u64,
        start: Option<&str>,
        until: Option<&str>,
        command: &str,
    ) -> Result<String, String> {
        let command = cmdsplit::unescape(command).map_err(|e| e.to_string())?;
        let start = match start {
            Some(text) => parse_instant(text)?,
            None => Utc::now(),
        };
        let stop = until.map(parse_instant).transpose()?;
        if every == 0 {
            return Err("--every must be at least 1 second".to_owned());
        }

        let meta = msg.with_text(&command);
        let event = ReocEvent::new(
            start,
            Duration::from_secs(every),
            stop,
            command.clone(),
            meta,
            inject(virt),
        )
        .map_err(|e| e.to_string())?;

        let shown = event.to_string();
        self.perioder.add(event);
        Ok(format!("scheduled: {shown}"))
    }

    fn list(&self) -> String {
        let events: BTreeMap<u64, _> = self.perioder.events().into_iter().collect();
        if events.is_empty() {
            return "nothing scheduled".to_owned();
        }
        events
            .iter()
            .map(|(id, event)| format!("{id}: {event}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn remove(&self, id: u64) -> String {
        self.perioder.remove(id);
        format!("removed event {id}")
    }
}

#[async_trait]
impl Module for Periodic {
    fn name(&self) -> &'static str {
        "periodic"
    }

    async fn handle(&self, msg: Message, account: Arc<Account>, virt: VirtRcv) {
        let Some(args) = parse_or_reply::<PeriodicArgs>(self.name(), &msg, &account).await
        else {
            return;
        };

        let reply = match args.cmd {
            PeriodicCmd::Add {
                every,
                start,
                until,
                command,
            } => match self.add(
                &msg,
                virt,
                every,
                start.as_deref(),
                until.as_deref(),
                &command,
            ) {
                Ok(reply) => reply,
                Err(e) => {
                    reply_error(&msg, &account, &e).await;
                    return;
                }
            },
            PeriodicCmd::Ls => self.list(),
            PeriodicCmd::Rm { id } => self.remove(id),
        };

        if let Err(e) = account.respond(&reply, &[], &msg, false).await {
            warn!(error = %e, "failed to send periodic reply");
        }
    }

    async fn start(&self, virt: VirtRcv) -> anyhow::Result<()> {
        let records: BTreeMap<u64, ReocEventRecord<Message>> =
            match std::fs::read_to_string(&self.state_path) {
                Ok(contents) => serde_yaml::from_str(&contents)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
                Err(e) => {
                    warn!(error = %e, "failed to read periodic state, starting empty");
                    BTreeMap::new()
                }
            };

        let count = records.len();
        for (_, record) in records {
            // Persisted records cannot carry callbacks; re-bind each one to
            // the current injector.
            match record.into_event(inject(Arc::clone(&virt))) {
                Ok(event) => self.perioder.add(event),
                Err(e) => warn!(error = %e, "skipping invalid persisted event"),
            }
        }
        if count > 0 {
            info!(events = count, "restored scheduled commands");
        }
        Ok(())
    }

    async fn close(&self, _virt: VirtRcv) {
        let snapshot = self.perioder.snapshot();
        match serde_yaml::to_string(&snapshot) {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(&self.state_path, yaml) {
                    warn!(error = %e, "failed to persist periodic state");
                } else {
                    debug!(events = snapshot.len(), "periodic state persisted");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize periodic state"),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
