//! Console driver: stdin lines in, stdout echoes out.
//!
//! Every stdin line becomes a self-sent private message (sender == receiver
//! == own number), so the whole dispatch path can be exercised without a
//! messenger. Sends rewrite the prompt so replies don't mangle the input
//! line being typed.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{channels_of, ChannelSlot, Driver, DriverChannels, DriverError};
use crate::message::Message;

/// Driver reading commands from stdin and echoing sends to stdout.
pub struct ConsoleDriver {
    number: String,
    channels: ChannelSlot,
    stop_tx: watch::Sender<bool>,
}

impl ConsoleDriver {
    /// Create a console driver impersonating `number`.
    pub fn new(number: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            number: number.into(),
            channels: ChannelSlot::default(),
            stop_tx,
        }
    }

    async fn echo(&self, text: &str, attachments: &[PathBuf]) -> Result<(), DriverError> {
        let mut stdout = tokio::io::stdout();
        // Rewrite the prompt line, print the reply, restore the prompt.
        let mut out = format!("\r{text}\n");
        for path in attachments {
            out.push_str(&format!("[attachment: {}]\n", path.display()));
        }
        out.push_str("> ");
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for ConsoleDriver {
    async fn self_number(&self) -> Result<String, DriverError> {
        Ok(self.number.clone())
    }

    async fn send_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        _recipient: &str,
        _notify_self: bool,
    ) -> Result<i64, DriverError> {
        self.echo(text, attachments).await?;
        Ok(0)
    }

    async fn send_group_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        _group_id: &[u8],
    ) -> Result<i64, DriverError> {
        self.echo(text, attachments).await?;
        Ok(0)
    }

    async fn group_name(&self, group_id: &[u8]) -> Result<String, DriverError> {
        Ok(hex::encode(group_id))
    }

    fn set_interface(&self, channels: DriverChannels) {
        if let Ok(mut slot) = self.channels.lock() {
            *slot = Some(channels);
        }
    }

    async fn run(&self) -> Result<(), DriverError> {
        let channels = channels_of(&self.channels)?;
        let mut stop = self.stop_tx.subscribe();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        info!("console driver reading from stdin");
        {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;
        }

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("stdin closed, console driver stopping");
                        return Ok(());
                    };
                    if line.is_empty() {
                        continue;
                    }
                    let msg = Message::new(
                        Utc::now().timestamp_millis(),
                        self.number.clone(),
                        self.number.clone(),
                        vec![],
                        line,
                        vec![],
                    );
                    if channels.messages.send(msg).await.is_err() {
                        debug!("message channel closed, console driver stopping");
                        return Ok(());
                    }
                }
                _ = stop.changed() => {
                    info!("console driver stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self.stop_tx.send(true);
    }
}
