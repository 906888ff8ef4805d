//! Shared fixtures: an in-memory test driver and a recording module.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use straylight::account::Account;
use straylight::driver::{Driver, DriverChannels, DriverError};
use straylight::message::Message;
use straylight::module::{Module, VirtRcv};

/// One outbound send captured by the test driver.
#[derive(Debug, Clone)]
pub struct Sent {
    pub text: String,
    pub attachments: Vec<PathBuf>,
    pub recipient: String,
    pub group_id: Vec<u8>,
}

/// A driver that records sends and lets tests inject inbound messages.
pub struct TestDriver {
    number: String,
    pub sent: Mutex<Vec<Sent>>,
    channels: Mutex<Option<DriverChannels>>,
    stop_tx: watch::Sender<bool>,
}

impl TestDriver {
    pub fn new(number: &str) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            number: number.to_owned(),
            sent: Mutex::new(Vec::new()),
            channels: Mutex::new(None),
            stop_tx,
        })
    }

    /// The inbound senders, available once the account has listened.
    pub fn injector(&self) -> DriverChannels {
        self.channels
            .lock()
            .expect("lock")
            .clone()
            .expect("set_interface not called yet")
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .map(|s| s.text.clone())
            .collect()
    }
}

#[async_trait]
impl Driver for TestDriver {
    async fn self_number(&self) -> Result<String, DriverError> {
        Ok(self.number.clone())
    }

    async fn send_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        recipient: &str,
        _notify_self: bool,
    ) -> Result<i64, DriverError> {
        self.sent.lock().expect("lock").push(Sent {
            text: text.to_owned(),
            attachments: attachments.to_vec(),
            recipient: recipient.to_owned(),
            group_id: vec![],
        });
        Ok(4_242)
    }

    async fn send_group_message(
        &self,
        text: &str,
        attachments: &[PathBuf],
        group_id: &[u8],
    ) -> Result<i64, DriverError> {
        self.sent.lock().expect("lock").push(Sent {
            text: text.to_owned(),
            attachments: attachments.to_vec(),
            recipient: String::new(),
            group_id: group_id.to_vec(),
        });
        Ok(4_242)
    }

    async fn group_name(&self, _group_id: &[u8]) -> Result<String, DriverError> {
        Ok("MyGroup".to_owned())
    }

    fn set_interface(&self, channels: DriverChannels) {
        *self.channels.lock().expect("lock") = Some(channels);
    }

    async fn run(&self) -> Result<(), DriverError> {
        let mut stop = self.stop_tx.subscribe();
        let _ = stop.changed().await;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// A module that records every dispatched message.
pub struct Recording {
    name: &'static str,
    tx: mpsc::UnboundedSender<Message>,
}

impl Recording {
    pub fn new(name: &'static str) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { name, tx }), rx)
    }
}

#[async_trait]
impl Module for Recording {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, msg: Message, _account: Arc<Account>, _virt: VirtRcv) {
        let _ = self.tx.send(msg);
    }

    async fn start(&self, _virt: VirtRcv) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self, _virt: VirtRcv) {}

    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now()
        .checked_add(Duration::from_secs(2))
        .expect("deadline");
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive one recorded message within the timeout.
pub async fn recv_one(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("dispatch within 2s")
        .expect("channel open")
}
