//! End-to-end: driver channels → account → dispatcher → echo → driver send.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use straylight::account::Account;
use straylight::act::{Act, Capability};
use straylight::config::HandlerConfig;
use straylight::dispatcher::Dispatcher;
use straylight::message::{Message, SyncMessage};
use straylight::module::echo::Echo;
use straylight::module::Module;

use crate::util::{wait_until, TestDriver};

const BOT: &str = "+49000000000";
const ALICE: &str = "+49111111111";

fn allow_all() -> Act {
    Act {
        default: Capability::Allow,
        children: HashMap::new(),
    }
}

struct Gateway {
    driver: Arc<TestDriver>,
    account: Arc<Account>,
    _dispatcher: Arc<Dispatcher>,
}

async fn gateway(state_dir: &std::path::Path) -> Gateway {
    let driver = TestDriver::new(BOT);
    let account = Arc::new(
        Account::new(Arc::clone(&driver) as _)
            .await
            .expect("test account"),
    );

    let echo: Arc<dyn Module> = Arc::new(Echo::new(state_dir.join("echo.yaml")));
    let dispatcher = Dispatcher::new(
        Arc::clone(&account),
        allow_all(),
        vec![(
            echo,
            HandlerConfig {
                prefixes: vec!["echo".to_owned()],
                help: "echo".to_owned(),
                act: allow_all(),
            },
        )],
    )
    .expect("valid dispatcher");
    dispatcher.start().await.expect("dispatcher start");

    let (ready_tx, ready_rx) = oneshot::channel();
    account.listen_with_ready(ready_tx);
    ready_rx.await.expect("listen ready");

    Gateway {
        driver,
        account,
        _dispatcher: dispatcher,
    }
}

#[tokio::test]
async fn inbound_command_produces_a_reply() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    let inbound = Message::new(10, ALICE, BOT, vec![], "echo hello world", vec![]);
    gw.driver
        .injector()
        .messages
        .send(inbound)
        .await
        .expect("inject");

    wait_until(|| !gw.driver.sent_texts().is_empty()).await;
    let sent = gw.driver.sent.lock().expect("lock").clone();
    assert_eq!(sent[0].text, "hello world");
    assert_eq!(sent[0].recipient, ALICE, "reply goes back to the sender");
}

#[tokio::test]
async fn note_to_self_reply_inverts_recipient() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    // A message we sent ourselves: sender is the bot's own number.
    let inbound = Message::new(11, BOT, ALICE, vec![], "echo pong", vec![]);
    gw.driver
        .injector()
        .messages
        .send(inbound)
        .await
        .expect("inject");

    wait_until(|| !gw.driver.sent_texts().is_empty()).await;
    let sent = gw.driver.sent.lock().expect("lock").clone();
    assert_eq!(sent[0].recipient, ALICE, "note-to-self replies to the receiver");
}

#[tokio::test]
async fn group_replies_go_to_the_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    let inbound = Message::new(12, ALICE, BOT, vec![0xaa, 0xbb], "echo to-group", vec![]);
    gw.driver
        .injector()
        .messages
        .send(inbound)
        .await
        .expect("inject");

    wait_until(|| !gw.driver.sent_texts().is_empty()).await;
    let sent = gw.driver.sent.lock().expect("lock").clone();
    assert_eq!(sent[0].text, "to-group");
    assert_eq!(sent[0].group_id, vec![0xaa, 0xbb]);
}

#[tokio::test]
async fn linked_device_commands_are_dispatched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    let sync = SyncMessage::new(13, BOT, ALICE, vec![], "echo from-other-device", vec![]);
    gw.driver
        .injector()
        .sync_messages
        .send(sync)
        .await
        .expect("inject");

    wait_until(|| !gw.driver.sent_texts().is_empty()).await;
    assert_eq!(gw.driver.sent_texts()[0], "from-other-device");
}

#[tokio::test]
async fn attach_mode_sends_a_file_instead_of_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    let inbound = Message::new(18, ALICE, BOT, vec![], "echo --attach payload", vec![]);
    gw.driver
        .injector()
        .messages
        .send(inbound)
        .await
        .expect("inject");

    wait_until(|| !gw.driver.sent.lock().expect("lock").is_empty()).await;
    let sent = gw.driver.sent.lock().expect("lock").clone();
    assert_eq!(sent[0].text, "");
    assert_eq!(sent[0].attachments.len(), 1);
}

#[tokio::test]
async fn parse_errors_reply_with_the_diagnostic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    let inbound = Message::new(14, ALICE, BOT, vec![], "echo --no-such-flag x", vec![]);
    gw.driver
        .injector()
        .messages
        .send(inbound)
        .await
        .expect("inject");

    wait_until(|| !gw.driver.sent_texts().is_empty()).await;
    let reply = gw.driver.sent_texts()[0].clone();
    assert!(reply.contains("--no-such-flag"), "diagnostic reply: {reply}");
}

#[tokio::test]
async fn help_request_replies_with_usage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    let inbound = Message::new(15, ALICE, BOT, vec![], "echo --help", vec![]);
    gw.driver
        .injector()
        .messages
        .send(inbound)
        .await
        .expect("inject");

    wait_until(|| !gw.driver.sent_texts().is_empty()).await;
    let reply = gw.driver.sent_texts()[0].clone();
    assert!(reply.contains("Usage"), "help reply: {reply}");
}

#[tokio::test]
async fn second_listen_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;

    // Must not panic or spawn a second loop.
    gw.account.listen();

    let inbound = Message::new(16, ALICE, BOT, vec![], "echo still-works", vec![]);
    gw.driver
        .injector()
        .messages
        .send(inbound)
        .await
        .expect("inject");
    wait_until(|| !gw.driver.sent_texts().is_empty()).await;
    assert_eq!(gw.driver.sent_texts(), vec!["still-works".to_owned()]);
}

#[tokio::test]
async fn close_stops_the_dispatch_loop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(dir.path()).await;
    let injector = gw.driver.injector();

    gw.account.close().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let inbound = Message::new(17, ALICE, BOT, vec![], "echo too-late", vec![]);
    // The loop is gone; the send either fails or lands nowhere.
    let _ = injector.messages.send(inbound).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(gw.driver.sent_texts().is_empty());
}
