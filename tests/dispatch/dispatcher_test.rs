//! Tests for `src/dispatcher.rs` — routing, line split, ACT enforcement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use straylight::account::Account;
use straylight::act::{Act, ActLeaf, ActUser, Capability};
use straylight::config::HandlerConfig;
use straylight::dispatcher::{DispatchError, Dispatcher};
use straylight::message::Message;
use straylight::module::Module;

use crate::util::{recv_one, Recording, TestDriver};

const BOT: &str = "+49000000000";
const ALICE: &str = "+49111111111";

fn allow_all() -> Act {
    Act {
        default: Capability::Allow,
        children: HashMap::new(),
    }
}

fn handler(prefixes: &[&str], act: Act) -> HandlerConfig {
    HandlerConfig {
        prefixes: prefixes.iter().map(|p| (*p).to_owned()).collect(),
        help: String::new(),
        act,
    }
}

fn direct_msg(text: &str) -> Message {
    Message::new(1, ALICE, BOT, vec![], text, vec![])
}

fn group_msg(text: &str) -> Message {
    Message::new(1, ALICE, BOT, vec![0x01, 0x02], text, vec![])
}

async fn account() -> Arc<Account> {
    let driver = TestDriver::new(BOT);
    Arc::new(Account::new(driver).await.expect("test driver account"))
}

#[tokio::test]
async fn lines_split_on_newline_and_pipe() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(
            module as Arc<dyn Module>,
            handler(&["cmd1", "cmd2", "cmd3"], allow_all()),
        )],
    )
    .expect("valid dispatcher");

    dispatcher.handle(direct_msg("cmd1 a\ncmd2 b|cmd3 c")).await;

    let mut texts = vec![
        recv_one(&mut rx).await.text,
        recv_one(&mut rx).await.text,
        recv_one(&mut rx).await.text,
    ];
    texts.sort();
    assert_eq!(texts, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn group_name_alias_is_unwrapped() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(
            module as Arc<dyn Module>,
            handler(&["MyGroup"], allow_all()),
        )],
    )
    .expect("valid dispatcher");

    dispatcher.handle(group_msg("-r")).await;

    let seen = recv_one(&mut rx).await;
    assert_eq!(seen.text, "", "the group name is the whole command");
    assert_eq!(seen.chat, "0102");
}

#[tokio::test]
async fn group_name_alias_outside_group_is_dropped() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(
            module as Arc<dyn Module>,
            handler(&["MyGroup", "-r"], allow_all()),
        )],
    )
    .expect("valid dispatcher");

    dispatcher.handle(direct_msg("-r")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "nothing may be dispatched");
}

#[tokio::test]
async fn unknown_prefix_is_dropped_silently() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(module as Arc<dyn Module>, handler(&["known"], allow_all()))],
    )
    .expect("valid dispatcher");

    dispatcher.handle(direct_msg("unknown anything")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn server_act_blocks_user_before_any_module() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let mut users = Act {
        default: Capability::Block,
        children: HashMap::new(),
    };
    users.children.insert(
        "+49222222222".to_owned(),
        ActUser {
            default: Capability::Allow,
            children: HashMap::new(),
        },
    );
    let dispatcher = Dispatcher::new(
        account,
        users,
        vec![(module as Arc<dyn Module>, handler(&["cmd"], allow_all()))],
    )
    .expect("valid dispatcher");

    // ALICE is not in the allow list.
    dispatcher.handle(direct_msg("cmd hello")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn module_act_cascade_blocks_chat() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");

    // Module ACT: ALICE allowed by default, but blocked in group 0102.
    let mut act = Act {
        default: Capability::Block,
        children: HashMap::new(),
    };
    let mut alice = ActUser {
        default: Capability::Allow,
        children: HashMap::new(),
    };
    alice.children.insert(
        "0102".to_owned(),
        ActLeaf {
            default: Capability::Block,
        },
    );
    act.children.insert(ALICE.to_owned(), alice);

    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(module as Arc<dyn Module>, handler(&["cmd"], act))],
    )
    .expect("valid dispatcher");

    dispatcher.handle(group_msg("cmd in-group")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "group chat is blocked");

    dispatcher.handle(direct_msg("cmd direct")).await;
    let seen = recv_one(&mut rx).await;
    assert_eq!(seen.text, "direct", "direct chat inherits the allow");
}

#[tokio::test]
async fn fully_unset_act_rejects() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(module as Arc<dyn Module>, handler(&["cmd"], Act::default()))],
    )
    .expect("valid dispatcher");

    dispatcher.handle(direct_msg("cmd hello")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_prefixes_are_rejected_at_construction() {
    let account = account().await;
    let (first, _rx1) = Recording::new("first");
    let (second, _rx2) = Recording::new("second");
    let err = Dispatcher::new(
        account,
        allow_all(),
        vec![
            (first as Arc<dyn Module>, handler(&["cmd"], allow_all())),
            (second as Arc<dyn Module>, handler(&["cmd"], allow_all())),
        ],
    )
    .expect_err("duplicate prefix must fail");
    assert!(matches!(err, DispatchError::DuplicatePrefix { .. }));
}

#[tokio::test]
async fn whitespace_prefix_is_rejected_at_construction() {
    let account = account().await;
    let (module, _rx) = Recording::new("rec");
    let err = Dispatcher::new(
        account,
        allow_all(),
        vec![(module as Arc<dyn Module>, handler(&["two words"], allow_all()))],
    )
    .expect_err("whitespace prefix must fail");
    assert!(matches!(err, DispatchError::BadPrefix { .. }));
}

#[tokio::test]
async fn virtual_messages_take_the_same_path() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(module as Arc<dyn Module>, handler(&["cmd"], allow_all()))],
    )
    .expect("valid dispatcher");
    dispatcher.start().await.expect("start");

    let virt = dispatcher.virt_rcv();
    virt(direct_msg("cmd from-a-timer"));

    let seen = recv_one(&mut rx).await;
    assert_eq!(seen.text, "from-a-timer");
}

#[tokio::test]
async fn remainder_is_empty_for_bare_prefix() {
    let account = account().await;
    let (module, mut rx) = Recording::new("rec");
    let dispatcher = Dispatcher::new(
        account,
        allow_all(),
        vec![(module as Arc<dyn Module>, handler(&["ls"], allow_all()))],
    )
    .expect("valid dispatcher");

    dispatcher.handle(direct_msg("ls")).await;
    let seen = recv_one(&mut rx).await;
    assert_eq!(seen.text, "");
}
