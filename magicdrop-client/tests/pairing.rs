use std::time::Duration;

use magicdrop_client::{
    ChannelError, DesktopReceiver, LocalBus, MemoryClipboard, MobileSender, PubSub,
    ReceiverCommand, ReceiverExit, ReceiverState, RelayClient, SendError, SenderState,
    run_receiver,
};
use magicdrop_core::{ChannelName, CoreError, MAX_CLIPBOARD_TEXT_BYTES, SessionToken, pairing_link};
use magicdrop_relay::{AppState, serve};
use tokio::{net::TcpListener, sync::mpsc, sync::oneshot, time::timeout};
use url::Url;

fn origin() -> Url {
    Url::parse("http://127.0.0.1:8080").expect("origin")
}

#[tokio::test]
async fn scanned_link_delivers_clipboard_to_desktop() {
    let bus = LocalBus::new();
    let token = SessionToken::generate();
    let channel = ChannelName::for_session(&token);

    let desktop_clipboard = MemoryClipboard::default();
    let mut receiver = DesktopReceiver::new(desktop_clipboard.clone());
    let subscription = bus.subscribe(&channel).await.expect("desktop subscribes");
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let link = pairing_link(&origin(), &token).expect("pairing link");
    let mut sender = MobileSender::from_link(
        &link,
        bus.clone(),
        MemoryClipboard::with_text("hello"),
        (),
    )
    .expect("link carries a session");

    let mut seen = Vec::new();
    let phone = async {
        sender.send_clipboard().await.expect("clipboard readable");
        command_tx
            .send(ReceiverCommand::ScanAnother)
            .expect("receiver running");
        command_tx.send(ReceiverCommand::Quit).expect("receiver running");
    };
    let (exit, ()) = tokio::join!(
        run_receiver(&mut receiver, subscription, command_rx, |r| {
            seen.push((r.status(), bus.subscriber_count(&channel)));
        }),
        phone,
    );

    assert_eq!(exit, ReceiverExit::Quit);
    assert_eq!(sender.state(), SenderState::Sent);
    assert_eq!(desktop_clipboard.text(), "hello");
    assert_eq!(
        seen,
        vec![
            ("Scan to Connect", 1),
            ("Copied to Clipboard!", 1),
            ("Ready", 1),
        ]
    );
    assert_eq!(receiver.state(), ReceiverState::Idle);
    assert_eq!(bus.subscriber_count(&channel), 0);
}

#[tokio::test]
async fn manual_copy_recovers_from_failed_write() {
    let bus = LocalBus::new();
    let token = SessionToken::generate();
    let channel = ChannelName::for_session(&token);

    let desktop_clipboard = MemoryClipboard::default();
    desktop_clipboard.deny_writes(true);
    let mut receiver = DesktopReceiver::new(desktop_clipboard.clone());
    let subscription = bus.subscribe(&channel).await.expect("desktop subscribes");
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let mut sender = MobileSender::new(token, bus.clone(), MemoryClipboard::with_text("retry"), ());
    sender.send_clipboard().await.expect("clipboard readable");

    let mut seen = Vec::new();
    let clipboard = desktop_clipboard.clone();
    let user = async {
        tokio::task::yield_now().await;
        clipboard.deny_writes(false);
        command_tx
            .send(ReceiverCommand::ManualCopy)
            .expect("receiver running");
        command_tx.send(ReceiverCommand::Quit).expect("receiver running");
    };
    let (exit, ()) = tokio::join!(
        run_receiver(&mut receiver, subscription, command_rx, |r| seen.push(r.status())),
        user,
    );

    assert_eq!(exit, ReceiverExit::Quit);
    assert_eq!(seen, vec!["Scan to Connect", "Click to Copy", "Copied!"]);
    assert_eq!(desktop_clipboard.text(), "retry");
}

#[tokio::test]
async fn link_without_session_sends_nothing() {
    let bus = LocalBus::new();
    let link = Url::parse("http://127.0.0.1:8080/mobile?x=1").expect("link");

    let result = MobileSender::from_link(&link, bus.clone(), MemoryClipboard::with_text("secret"), ());

    assert!(matches!(result, Err(CoreError::InvalidSession)));
    assert_eq!(bus.published_count(), 0);
}

#[tokio::test]
async fn clipboard_crosses_the_relay() {
    let (server_url, shutdown_tx, state) = start_relay().await;
    let token = SessionToken::generate();
    let channel = ChannelName::for_session(&token);

    let desktop = RelayClient::connect(&server_url)
        .await
        .expect("desktop connects");
    let mut subscription = desktop
        .subscribe(&channel)
        .await
        .expect("desktop subscribes");
    assert_eq!(state.subscriber_count(&channel).await, 1);

    let mobile = RelayClient::connect(&server_url)
        .await
        .expect("mobile connects");
    let mut sender = MobileSender::new(
        token,
        mobile,
        MemoryClipboard::with_text("over the wire"),
        (),
    );
    sender.send_clipboard().await.expect("clipboard readable");

    let message = timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("delivered in time")
        .expect("subscription open");
    assert_eq!(message.text, "over the wire");

    sender.into_pubsub().close().await;
    drop(subscription);
    wait_for_subscribers(&state, &channel, 0).await;
    desktop.close().await;

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn escaped_overflow_is_refused_and_connection_survives() {
    let (server_url, shutdown_tx, _state) = start_relay().await;
    let token = SessionToken::generate();
    let channel = ChannelName::for_session(&token);

    let desktop = RelayClient::connect(&server_url)
        .await
        .expect("desktop connects");
    let mut subscription = desktop
        .subscribe(&channel)
        .await
        .expect("desktop subscribes");

    let mobile = RelayClient::connect(&server_url)
        .await
        .expect("mobile connects");
    let clipboard = MemoryClipboard::with_text(&"\"".repeat(MAX_CLIPBOARD_TEXT_BYTES));
    let mut sender = MobileSender::new(token, mobile, clipboard.clone(), ());

    let err = sender
        .send_clipboard()
        .await
        .expect_err("escaped frame exceeds the relay limit");
    assert!(matches!(
        err,
        SendError::Rejected(CoreError::ClipboardTooLarge)
    ));
    assert_ne!(sender.state(), SenderState::Sent);

    clipboard.set_text("after the refusal");
    sender.send_clipboard().await.expect("clipboard readable");
    let message = timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("delivered in time")
        .expect("subscription open");
    assert_eq!(message.text, "after the refusal");

    sender.into_pubsub().close().await;
    drop(subscription);
    desktop.close().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn relay_client_refuses_duplicate_subscription() {
    let (server_url, shutdown_tx, state) = start_relay().await;
    let channel = ChannelName::for_session(&SessionToken::generate());

    let desktop = RelayClient::connect(&server_url)
        .await
        .expect("desktop connects");
    let first = desktop.subscribe(&channel).await.expect("first subscribe");

    let err = desktop
        .subscribe(&channel)
        .await
        .expect_err("second subscribe refused");
    assert!(matches!(err, ChannelError::AlreadySubscribed(_)));

    drop(first);
    let again = desktop
        .subscribe(&channel)
        .await
        .expect("resubscribe after release");
    assert_eq!(again.channel(), &channel);
    wait_for_subscribers(&state, &channel, 1).await;

    desktop.close().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unreachable_relay_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe socket");
    let address = listener.local_addr().expect("probe local addr");
    drop(listener);

    let result = RelayClient::connect(&format!("ws://{address}/ws")).await;
    assert!(matches!(result, Err(ChannelError::Unavailable(_))));
}

async fn start_relay() -> (String, oneshot::Sender<()>, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = AppState::new();

    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    (format!("ws://{}/ws", address), shutdown_tx, state)
}

async fn wait_for_subscribers(state: &AppState, channel: &ChannelName, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.subscriber_count(channel).await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriber count never reached {expected}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
