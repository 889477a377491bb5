use super::*;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(PeerKey, TypingStatus)>>,
}

#[async_trait]
impl TypingTransport for RecordingTransport {
    async fn send_typing(&self, to: &PeerKey, status: TypingStatus) {
        self.sent.lock().await.push((to.clone(), status));
    }
}

fn peer(raw: &str) -> PeerKey {
    PeerKey::normalize(raw)
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn one_typing_notice_per_burst_then_single_idle() {
    let transport = Arc::new(RecordingTransport::default());
    let notifier = TypingNotifier::new(transport.clone(), Duration::from_secs(1));
    let jane = peer("jane@x.com");

    for _ in 0..3 {
        notifier.notify_typing(&jane, true).await;
        advance(300).await;
    }
    assert_eq!(
        *transport.sent.lock().await,
        vec![(jane.clone(), TypingStatus::Typing)]
    );

    // Last keystroke at 600ms; idle fires at 1600ms.
    advance(600).await;
    assert_eq!(transport.sent.lock().await.len(), 1);
    advance(200).await;
    assert_eq!(
        *transport.sent.lock().await,
        vec![
            (jane.clone(), TypingStatus::Typing),
            (jane.clone(), TypingStatus::Idle)
        ]
    );

    advance(5_000).await;
    assert_eq!(transport.sent.lock().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_idle_cancels_the_timer() {
    let transport = Arc::new(RecordingTransport::default());
    let notifier = TypingNotifier::new(transport.clone(), Duration::from_secs(1));
    let jane = peer("jane@x.com");

    notifier.notify_typing(&jane, false).await;
    assert!(transport.sent.lock().await.is_empty());

    notifier.notify_typing(&jane, true).await;
    notifier.notify_typing(&jane, false).await;
    advance(2_000).await;
    assert_eq!(
        *transport.sent.lock().await,
        vec![
            (jane.clone(), TypingStatus::Typing),
            (jane, TypingStatus::Idle)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn switching_peer_ends_previous_burst() {
    let transport = Arc::new(RecordingTransport::default());
    let notifier = TypingNotifier::new(transport.clone(), Duration::from_secs(1));
    let jane = peer("jane@x.com");
    let bob = peer("bob@x.com");

    notifier.notify_typing(&jane, true).await;
    notifier.notify_typing(&bob, true).await;
    notifier.reset().await;
    notifier.notify_typing(&PeerKey::empty(), true).await;
    advance(2_000).await;

    assert_eq!(
        *transport.sent.lock().await,
        vec![
            (jane.clone(), TypingStatus::Typing),
            (jane, TypingStatus::Idle),
            (bob.clone(), TypingStatus::Typing),
            (bob, TypingStatus::Idle),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn remote_display_expires_without_idle_notice() {
    let display = RemoteTypingDisplay::new(Duration::from_secs(3));
    let mut changes = display.subscribe();

    display
        .apply(peer("jane@x.com"), peer("me@x.com"), true)
        .await;
    let shown = display.current().expect("typing shown");
    assert_eq!(shown.from, peer("jane@x.com"));
    assert!(shown.active);
    assert!(changes.has_changed().expect("sender alive"));
    let _ = changes.borrow_and_update();

    advance(2_900).await;
    assert!(display.current().is_some());

    advance(200).await;
    assert!(display.current().is_none());
    assert!(changes.has_changed().expect("sender alive"));
    assert!(changes.borrow_and_update().is_none());
}

#[tokio::test(start_paused = true)]
async fn repeated_notice_restarts_expiry() {
    let display = RemoteTypingDisplay::new(Duration::from_secs(3));
    let jane = peer("jane@x.com");
    let me = peer("me@x.com");

    display.apply(jane.clone(), me.clone(), true).await;
    advance(2_000).await;
    display.apply(jane.clone(), me.clone(), true).await;
    advance(2_000).await;
    assert!(display.current().is_some(), "restarted window still open");
    advance(1_100).await;
    assert!(display.current().is_none());

    display.apply(jane.clone(), me.clone(), true).await;
    display.apply(jane, me, false).await;
    assert!(display.current().is_none());
    assert!(display.subscribe().borrow().is_none());
}

#[tokio::test(start_paused = true)]
async fn clear_hides_indicator_immediately() {
    let display = RemoteTypingDisplay::new(Duration::from_secs(3));
    display
        .apply(peer("jane@x.com"), peer("me@x.com"), true)
        .await;
    display.clear().await;
    assert!(display.current().is_none());
}
