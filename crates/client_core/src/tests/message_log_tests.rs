use chrono::TimeZone;
use shared::domain::GroupId;

use super::*;

fn me() -> PeerKey {
    PeerKey::normalize("me@x.com")
}

fn peer_scope() -> ConversationScope {
    ConversationScope::Direct(PeerKey::normalize("p@x.com"))
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).single().expect("timestamp")
}

fn server_message(
    server_id: Option<i64>,
    correlation_id: Option<&str>,
    sender: &str,
    text: &str,
    seconds: i64,
) -> Message {
    Message {
        server_id: server_id.map(ServerMessageId),
        correlation_id: correlation_id.map(CorrelationId::new),
        sender: PeerKey::normalize(sender),
        scope: peer_scope(),
        text: text.to_string(),
        created_at: at(seconds),
        read_state: ReadState::Delivered,
        failure: None,
    }
}

fn open_log() -> MessageLog {
    let mut log = MessageLog::new(me());
    log.reset(Some(peer_scope()));
    log
}

fn assert_unique_keys(log: &MessageLog) {
    let mut server_ids = HashSet::new();
    let mut correlation_ids = HashSet::new();
    for message in log.messages() {
        if let Some(server_id) = message.server_id {
            assert!(server_ids.insert(server_id), "duplicate server id {server_id}");
        }
        if let Some(correlation_id) = &message.correlation_id {
            assert!(
                correlation_ids.insert(correlation_id.clone()),
                "duplicate correlation id {correlation_id}"
            );
        }
    }
}

#[test]
fn send_then_echo_confirms_in_place() {
    let mut log = open_log();
    let pending = log.push_pending("hi").expect("pending");

    assert_eq!(log.len(), 1);
    assert_eq!(log.messages()[0].read_state, ReadState::Pending);
    assert_eq!(log.messages()[0].text, "hi");

    let mut echo = server_message(Some(42), None, "me@x.com", "hi", 5);
    echo.correlation_id = pending.correlation_id.clone();
    assert_eq!(log.reconcile(echo), ReconcileOutcome::Confirmed { index: 0 });

    assert_eq!(log.len(), 1);
    let entry = &log.messages()[0];
    assert_eq!(entry.read_state, ReadState::Delivered);
    assert_eq!(entry.server_id, Some(ServerMessageId(42)));
    assert_eq!(entry.created_at, at(5));
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let mut log = open_log();
    let first = server_message(Some(7), Some("cid-a"), "p@x.com", "yo", 1);

    assert_eq!(log.reconcile(first.clone()), ReconcileOutcome::Appended { index: 0 });
    let snapshot = log.messages().to_vec();

    let outcome = log.reconcile(first);
    assert_eq!(
        outcome,
        ReconcileOutcome::Duplicate {
            index: 0,
            advanced: false
        }
    );
    assert!(!outcome.changed_log());
    assert_eq!(log.messages(), snapshot.as_slice());
}

#[test]
fn either_key_identifies_a_message() {
    let mut log = open_log();
    log.reconcile(server_message(Some(9), None, "p@x.com", "a", 1));
    log.reconcile(server_message(None, Some("cid-b"), "p@x.com", "b", 2));

    // Same server id, now with a correlation id attached.
    log.reconcile(server_message(Some(9), Some("cid-a"), "p@x.com", "a", 1));
    // Same correlation id, now with a server id attached.
    log.reconcile(server_message(Some(10), Some("cid-b"), "p@x.com", "b", 2));

    assert_eq!(log.len(), 2);
    assert_eq!(
        log.by_correlation(&CorrelationId::new("cid-a")).and_then(|m| m.server_id),
        Some(ServerMessageId(9))
    );
    assert_eq!(
        log.by_server_id(ServerMessageId(10)).map(|m| m.text.as_str()),
        Some("b")
    );
    assert_unique_keys(&log);
}

#[test]
fn interleaved_realtime_and_polling_never_duplicate_keys() {
    let mut log = open_log();
    let mut sent = Vec::new();
    for text in ["one", "two", "three"] {
        sent.push(log.push_pending(text).expect("pending"));
    }

    let mut deliveries = Vec::new();
    for (offset, message) in sent.iter().enumerate() {
        let server_id = 100 + offset as i64;
        let cid = message.correlation_id.as_ref().map(|c| c.as_str().to_string());
        // realtime echo carries both keys
        deliveries.push(server_message(
            Some(server_id),
            cid.as_deref(),
            "me@x.com",
            &message.text,
            offset as i64,
        ));
        // polling may only know the server id
        deliveries.push(server_message(
            Some(server_id),
            None,
            "me@x.com",
            &message.text,
            offset as i64,
        ));
    }
    deliveries.push(server_message(Some(200), None, "p@x.com", "reply", 10));
    deliveries.push(server_message(Some(200), Some("cid-remote"), "p@x.com", "reply", 10));

    for order in [deliveries.clone(), deliveries.iter().rev().cloned().collect()] {
        let mut log_copy = MessageLog::new(me());
        log_copy.reset(Some(peer_scope()));
        for message in &sent {
            log_copy.push_indexed(message.clone());
        }
        for delivery in order.iter().chain(order.iter()) {
            log_copy.reconcile(delivery.clone());
            assert_unique_keys(&log_copy);
        }
        assert_eq!(log_copy.len(), 4);
    }

    for delivery in &deliveries {
        log.reconcile(delivery.clone());
    }
    assert_eq!(log.len(), 4);
    assert!(log
        .messages()
        .iter()
        .all(|message| message.read_state == ReadState::Delivered));
}

#[test]
fn polled_copy_before_echo_absorbs_the_pending_entry() {
    let mut log = open_log();
    log.reconcile(server_message(Some(1), None, "p@x.com", "hello", 0));
    let pending = log.push_pending("hi").expect("pending");
    let cid = pending.correlation_id.clone().expect("cid");

    let polled = log.reconcile(server_message(Some(9), None, "me@x.com", "hi", 5));
    assert_eq!(polled, ReconcileOutcome::Appended { index: 2 });
    assert_eq!(log.len(), 3);

    let echo = server_message(Some(9), Some(cid.as_str()), "me@x.com", "hi", 5);
    assert_eq!(
        log.reconcile(echo.clone()),
        ReconcileOutcome::Confirmed { index: 1 }
    );
    assert_eq!(log.len(), 2);
    let merged = log.by_correlation(&cid).expect("merged entry");
    assert_eq!(merged.server_id, Some(ServerMessageId(9)));
    assert_eq!(merged.read_state, ReadState::Delivered);
    assert_eq!(log.by_server_id(ServerMessageId(1)).map(|m| m.text.as_str()), Some("hello"));
    assert_unique_keys(&log);

    assert!(!log.reconcile(echo).changed_log());
    assert_eq!(log.len(), 2);
}

#[test]
fn rejects_empty_text_and_unaddressable_scope() {
    let mut log = open_log();
    assert!(matches!(log.push_pending("   "), Err(ChatError::EmptyMessage)));

    let mut closed = MessageLog::new(me());
    assert!(matches!(closed.push_pending("hi"), Err(ChatError::Addressing(_))));

    closed.reset(Some(ConversationScope::Group(GroupId::new(""))));
    assert!(matches!(closed.push_pending("hi"), Err(ChatError::Addressing(_))));
    assert!(closed.is_empty());
}

#[test]
fn read_receipts_only_touch_own_messages_and_never_regress() {
    let mut log = open_log();
    log.reconcile(server_message(Some(1), None, "me@x.com", "mine", 1));
    log.reconcile(server_message(Some(2), None, "p@x.com", "theirs", 2));

    let receipt: HashSet<_> = [ServerMessageId(1), ServerMessageId(2), ServerMessageId(3)]
        .into_iter()
        .collect();
    assert_eq!(log.apply_read_receipt(&receipt), 1);
    assert_eq!(log.messages()[0].read_state, ReadState::Read);
    assert_eq!(log.messages()[1].read_state, ReadState::Delivered);

    // A later delivery of the same message does not pull it back.
    let outcome = log.reconcile(server_message(Some(1), None, "me@x.com", "mine", 1));
    assert!(!outcome.changed_log());
    assert_eq!(log.messages()[0].read_state, ReadState::Read);
    assert_eq!(log.apply_read_receipt(&receipt), 0);
}

#[test]
fn polled_read_flag_advances_known_messages() {
    let mut log = open_log();
    log.reconcile(server_message(Some(1), None, "me@x.com", "mine", 1));

    let mut polled = server_message(Some(1), None, "me@x.com", "mine", 1);
    polled.read_state = ReadState::Read;
    assert_eq!(
        log.reconcile(polled),
        ReconcileOutcome::Duplicate {
            index: 0,
            advanced: true
        }
    );
    assert_eq!(log.messages()[0].read_state, ReadState::Read);
}

#[test]
fn history_load_sorts_and_keeps_unconfirmed_local_entries() {
    let mut log = open_log();
    let pending = log.push_pending("draft").expect("pending");
    let confirmed = log.push_pending("confirmed").expect("pending");

    let mut echoed = server_message(Some(3), None, "me@x.com", "confirmed", 2);
    echoed.correlation_id = confirmed.correlation_id.clone();

    let loaded = log.load_history(
        &peer_scope(),
        vec![
            echoed,
            server_message(Some(1), None, "p@x.com", "first", 0),
            server_message(Some(2), None, "p@x.com", "second", 1),
        ],
    );
    assert!(loaded);

    let texts: Vec<&str> = log.messages().iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "confirmed", "draft"]);
    assert_eq!(
        log.by_correlation(pending.correlation_id.as_ref().expect("cid"))
            .map(|m| m.read_state),
        Some(ReadState::Pending)
    );
    assert_unique_keys(&log);
}

#[test]
fn stale_history_for_previous_scope_is_discarded() {
    let mut log = MessageLog::new(me());
    let group = ConversationScope::Group(GroupId::new("g1"));
    log.reset(Some(group.clone()));
    log.reset(Some(peer_scope()));
    log.reconcile(server_message(Some(5), None, "p@x.com", "current", 0));

    let mut stale = server_message(Some(1), None, "q@x.com", "old group", 0);
    stale.scope = group.clone();
    assert!(!log.load_history(&group, vec![stale.clone()]));
    assert_eq!(log.reconcile(stale), ReconcileOutcome::OutOfScope);

    assert_eq!(log.len(), 1);
    assert_eq!(log.messages()[0].text, "current");
}

#[test]
fn failures_are_annotated_and_cleared_for_resend() {
    let mut log = open_log();
    let pending = log.push_pending("hello").expect("pending");
    let cid = pending.correlation_id.clone().expect("cid");

    assert!(log.mark_failed(&cid, "http status 500"));
    assert_eq!(log.len(), 1);
    assert!(log.messages()[0].is_failed());

    let retry = log.take_failed(&cid).expect("failed entry");
    assert_eq!(retry.text, "hello");
    assert!(log.take_failed(&cid).is_none());

    assert!(log.acknowledge(&cid, Some(ServerMessageId(77))));
    let entry = log.by_correlation(&cid).expect("entry");
    assert_eq!(entry.read_state, ReadState::Sent);
    assert_eq!(entry.server_id, Some(ServerMessageId(77)));
    assert!(!log.mark_failed(&CorrelationId::new("cid-unknown"), "x"));
}
