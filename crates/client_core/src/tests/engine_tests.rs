use super::*;
use chrono::TimeZone;
use tokio::sync::oneshot::error::TryRecvError;

const CHAT: &str = "c1";
const ME: &str = "me";

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().expect("timestamp")
}

fn message(id: &str, seconds: i64) -> Message {
    Message {
        id: MessageId::from(id),
        chat_id: ChatId::from(CHAT),
        sender_id: UserId::from("peer"),
        send_time: at(seconds),
        content: MessageContent::text(format!("message {id}")),
        quote_id: None,
        edited_version: 0,
        state: MessageState::Active,
    }
}

fn numbered(ids: std::ops::RangeInclusive<i64>) -> Vec<Message> {
    // Server pages are newest first.
    ids.rev()
        .map(|n| message(&format!("{n:02}"), n * 10))
        .collect()
}

fn new_engine(page_size: u32) -> (ReconciliationEngine, Arc<PendingOperationStore>) {
    let pending = Arc::new(PendingOperationStore::new());
    let engine = ReconciliationEngine::new(
        ChatId::from(CHAT),
        Some(UserId::from(ME)),
        EngineSettings {
            page_size,
            fingerprint_window: chrono::Duration::seconds(120),
        },
        Arc::clone(&pending),
    );
    (engine, pending)
}

fn fetch_request(step: &Step) -> Option<HistoryRequest> {
    step.effects.iter().find_map(|effect| match effect {
        Effect::FetchHistory(request) => Some(request.clone()),
        _ => None,
    })
}

fn deliver(engine: &mut ReconciliationEngine, request: HistoryRequest, page: Vec<Message>) -> Step {
    engine.apply(EngineInput::HistoryPage {
        request,
        result: Ok(page),
    })
}

/// Starts the engine and completes its initial fetch with `page`.
fn opened(page_size: u32, page: Vec<Message>) -> (ReconciliationEngine, Arc<PendingOperationStore>) {
    let (mut engine, pending) = new_engine(page_size);
    let start = engine.start();
    let request = fetch_request(&start).expect("initial fetch");
    deliver(&mut engine, request, page);
    (engine, pending)
}

fn live(engine: &mut ReconciliationEngine) {
    engine.apply(EngineInput::Stream(StreamEvent::Connected));
    assert_eq!(engine.status(), SessionStatus::Live);
}

fn stream(engine: &mut ReconciliationEngine, event: StreamEvent) -> Step {
    engine.apply(EngineInput::Stream(event))
}

fn ids(engine: &ReconciliationEngine) -> Vec<String> {
    engine
        .snapshot()
        .into_iter()
        .map(|entry| entry.message.id.to_string())
        .collect()
}

fn submit(
    engine: &mut ReconciliationEngine,
    pending: &PendingOperationStore,
    payload: OperationPayload,
) -> (LocalId, Step) {
    let operation = PendingOperation::new(ChatId::from(CHAT), payload);
    let local_id = pending.submit(operation.clone()).expect("submit");
    (local_id, engine.submit(operation))
}

fn send_text(text: &str) -> OperationPayload {
    OperationPayload::Send {
        content: MessageContent::text(text),
        quote_id: None,
    }
}

fn own_echo(id: &str, text: &str) -> Message {
    Message {
        sender_id: UserId::from(ME),
        send_time: Utc::now(),
        content: MessageContent::text(text),
        ..message(id, 0)
    }
}

fn acked(engine: &mut ReconciliationEngine, local_id: &LocalId, ack: OperationAck) -> Step {
    engine.apply(EngineInput::OperationResult {
        local_id: local_id.clone(),
        result: Ok(ack),
    })
}

fn notices(step: &Step) -> Vec<SessionNotice> {
    step.diffs
        .iter()
        .filter_map(|diff| match diff {
            LogDiff::Notice(notice) => Some(notice.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn concrete_history_live_edit_recall_scenario() {
    let (mut engine, _) = new_engine(2);
    let start = engine.start();
    let request = fetch_request(&start).expect("initial fetch");
    assert_eq!(
        request,
        HistoryRequest {
            kind: PageKind::Initial,
            before: None,
            count: 2,
        }
    );

    let step = deliver(&mut engine, request, vec![message("5", 100), message("4", 90)]);
    assert_eq!(ids(&engine), ["4", "5"]);
    assert_eq!(step.diffs.len(), 2);

    let (reply, mut result) = oneshot::channel();
    let step = engine.load_more(reply);
    let request = fetch_request(&step).expect("older fetch");
    assert_eq!(request.kind, PageKind::Older);
    assert_eq!(request.before, Some(Cursor(MessageId::from("4"))));

    deliver(&mut engine, request, vec![message("3", 80), message("2", 70)]);
    assert_eq!(result.try_recv(), Ok(Ok(2)));
    assert_eq!(ids(&engine), ["2", "3", "4", "5"]);

    let step = stream(&mut engine, StreamEvent::NewMessage(message("6", 110)));
    assert!(matches!(step.diffs.as_slice(), [LogDiff::Insert { index: 4, .. }]));
    assert_eq!(ids(&engine), ["2", "3", "4", "5", "6"]);

    let step = stream(
        &mut engine,
        StreamEvent::Edited {
            id: MessageId::from("4"),
            content: MessageContent::text("new text"),
            version: 1,
        },
    );
    match step.diffs.as_slice() {
        [LogDiff::Replace {
            previous,
            index,
            entry,
        }] => {
            assert_eq!(*previous, EntryKey::Server(MessageId::from("4")));
            assert_eq!(*index, 2);
            assert_eq!(entry.message.content, MessageContent::text("new text"));
            assert_eq!(entry.message.state, MessageState::Edited);
        }
        other => panic!("unexpected diffs {other:?}"),
    }
    assert_eq!(ids(&engine), ["2", "3", "4", "5", "6"]);

    let step = stream(&mut engine, StreamEvent::Recalled(MessageId::from("5")));
    assert_eq!(
        step.diffs,
        vec![LogDiff::MarkState {
            key: EntryKey::Server(MessageId::from("5")),
            index: 3,
            state: MessageState::Recalled,
        }]
    );
    assert_eq!(ids(&engine), ["2", "3", "4", "5", "6"]);
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let (mut engine, _) = opened(20, numbered(1..=3));
    let before = engine.snapshot();

    let step = stream(&mut engine, StreamEvent::NewMessage(message("02", 20)));
    assert!(step.diffs.is_empty());

    let once = stream(&mut engine, StreamEvent::NewMessage(message("09", 90)));
    let after_once = engine.snapshot();
    let twice = stream(&mut engine, StreamEvent::NewMessage(message("09", 90)));
    assert_eq!(once.diffs.len(), 1);
    assert!(twice.diffs.is_empty());
    assert_eq!(engine.snapshot(), after_once);
    assert_eq!(after_once.len(), before.len() + 1);
}

#[test]
fn ties_on_send_time_are_broken_by_id() {
    let (mut engine, _) = opened(20, vec![]);
    for (id, t) in [("b", 50), ("c", 40), ("a", 50), ("d", 60), ("0", 40)] {
        stream(&mut engine, StreamEvent::NewMessage(message(id, t)));
    }
    assert_eq!(ids(&engine), ["0", "c", "a", "b", "d"]);

    let snapshot = engine.snapshot();
    for pair in snapshot.windows(2) {
        assert!(pair[0].order_key() < pair[1].order_key());
    }
}

#[test]
fn older_edit_versions_never_win() {
    let (mut engine, _) = opened(20, numbered(1..=1));
    let id = MessageId::from("01");
    stream(
        &mut engine,
        StreamEvent::Edited {
            id: id.clone(),
            content: MessageContent::text("second"),
            version: 2,
        },
    );
    let step = stream(
        &mut engine,
        StreamEvent::Edited {
            id: id.clone(),
            content: MessageContent::text("first"),
            version: 1,
        },
    );
    assert!(step.diffs.is_empty());

    let entry = engine.entry(&EntryKey::Server(id)).expect("entry");
    assert_eq!(entry.message.content, MessageContent::text("second"));
    assert_eq!(entry.message.edited_version, 2);
}

#[test]
fn recall_is_terminal() {
    let (mut engine, _) = opened(20, numbered(1..=1));
    let id = MessageId::from("01");
    stream(&mut engine, StreamEvent::Recalled(id.clone()));
    let again = stream(&mut engine, StreamEvent::Recalled(id.clone()));
    let edit = stream(
        &mut engine,
        StreamEvent::Edited {
            id: id.clone(),
            content: MessageContent::text("too late"),
            version: 9,
        },
    );
    let chunk = stream(
        &mut engine,
        StreamEvent::Chunk {
            id: id.clone(),
            delta: "more".into(),
        },
    );
    assert!(again.diffs.is_empty());
    assert!(edit.diffs.is_empty());
    assert!(chunk.diffs.is_empty());

    let entry = engine.entry(&EntryKey::Server(id)).expect("entry");
    assert_eq!(entry.message.state, MessageState::Recalled);
    assert_eq!(entry.message.content, MessageContent::text("message 01"));
}

#[test]
fn reconnect_refreshes_newest_page_and_closes_the_gap() {
    let (mut engine, _) = opened(20, numbered(1..=10));
    live(&mut engine);

    let step = stream(
        &mut engine,
        StreamEvent::Disconnected(DisconnectReason::Transport("reset".into())),
    );
    assert_eq!(step.diffs, vec![LogDiff::Status(SessionStatus::Reconnecting)]);
    assert!(fetch_request(&step).is_none());

    let step = stream(&mut engine, StreamEvent::Connected);
    let request = fetch_request(&step).expect("refresh");
    assert_eq!(request.kind, PageKind::Refresh);
    assert_eq!(request.before, None);
    deliver(&mut engine, request, numbered(6..=15));

    let mut scrambled = numbered(1..=15);
    scrambled.swap(0, 9);
    scrambled.swap(3, 12);
    let (reference, _) = opened(20, scrambled);
    assert_eq!(engine.snapshot(), reference.snapshot());
    assert_eq!(engine.snapshot().len(), 15);
}

#[test]
fn refresh_does_not_move_the_pagination_cursor_forward() {
    let (mut engine, _) = opened(3, numbered(4..=6));
    live(&mut engine);
    stream(
        &mut engine,
        StreamEvent::Disconnected(DisconnectReason::Closed),
    );
    let step = stream(&mut engine, StreamEvent::Connected);
    deliver(&mut engine, fetch_request(&step).expect("refresh"), numbered(6..=8));

    let cursor = engine.cursor().expect("cursor");
    assert_eq!(cursor.before, Cursor(MessageId::from("04")));
}

#[tokio::test]
async fn send_echo_replaces_the_provisional_entry() {
    let (mut engine, pending) = opened(20, numbered(1..=2));
    live(&mut engine);

    let (local_id, step) = submit(&mut engine, &pending, send_text("hello"));
    match step.diffs.as_slice() {
        [LogDiff::Insert { index: 2, entry }] => {
            assert_eq!(entry.key, EntryKey::Local(local_id.clone()));
            assert_eq!(entry.delivery, Delivery::Pending);
        }
        other => panic!("unexpected diffs {other:?}"),
    }
    assert!(matches!(step.effects.as_slice(), [Effect::Submit(op)] if op.local_id == local_id));

    let step = stream(&mut engine, StreamEvent::NewMessage(own_echo("77", "hello")));
    match step.diffs.as_slice() {
        [LogDiff::Replace {
            previous, entry, ..
        }] => {
            assert_eq!(*previous, EntryKey::Local(local_id.clone()));
            assert_eq!(entry.key, EntryKey::Server(MessageId::from("77")));
            assert_eq!(entry.delivery, Delivery::Confirmed);
        }
        other => panic!("unexpected diffs {other:?}"),
    }

    let hellos = engine
        .snapshot()
        .into_iter()
        .filter(|entry| entry.message.content == MessageContent::text("hello"))
        .count();
    assert_eq!(hellos, 1);

    let step = acked(
        &mut engine,
        &local_id,
        OperationAck::Sent {
            message_id: Some(MessageId::from("77")),
        },
    );
    assert!(step.diffs.is_empty());
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Ok(OperationOutcome::Sent {
            message_id: MessageId::from("77")
        })
    );
}

#[tokio::test]
async fn ack_before_echo_matches_by_server_id() {
    let (mut engine, pending) = opened(20, vec![]);
    live(&mut engine);
    let (local_id, _) = submit(&mut engine, &pending, send_text("draft"));

    let step = acked(
        &mut engine,
        &local_id,
        OperationAck::Sent {
            message_id: Some(MessageId::from("88")),
        },
    );
    assert_eq!(fetch_request(&step).map(|r| r.kind), Some(PageKind::Refresh));

    // The server normalised the text, so only the id can match.
    let step = stream(&mut engine, StreamEvent::NewMessage(own_echo("88", "Draft")));
    assert!(matches!(step.diffs.as_slice(), [LogDiff::Replace { .. }]));
    assert_eq!(ids(&engine), ["88"]);
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Ok(OperationOutcome::Sent {
            message_id: MessageId::from("88")
        })
    );
}

#[test]
fn send_ack_without_live_feed_schedules_a_refresh() {
    let (mut engine, pending) = opened(20, vec![]);
    let (local_id, _) = submit(&mut engine, &pending, send_text("offline"));

    let step = acked(
        &mut engine,
        &local_id,
        OperationAck::Sent {
            message_id: Some(MessageId::from("5")),
        },
    );
    let request = fetch_request(&step).expect("refresh");
    assert_eq!(request.kind, PageKind::Refresh);

    deliver(&mut engine, request, vec![own_echo("5", "offline")]);
    assert_eq!(ids(&engine), ["5"]);
    assert!(pending.is_empty());
}

#[tokio::test]
async fn acked_send_is_recovered_from_history_when_the_feed_drops_the_echo() {
    let (mut engine, pending) = opened(20, vec![]);
    live(&mut engine);
    let (local_id, _) = submit(&mut engine, &pending, send_text("hello"));

    let step = acked(
        &mut engine,
        &local_id,
        OperationAck::Sent {
            message_id: Some(MessageId::from("99")),
        },
    );
    let request = fetch_request(&step).expect("refresh after ack");
    assert_eq!(request.kind, PageKind::Refresh);
    assert_eq!(
        engine.entry(&EntryKey::Local(local_id.clone())).map(|e| e.delivery),
        Some(Delivery::Pending)
    );

    let step = deliver(&mut engine, request, vec![own_echo("99", "hello")]);
    assert!(matches!(step.diffs.as_slice(), [LogDiff::Replace { .. }]));
    assert_eq!(ids(&engine), ["99"]);
    assert!(pending.is_empty());
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Ok(OperationOutcome::Sent {
            message_id: MessageId::from("99")
        })
    );
}

#[tokio::test]
async fn failed_send_stays_visible_and_can_be_retried_or_discarded() {
    let (mut engine, pending) = opened(20, vec![]);
    live(&mut engine);
    let (local_id, _) = submit(&mut engine, &pending, send_text("flaky"));

    let step = engine.apply(EngineInput::OperationResult {
        local_id: local_id.clone(),
        result: Err(SyncError::Network("timeout".into())),
    });
    assert!(step.diffs.contains(&LogDiff::Delivery {
        key: EntryKey::Local(local_id.clone()),
        index: 0,
        delivery: Delivery::Failed,
    }));
    assert!(matches!(
        notices(&step).as_slice(),
        [SessionNotice::OperationFailed { .. }]
    ));
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Err(SyncError::Network("timeout".into()))
    );
    assert_eq!(engine.snapshot().len(), 1);

    let step = engine.retry_send(&local_id).expect("retry");
    match step.diffs.as_slice() {
        [LogDiff::Remove { index: 0, .. }, LogDiff::Insert { index: 0, entry }] => {
            assert_eq!(entry.key, EntryKey::Local(local_id.clone()));
            assert_eq!(entry.delivery, Delivery::Pending);
        }
        other => panic!("unexpected diffs {other:?}"),
    }
    assert!(matches!(step.effects.as_slice(), [Effect::Submit(op)] if op.local_id == local_id));
    assert!(matches!(
        engine.discard_failed(&local_id),
        Err(SyncError::UnknownOperation(_))
    ));

    engine.apply(EngineInput::OperationResult {
        local_id: local_id.clone(),
        result: Err(SyncError::Network("timeout".into())),
    });
    let step = engine.discard_failed(&local_id).expect("discard");
    assert_eq!(
        step.diffs,
        vec![LogDiff::Remove {
            key: EntryKey::Local(local_id),
            index: 0,
        }]
    );
    assert!(engine.snapshot().is_empty());
}

#[tokio::test]
async fn edit_confirmation_without_version_bumps_by_one() {
    let (mut engine, pending) = opened(20, numbered(1..=1));
    live(&mut engine);
    let target = MessageId::from("01");
    let (local_id, step) = submit(
        &mut engine,
        &pending,
        OperationPayload::Edit {
            target_id: target.clone(),
            content: MessageContent::text("fixed"),
        },
    );
    assert!(matches!(step.effects.as_slice(), [Effect::Submit(_)]));

    let step = acked(&mut engine, &local_id, OperationAck::Edited { edited_version: None });
    assert!(matches!(step.diffs.as_slice(), [LogDiff::Replace { .. }]));
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Ok(OperationOutcome::Edited {
            message_id: target.clone(),
            version: 1
        })
    );

    // The echo of our own edit is a no-op.
    let step = stream(
        &mut engine,
        StreamEvent::Edited {
            id: target,
            content: MessageContent::text("fixed"),
            version: 1,
        },
    );
    assert!(step.diffs.is_empty());
}

#[tokio::test]
async fn edit_of_message_recalled_elsewhere_is_stale() {
    let (mut engine, pending) = opened(20, numbered(1..=1));
    live(&mut engine);
    let target = MessageId::from("01");
    let (local_id, _) = submit(
        &mut engine,
        &pending,
        OperationPayload::Edit {
            target_id: target.clone(),
            content: MessageContent::text("late"),
        },
    );
    stream(&mut engine, StreamEvent::Recalled(target.clone()));

    let step = acked(&mut engine, &local_id, OperationAck::Edited { edited_version: Some(1) });
    assert_eq!(
        notices(&step),
        vec![SessionNotice::AlreadyHandled {
            local_id: local_id.clone(),
            target_id: target.clone(),
        }]
    );
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Err(SyncError::StaleOperation { target_id: target })
    );
}

#[tokio::test]
async fn recall_of_already_recalled_message_short_circuits() {
    let (mut engine, pending) = opened(20, numbered(1..=1));
    live(&mut engine);
    let target = MessageId::from("01");
    stream(&mut engine, StreamEvent::Recalled(target.clone()));

    let (local_id, step) = submit(
        &mut engine,
        &pending,
        OperationPayload::Recall {
            target_id: target.clone(),
        },
    );
    assert!(step.effects.is_empty());
    assert_eq!(notices(&step).len(), 1);
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Err(SyncError::StaleOperation { target_id: target })
    );
}

#[tokio::test]
async fn recall_echo_before_ack_still_confirms() {
    let (mut engine, pending) = opened(20, numbered(1..=1));
    live(&mut engine);
    let target = MessageId::from("01");
    let (local_id, _) = submit(
        &mut engine,
        &pending,
        OperationPayload::Recall {
            target_id: target.clone(),
        },
    );
    let step = stream(&mut engine, StreamEvent::Recalled(target.clone()));
    assert_eq!(step.diffs.len(), 1);

    let step = acked(&mut engine, &local_id, OperationAck::Recalled);
    assert!(step.diffs.is_empty());
    assert_eq!(
        pending.result_for(&local_id).expect("result").wait().await,
        Ok(OperationOutcome::Recalled { message_id: target })
    );
}

#[test]
fn server_conflict_surfaces_as_already_handled() {
    let (mut engine, pending) = opened(20, numbered(1..=1));
    let target = MessageId::from("01");
    let (local_id, _) = submit(
        &mut engine,
        &pending,
        OperationPayload::Recall {
            target_id: target.clone(),
        },
    );
    let step = engine.apply(EngineInput::OperationResult {
        local_id: local_id.clone(),
        result: Err(SyncError::Conflict {
            target_id: target.clone(),
        }),
    });
    assert_eq!(
        notices(&step),
        vec![SessionNotice::AlreadyHandled {
            local_id,
            target_id: target,
        }]
    );
}

#[test]
fn concurrent_load_more_calls_share_one_request() {
    let (mut engine, _) = opened(2, numbered(9..=10));
    let (first, mut first_rx) = oneshot::channel();
    let (second, mut second_rx) = oneshot::channel();

    let step = engine.load_more(first);
    let request = fetch_request(&step).expect("fetch");
    let step = engine.load_more(second);
    assert!(step.effects.is_empty());

    deliver(&mut engine, request, numbered(7..=8));
    assert_eq!(first_rx.try_recv(), Ok(Ok(2)));
    assert_eq!(second_rx.try_recv(), Ok(Ok(2)));
}

#[test]
fn load_more_queued_behind_initial_fetch() {
    let (mut engine, _) = new_engine(2);
    let start = engine.start();
    let (reply, mut rx) = oneshot::channel();
    let step = engine.load_more(reply);
    assert!(step.effects.is_empty());
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    let step = deliver(&mut engine, fetch_request(&start).expect("initial"), numbered(3..=4));
    let request = fetch_request(&step).expect("queued older fetch");
    assert_eq!(request.before, Some(Cursor(MessageId::from("03"))));
    deliver(&mut engine, request, numbered(1..=2));
    assert_eq!(rx.try_recv(), Ok(Ok(2)));
    assert_eq!(ids(&engine), ["01", "02", "03", "04"]);
}

#[test]
fn short_page_marks_history_exhausted() {
    let (mut engine, _) = opened(5, numbered(1..=3));
    assert!(engine.history_exhausted());

    let (reply, mut rx) = oneshot::channel();
    let step = engine.load_more(reply);
    assert!(step.effects.is_empty());
    assert_eq!(rx.try_recv(), Ok(Ok(0)));
}

#[test]
fn history_failure_degrades_until_reconnect() {
    let (mut engine, _) = new_engine(20);
    let start = engine.start();
    let step = engine.apply(EngineInput::HistoryPage {
        request: fetch_request(&start).expect("initial"),
        result: Err(SyncError::Network("unreachable".into())),
    });
    assert_eq!(step.diffs, vec![LogDiff::Status(SessionStatus::Degraded)]);
    assert_eq!(engine.write_block(), Some(SyncError::Degraded));

    let (reply, mut rx) = oneshot::channel();
    engine.load_more(reply);
    assert_eq!(rx.try_recv(), Ok(Err(SyncError::Degraded)));

    let step = stream(&mut engine, StreamEvent::Connected);
    assert!(step.diffs.contains(&LogDiff::Status(SessionStatus::Live)));
    assert_eq!(fetch_request(&step).map(|r| r.kind), Some(PageKind::Refresh));
    assert_eq!(engine.write_block(), None);
}

#[test]
fn rejected_older_page_fails_the_caller_without_degrading() {
    let (mut engine, _) = opened(2, numbered(4..=5));
    live(&mut engine);
    let (reply, mut rx) = oneshot::channel();
    let request = fetch_request(&engine.load_more(reply)).expect("older page");

    let step = engine.apply(EngineInput::HistoryPage {
        request,
        result: Err(SyncError::NotFound(MessageId::from("04"))),
    });
    assert!(step.diffs.is_empty());
    assert_eq!(rx.try_recv(), Ok(Err(SyncError::NotFound(MessageId::from("04")))));
    assert_eq!(engine.status(), SessionStatus::Live);
    assert_eq!(engine.write_block(), None);

    let (reply, _rx) = oneshot::channel();
    assert!(fetch_request(&engine.load_more(reply)).is_some());
}

#[test]
fn rejected_initial_page_leaves_status_alone_and_can_be_refreshed() {
    let (mut engine, _) = new_engine(20);
    let start = engine.start();
    let step = engine.apply(EngineInput::HistoryPage {
        request: fetch_request(&start).expect("initial"),
        result: Err(SyncError::Protocol("bad page".into())),
    });
    assert!(step.diffs.is_empty());
    assert_eq!(engine.status(), SessionStatus::Connecting);

    let request = fetch_request(&engine.refresh().expect("refresh")).expect("refresh request");
    deliver(&mut engine, request, numbered(1..=2));
    assert_eq!(ids(&engine), ["01", "02"]);
}

#[test]
fn refresh_recovers_degraded_history_while_the_feed_stays_up() {
    let (mut engine, _) = new_engine(20);
    let start = engine.start();
    live(&mut engine);
    let step = engine.apply(EngineInput::HistoryPage {
        request: fetch_request(&start).expect("initial"),
        result: Err(SyncError::Network("503".into())),
    });
    assert_eq!(step.diffs, vec![LogDiff::Status(SessionStatus::Degraded)]);

    let step = engine.refresh().expect("refresh allowed while degraded");
    let request = fetch_request(&step).expect("refresh request");
    assert_eq!(request.kind, PageKind::Refresh);

    let step = deliver(&mut engine, request, numbered(1..=2));
    assert!(step.diffs.contains(&LogDiff::Status(SessionStatus::Live)));
    assert_eq!(engine.write_block(), None);
    assert_eq!(ids(&engine), ["01", "02"]);

    let (reply, _rx) = oneshot::channel();
    let request = fetch_request(&engine.load_more(reply)).expect("older page");
    assert_eq!(request.before, Some(Cursor(MessageId::from("01"))));
}

#[test]
fn refresh_does_not_lift_degraded_while_the_feed_is_exhausted() {
    let (mut engine, _) = opened(20, vec![]);
    live(&mut engine);
    stream(
        &mut engine,
        StreamEvent::Disconnected(DisconnectReason::RetriesExhausted),
    );

    let request = fetch_request(&engine.refresh().expect("refresh")).expect("refresh request");
    let step = deliver(&mut engine, request, numbered(1..=1));
    assert_eq!(ids(&engine), ["01"]);
    assert!(!step.diffs.iter().any(|diff| matches!(diff, LogDiff::Status(_))));
    assert_eq!(engine.status(), SessionStatus::Degraded);
}

#[test]
fn refresh_is_refused_once_closed() {
    let (mut engine, _) = opened(20, vec![]);
    engine.close();
    assert_eq!(engine.refresh().map(|_| ()), Err(SyncError::Closed));
}

#[test]
fn exhausted_reconnects_degrade_the_session() {
    let (mut engine, _) = opened(20, vec![]);
    live(&mut engine);
    stream(
        &mut engine,
        StreamEvent::Disconnected(DisconnectReason::Transport("reset".into())),
    );
    let step = stream(
        &mut engine,
        StreamEvent::Disconnected(DisconnectReason::RetriesExhausted),
    );
    assert_eq!(step.diffs, vec![LogDiff::Status(SessionStatus::Degraded)]);

    // A plain transport drop does not lift the degraded flag.
    stream(
        &mut engine,
        StreamEvent::Disconnected(DisconnectReason::Transport("reset".into())),
    );
    assert_eq!(engine.status(), SessionStatus::Degraded);
}

#[test]
fn auth_failure_is_reported_once() {
    let (mut engine, _) = new_engine(20);
    let start = engine.start();
    let step = engine.apply(EngineInput::HistoryPage {
        request: fetch_request(&start).expect("initial"),
        result: Err(SyncError::Auth("expired".into())),
    });
    assert!(step.diffs.contains(&LogDiff::Status(SessionStatus::AuthRequired)));
    assert_eq!(
        step.effects,
        vec![Effect::AuthFailure(SyncError::Auth("expired".into()))]
    );

    let step = stream(
        &mut engine,
        StreamEvent::Disconnected(DisconnectReason::Unauthorized("401".into())),
    );
    assert!(step.effects.is_empty());
    assert!(engine.write_block().is_some_and(|err| err.is_auth()));
}

#[test]
fn redelivered_history_applies_newer_versions_and_recalls() {
    let (mut engine, _) = opened(20, numbered(1..=2));
    live(&mut engine);
    stream(&mut engine, StreamEvent::Disconnected(DisconnectReason::Closed));
    let step = stream(&mut engine, StreamEvent::Connected);

    let mut edited = message("02", 20);
    edited.edited_version = 3;
    edited.state = MessageState::Edited;
    edited.content = MessageContent::text("edited offline");
    let mut recalled = message("01", 10);
    recalled.state = MessageState::Recalled;

    let step = deliver(&mut engine, fetch_request(&step).expect("refresh"), vec![edited, recalled]);
    assert_eq!(step.diffs.len(), 2);
    let snapshot = engine.snapshot();
    assert_eq!(snapshot[0].message.state, MessageState::Recalled);
    assert_eq!(snapshot[1].message.content, MessageContent::text("edited offline"));
    assert_eq!(snapshot[1].message.edited_version, 3);
}

#[test]
fn chunks_append_to_streaming_replies() {
    let (mut engine, _) = opened(20, vec![]);
    let mut reply = message("bot-1", 10);
    reply.content = MessageContent::Markdown { text: "Hel".into() };
    stream(&mut engine, StreamEvent::NewMessage(reply));

    let step = stream(
        &mut engine,
        StreamEvent::Chunk {
            id: MessageId::from("bot-1"),
            delta: "lo".into(),
        },
    );
    assert!(matches!(step.diffs.as_slice(), [LogDiff::Replace { index: 0, .. }]));
    let entry = engine
        .entry(&EntryKey::Server(MessageId::from("bot-1")))
        .expect("entry");
    assert_eq!(entry.message.content, MessageContent::Markdown { text: "Hello".into() });
    assert_eq!(entry.message.edited_version, 0);
}

#[test]
fn messages_for_other_chats_are_ignored() {
    let (mut engine, _) = opened(20, vec![]);
    let mut foreign = message("1", 10);
    foreign.chat_id = ChatId::from("elsewhere");
    let step = stream(&mut engine, StreamEvent::NewMessage(foreign));
    assert!(step.diffs.is_empty());
    assert!(engine.snapshot().is_empty());
}

#[test]
fn unread_count_skips_own_and_provisional_entries() {
    let (mut engine, pending) = opened(20, numbered(1..=4));
    let mut own = message("05", 50);
    own.sender_id = UserId::from(ME);
    stream(&mut engine, StreamEvent::NewMessage(own));
    submit(&mut engine, &pending, send_text("unsent"));

    assert_eq!(engine.unread_count(None), None);
    let marker = engine
        .read_position_for(&MessageId::from("02"))
        .expect("marker");
    assert_eq!(engine.unread_count(Some(&marker)), Some(2));
    assert_eq!(
        engine.latest_read_position().map(|p| p.last_read_message_id),
        Some(MessageId::from("05"))
    );
    assert!(matches!(
        engine.read_position_for(&MessageId::from("missing")),
        Err(SyncError::NotFound(_))
    ));
}

#[test]
fn close_fails_waiters_and_ignores_later_input() {
    let (mut engine, _) = opened(2, numbered(3..=4));
    let (reply, mut rx) = oneshot::channel();
    engine.load_more(reply);

    let step = engine.close();
    assert_eq!(step.diffs, vec![LogDiff::Status(SessionStatus::Closed)]);
    assert_eq!(rx.try_recv(), Ok(Err(SyncError::Closed)));

    let step = stream(&mut engine, StreamEvent::NewMessage(message("9", 90)));
    assert!(step.diffs.is_empty());
}
