//! End-to-end scenarios driven through the hub without a network.

use chatwire_core::{CallError, CallState, ConnectionId, Hub, HubConfig, ServerEvent};
use chatwire_protocol::{CallType, EventKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Rx = mpsc::Receiver<Arc<ServerEvent>>;

fn connect(hub: &Hub, user: &str) -> (ConnectionId, Rx) {
    let (outbox, rx) = hub.open_outbox();
    let id = hub.on_connect(outbox, Some(user)).unwrap();
    (id, rx)
}

/// Drain a receiver, ignoring presence traffic.
fn kinds(rx: &mut Rx) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if !matches!(event.kind, EventKind::UserOnline | EventKind::UserOffline) {
            kinds.push(event.kind);
        }
    }
    kinds
}

#[tokio::test]
async fn test_two_device_caller_sees_one_accept_each() {
    let hub = Hub::default();
    let (c1, mut c1_rx) = connect(&hub, "A");
    let (_c2, mut c2_rx) = connect(&hub, "A");
    let (c3, mut c3_rx) = connect(&hub, "B");

    let call_id = hub.initiate_call(&c1, "B", CallType::Audio).unwrap();
    assert_eq!(hub.calls().state_of(&call_id), Some(CallState::Ringing));
    assert_eq!(kinds(&mut c3_rx), vec![EventKind::IncomingCall]);

    hub.accept_call(&c3, &call_id).unwrap();
    assert_eq!(hub.calls().state_of(&call_id), Some(CallState::Active));
    assert_eq!(kinds(&mut c1_rx), vec![EventKind::CallAccepted]);
    assert_eq!(kinds(&mut c2_rx), vec![EventKind::CallAccepted]);
}

#[test]
fn test_room_message_reaches_members_only() {
    let hub = Hub::default();
    let (c1, mut a_rx) = connect(&hub, "A");
    let (b, mut b_rx) = connect(&hub, "B");
    let (_c, mut c_rx) = connect(&hub, "C");
    hub.join_room(&c1, "R1").unwrap();

    hub.publish_room_event(&b, "R1", EventKind::ReceiveMessage, json!({"text": "hi"}))
        .unwrap();

    assert_eq!(kinds(&mut a_rx), vec![EventKind::ReceiveMessage]);
    assert!(kinds(&mut b_rx).is_empty());
    assert!(kinds(&mut c_rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_is_missed_and_late_accept_rejected() {
    let hub = Hub::new(HubConfig {
        ring_timeout: Duration::from_secs(45),
        ..HubConfig::default()
    });
    let (a, mut a_rx) = connect(&hub, "A");
    let (b, mut b_rx) = connect(&hub, "B");
    let mut records = hub.calls().subscribe_records();

    let call_id = hub.initiate_call(&a, "B", CallType::Video).unwrap();
    kinds(&mut b_rx);

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert_eq!(kinds(&mut a_rx), vec![EventKind::CallMissed]);
    assert!(kinds(&mut b_rx).is_empty());
    assert_eq!(records.try_recv().unwrap().state, CallState::Missed);

    assert!(matches!(
        hub.accept_call(&b, &call_id),
        Err(CallError::CallClosed(_))
    ));
    assert!(kinds(&mut a_rx).is_empty());
}

#[test]
fn test_double_unregister_emits_one_offline() {
    let hub = Hub::default();
    let mut changes = hub.presence().subscribe();
    let (c1, _rx) = connect(&hub, "A");

    assert!(hub.on_disconnect(&c1));
    assert!(!hub.on_disconnect(&c1));
    assert!(hub.registry().unregister(&c1).is_none());

    assert!(changes.try_recv().unwrap().online);
    assert!(!changes.try_recv().unwrap().online);
    assert!(changes.try_recv().is_err());
}

#[test]
fn test_three_connects_three_disconnects_one_edge_each_way() {
    let hub = Hub::default();
    let mut changes = hub.presence().subscribe();
    let (_watcher, mut watcher_rx) = connect(&hub, "W");
    changes.try_recv().unwrap();
    while watcher_rx.try_recv().is_ok() {}

    let devices: Vec<_> = (0..3).map(|_| connect(&hub, "A")).collect();
    for (id, _) in &devices {
        hub.on_disconnect(id);
    }

    let edges: Vec<bool> = std::iter::from_fn(|| changes.try_recv().ok())
        .map(|c| c.online)
        .collect();
    assert_eq!(edges, vec![true, false]);

    let presence: Vec<EventKind> = std::iter::from_fn(|| watcher_rx.try_recv().ok())
        .map(|e| e.kind)
        .collect();
    assert_eq!(presence, vec![EventKind::UserOnline, EventKind::UserOffline]);
}

#[test]
fn test_concurrent_accept_from_two_devices_has_one_winner() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let _guard = runtime.enter();

    for _ in 0..25 {
        let hub = Arc::new(Hub::default());
        let (a, mut a_rx) = connect(&hub, "A");
        let (b1, _b1_rx) = connect(&hub, "B");
        let (b2, _b2_rx) = connect(&hub, "B");
        let call_id = hub.initiate_call(&a, "B", CallType::Audio).unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let results: Vec<_> = [b1, b2]
            .into_iter()
            .map(|conn| {
                let hub = Arc::clone(&hub);
                let barrier = Arc::clone(&barrier);
                let call_id = call_id.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    hub.accept_call(&conn, &call_id)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(CallError::AlreadyAcceptedElsewhere(_)))));
        assert_eq!(kinds(&mut a_rx), vec![EventKind::CallAccepted]);
    }
}

#[test]
fn test_disconnect_racing_joins_leaves_no_stale_membership() {
    let hub = Arc::new(Hub::default());

    for round in 0..50 {
        let (id, _rx) = connect(&hub, "A");
        let joiner = {
            let hub = Arc::clone(&hub);
            let id = id.clone();
            std::thread::spawn(move || {
                for r in 0..20 {
                    let _ = hub.join_room(&id, &format!("room-{}-{}", round, r));
                }
            })
        };
        hub.on_disconnect(&id);
        joiner.join().unwrap();

        assert!(!hub.registry().contains(&id));
        assert_eq!(hub.rooms().total_memberships(), 0);
    }
}
