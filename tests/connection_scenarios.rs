//! End-to-end behaviour of a live connection against the in-process broker.

mod common;

use common::{
    QueueBehaviour, handshake, next_frame, send_frame, spawn_broker, spawn_queue_broker,
    test_config,
};
use futures::StreamExt;
use std::time::Duration;
use stomp_vu::{
    AckMode, Connection, ConnectionState, Frame, SendOptions, StompError, StompItem,
    SubscribeOptions,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

// ============================================================================
// Send, subscribe, ack
// ============================================================================

#[tokio::test]
async fn send_read_ack_unsubscribe() {
    let (addr, log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let config = test_config(&addr).heartbeat(Duration::from_secs(30), Duration::from_secs(30));
    let conn = Connection::connect(config).await.unwrap();

    let sub = conn
        .subscribe("/queue/a", SubscribeOptions::from(AckMode::Client).receipt(true))
        .await
        .unwrap();
    conn.send("/queue/a", "text/plain", "hello", SendOptions::new().receipt(true))
        .await
        .unwrap();

    let msg = sub.read(WAIT).await.unwrap();
    assert_eq!(msg.text().unwrap(), "hello");
    assert_eq!(msg.content_type(), Some("text/plain"));
    assert_eq!(msg.destination(), Some("/queue/a"));
    assert_eq!(msg.subscription(), sub.id());
    assert_eq!(msg.ack_mode(), AckMode::Client);

    conn.ack(&msg).await.unwrap();
    sub.unsubscribe().await.unwrap();
    assert!(!sub.is_active());

    let err = sub.read(Some(Duration::from_millis(100))).await.unwrap_err();
    assert!(matches!(err, StompError::Unsubscribed(ref id) if id == sub.id()));

    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let log = log.lock().unwrap();
    assert_eq!(log.acked, vec![msg.ack_id().to_string()]);
    let commands: Vec<&str> = log.frames.iter().map(|f| f.command.as_str()).collect();
    assert_eq!(
        commands,
        ["SUBSCRIBE", "SEND", "ACK", "UNSUBSCRIBE", "DISCONNECT"]
    );
}

#[tokio::test]
async fn client_individual_ack_leaves_earlier_messages_outstanding() {
    let (addr, log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    let sub = conn
        .subscribe("/queue/b", AckMode::ClientIndividual)
        .await
        .unwrap();

    for body in ["one", "two", "three"] {
        conn.send("/queue/b", "text/plain", body, SendOptions::new())
            .await
            .unwrap();
    }
    let m1 = sub.read(WAIT).await.unwrap();
    let m2 = sub.read(WAIT).await.unwrap();
    let m3 = sub.read(WAIT).await.unwrap();
    assert_eq!(m2.text().unwrap(), "two");

    conn.ack(&m2).await.unwrap();
    let outstanding = conn.outstanding(sub.id()).await.unwrap();
    assert_eq!(
        outstanding,
        vec![m1.message_id().to_string(), m3.message_id().to_string()]
    );

    conn.nack(&m1).await.unwrap();
    conn.disconnect().await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.acked, vec![m2.ack_id().to_string()]);
    assert_eq!(log.nacked, vec![m1.ack_id().to_string()]);
}

#[tokio::test]
async fn client_ack_is_cumulative() {
    let (addr, log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    let sub = conn.subscribe("/queue/c", AckMode::Client).await.unwrap();

    for body in ["one", "two", "three"] {
        conn.send("/queue/c", "", body, SendOptions::new())
            .await
            .unwrap();
    }
    let m1 = sub.read(WAIT).await.unwrap();
    let m2 = sub.read(WAIT).await.unwrap();
    let m3 = sub.read(WAIT).await.unwrap();
    assert_eq!(m1.content_type(), None);

    conn.ack(&m2).await.unwrap();
    assert_eq!(
        conn.outstanding(sub.id()).await.unwrap(),
        vec![m3.message_id().to_string()]
    );
    // already settled by the cumulative ack
    assert!(matches!(conn.ack(&m1).await, Err(StompError::AckMode(_))));
    conn.disconnect().await.unwrap();

    assert_eq!(log.lock().unwrap().acked.len(), 1);
}

#[tokio::test]
async fn ack_on_auto_subscription_is_rejected() {
    let (addr, log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    let sub = conn.subscribe("/queue/d", AckMode::Auto).await.unwrap();
    conn.send("/queue/d", "application/json", r#"{"n":1}"#, SendOptions::new())
        .await
        .unwrap();

    let msg = sub.read(WAIT).await.unwrap();
    assert_eq!(msg.json().unwrap()["n"], 1);
    assert!(matches!(conn.ack(&msg).await, Err(StompError::AckMode(_))));
    conn.disconnect().await.unwrap();
    assert!(log.lock().unwrap().acked.is_empty());
}

#[tokio::test]
async fn read_times_out_without_affecting_subscription() {
    let (addr, _log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    let sub = conn.subscribe("/queue/e", AckMode::Auto).await.unwrap();

    let err = sub
        .read(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::ReadTimeout(_)));
    assert!(sub.is_active());

    conn.send("/queue/e", "text/plain", "late", SendOptions::new())
        .await
        .unwrap();
    assert_eq!(sub.read(WAIT).await.unwrap().text().unwrap(), "late");
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn duplicate_subscription_id_is_rejected() {
    let (addr, _log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    let opts = SubscribeOptions::from(AckMode::Auto).id("fixed");
    let sub = conn.subscribe("/queue/f", opts.clone()).await.unwrap();
    assert_eq!(sub.id(), "fixed");
    assert!(matches!(
        conn.subscribe("/queue/g", opts).await,
        Err(StompError::Subscription(_))
    ));
    assert_eq!(conn.subscription_count().await, 1);
    conn.disconnect().await.unwrap();
}

// ============================================================================
// Receipts
// ============================================================================

#[tokio::test]
async fn receipt_timeout_leaves_connection_usable() {
    let (addr, log) = spawn_queue_broker(QueueBehaviour {
        drop_receipts: true,
    })
    .await;
    let config = test_config(&addr).message_send_timeout(Duration::from_millis(200));
    let conn = Connection::connect(config).await.unwrap();

    let err = conn
        .send("/queue/r", "text/plain", "x", SendOptions::new().receipt(true))
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::ReceiptTimeout(_)));
    assert!(!err.is_fatal());
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.pending_receipts().await, 0);

    conn.send("/queue/r", "text/plain", "y", SendOptions::new())
        .await
        .unwrap();
    conn.disconnect().await.unwrap();
    assert_eq!(log.lock().unwrap().frames.len(), 3);
}

#[tokio::test]
async fn error_naming_a_receipt_fails_that_operation_and_the_connection() {
    let addr = spawn_broker(|mut framed| async move {
        handshake(&mut framed, "0,0").await;
        while let Some(frame) = next_frame(&mut framed).await {
            if let Some(receipt) = frame.get_header("receipt") {
                send_frame(
                    &mut framed,
                    Frame::new("ERROR")
                        .header("receipt-id", receipt)
                        .header("message", "no such queue"),
                )
                .await;
            }
        }
    })
    .await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();

    let err = conn
        .send("/queue/none", "", "x", SendOptions::new().receipt(true))
        .await
        .unwrap_err();
    match err {
        StompError::Broker(server) => {
            assert_eq!(server.message, "no such queue");
            assert!(server.receipt_id.is_some());
        }
        other => panic!("expected Broker, got {:?}", other),
    }
    assert_eq!(conn.closed().await, ConnectionState::Failed);
}

#[tokio::test]
async fn stray_frames_do_not_break_the_session() {
    let addr = spawn_broker(|mut framed| async move {
        handshake(&mut framed, "0,0").await;
        send_frame(
            &mut framed,
            Frame::new("MESSAGE")
                .header("subscription", "nobody")
                .header("message-id", "m-0")
                .header("destination", "/queue/x"),
        )
        .await;
        send_frame(&mut framed, Frame::new("RECEIPT").header("receipt-id", "ghost")).await;
        while let Some(frame) = next_frame(&mut framed).await {
            if let Some(receipt) = frame.get_header("receipt") {
                send_frame(&mut framed, Frame::new("RECEIPT").header("receipt-id", receipt)).await;
            }
        }
    })
    .await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.send("/queue/x", "", "ok", SendOptions::new().receipt(true))
        .await
        .unwrap();
    conn.disconnect().await.unwrap();
}

// ============================================================================
// Failure and shutdown
// ============================================================================

#[tokio::test]
async fn broker_error_fails_blocked_reads() {
    let addr = spawn_broker(|mut framed| async move {
        handshake(&mut framed, "0,0").await;
        let _subscribe = next_frame(&mut framed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_frame(&mut framed, Frame::new("ERROR").header("message", "broker going away")).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    })
    .await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    let sub = conn.subscribe("/queue/z", AckMode::Auto).await.unwrap();

    let err = sub.read(WAIT).await.unwrap_err();
    assert!(matches!(err, StompError::Broker(ref e) if e.message == "broker going away"));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert!(matches!(conn.failure(), Some(StompError::Broker(_))));

    let err = conn
        .send("/queue/z", "", "x", SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StompError::State {
            state: ConnectionState::Failed,
            ..
        }
    ));
    // disconnect after failure only joins the tasks
    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn broker_eof_fails_the_connection() {
    let addr = spawn_broker(|mut framed| async move {
        handshake(&mut framed, "0,0").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    })
    .await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    assert_eq!(conn.closed().await, ConnectionState::Failed);
    assert!(conn.failure().is_some());
}

#[tokio::test]
async fn disconnect_releases_blocked_reads_and_is_idempotent() {
    let (addr, _log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();
    let sub = conn.subscribe("/queue/w", AckMode::Auto).await.unwrap();

    let reader = tokio::spawn(async move { sub.read(None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.disconnect().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("read stayed blocked")
        .unwrap();
    assert!(matches!(result, Err(StompError::ConnectionClosed)));

    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(
        conn.subscribe("/queue/w", AckMode::Auto).await,
        Err(StompError::State { .. })
    ));
    assert!(matches!(conn.begin().await, Err(StompError::State { .. })));
}

// ============================================================================
// Heartbeats
// ============================================================================

#[tokio::test]
async fn silent_broker_triggers_heartbeat_timeout() {
    let addr = spawn_broker(|mut framed| async move {
        // promise heartbeats every 100ms, then send nothing
        handshake(&mut framed, "100,0").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
    })
    .await;
    let config = test_config(&addr).heartbeat(Duration::ZERO, Duration::from_millis(100));
    let conn = Connection::connect(config).await.unwrap();
    assert_eq!(conn.heartbeat(), (None, Some(Duration::from_millis(100))));

    let state = tokio::time::timeout(Duration::from_secs(2), conn.closed())
        .await
        .expect("heartbeat timeout not detected");
    assert_eq!(state, ConnectionState::Failed);
    assert!(matches!(conn.failure(), Some(StompError::HeartbeatTimeout(_))));
}

#[tokio::test]
async fn idle_client_sends_heartbeats() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let addr = spawn_broker(|mut framed| async move {
        handshake(&mut framed, "0,50").await;
        let mut beats = 0;
        let deadline = tokio::time::sleep(Duration::from_millis(400));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                item = framed.next() => match item {
                    Some(Ok(StompItem::Heartbeat)) => beats += 1,
                    Some(Ok(StompItem::Frame(_))) => {}
                    _ => break,
                },
            }
        }
        let _ = tx.send(beats);
        // stay up so the client does not see EOF
        while next_frame(&mut framed).await.is_some() {}
    })
    .await;
    let config = test_config(&addr).heartbeat(Duration::from_millis(50), Duration::ZERO);
    let conn = Connection::connect(config).await.unwrap();
    assert_eq!(conn.heartbeat(), (Some(Duration::from_millis(50)), None));

    let beats = rx.await.unwrap();
    assert!(beats >= 3, "only {} heartbeats in 400ms", beats);
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.disconnect().await.unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn transaction_frames_carry_the_transaction_id() {
    let (addr, log) = spawn_queue_broker(QueueBehaviour::default()).await;
    let conn = Connection::connect(test_config(&addr)).await.unwrap();

    let tx = conn.begin().await.unwrap();
    tx.send("/queue/t", "text/plain", "in-tx", SendOptions::new())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(tx.is_finished());
    assert!(matches!(tx.abort().await, Err(StompError::Protocol(_))));
    conn.disconnect().await.unwrap();

    let log = log.lock().unwrap();
    let frames: Vec<(&str, Option<&str>)> = log
        .frames
        .iter()
        .filter(|f| f.command != "DISCONNECT")
        .map(|f| (f.command.as_str(), f.get_header("transaction")))
        .collect();
    assert_eq!(
        frames,
        [
            ("BEGIN", Some(tx.id())),
            ("SEND", Some(tx.id())),
            ("COMMIT", Some(tx.id())),
        ]
    );
}
