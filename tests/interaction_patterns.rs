//! End-to-end interaction pattern scenarios over loopback TCP.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use malrs::{ClientContext, InteractionError, InteractionType, Transaction};

use common::bind_context;

#[test]
fn request_response_round_trip() {
    let provider_ctx = bind_context();
    let consumer_ctx = bind_context();

    let provider = ClientContext::new(&provider_ctx, "p").unwrap();
    provider
        .register_handler(
            InteractionType::Request,
            200,
            1,
            1,
            1,
            |msg, transaction| {
                let Transaction::Request(transaction) = transaction else {
                    panic!("expected request transaction");
                };
                transaction.reply(msg.body, false)?;
                Ok(())
            },
        )
        .unwrap();

    let consumer = ClientContext::new(&consumer_ctx, "c").unwrap();
    let mut op = consumer
        .request_operation(provider.uri().clone(), 200, 1, 1, 1)
        .unwrap();
    let response = op.request(Bytes::from_static(&[0xDE, 0xAD])).unwrap();

    assert_eq!(response.body.as_ref(), &[0xDE, 0xAD]);
    assert_eq!(response.interaction_stage, malrs::stage::REQUEST_RESPONSE);
    assert_eq!(response.uri_from, *provider.uri());
    assert!(!response.is_error_message);
}

#[test]
fn submit_acknowledged() {
    let provider_ctx = bind_context();
    let consumer_ctx = bind_context();

    let (seen_tx, seen_rx) = mpsc::channel();
    let provider = ClientContext::new(&provider_ctx, "p").unwrap();
    provider
        .register_handler(InteractionType::Submit, 200, 1, 1, 2, move |msg, transaction| {
            let Transaction::Submit(transaction) = transaction else {
                panic!("expected submit transaction");
            };
            seen_tx.send(msg.body.to_vec()).unwrap();
            transaction.ack(Bytes::new(), false)?;
            Ok(())
        })
        .unwrap();

    let consumer = ClientContext::new(&consumer_ctx, "c").unwrap();
    let mut op = consumer
        .submit_operation(provider.uri().clone(), 200, 1, 1, 2)
        .unwrap();
    let ack = op.submit(Bytes::from_static(b"telemetry")).unwrap();

    assert_eq!(ack.interaction_stage, malrs::stage::SUBMIT_ACK);
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"telemetry"
    );
}

#[test]
fn send_reaches_provider_without_reply() {
    let provider_ctx = bind_context();
    let consumer_ctx = bind_context();

    let (seen_tx, seen_rx) = mpsc::channel();
    let provider = ClientContext::new(&provider_ctx, "p").unwrap();
    provider
        .register_handler(InteractionType::Send, 200, 1, 1, 3, move |msg, transaction| {
            assert!(matches!(transaction, Transaction::Send(_)));
            seen_tx.send(msg.body.to_vec()).unwrap();
            Ok(())
        })
        .unwrap();

    let consumer = ClientContext::new(&consumer_ctx, "c").unwrap();
    let op = consumer
        .send_operation(provider.uri().clone(), 200, 1, 1, 3)
        .unwrap();
    op.send(Bytes::from_static(b"fire-and-forget")).unwrap();

    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"fire-and-forget"
    );
}

#[test]
fn invoke_error_is_terminal_and_late_replies_are_dropped() {
    let provider_ctx = bind_context();
    let consumer_ctx = bind_context();

    // The handler parks its transaction so the test can send a late
    // duplicate response after the operation has already resolved.
    let (txn_tx, txn_rx) = mpsc::channel();
    let provider = ClientContext::new(&provider_ctx, "p").unwrap();
    provider
        .register_handler(InteractionType::Invoke, 200, 1, 1, 4, move |_msg, transaction| {
            let Transaction::Invoke(transaction) = transaction else {
                panic!("expected invoke transaction");
            };
            transaction.ack(Bytes::new(), false)?;
            transaction.reply(Bytes::from_static(&[0x00, 0x01, b'b', b'a', b'd']), true)?;
            txn_tx.send(transaction).unwrap();
            Ok(())
        })
        .unwrap();
    provider
        .register_handler(
            InteractionType::Request,
            200,
            1,
            1,
            5,
            |msg, transaction| {
                let Transaction::Request(transaction) = transaction else {
                    panic!("expected request transaction");
                };
                transaction.reply(msg.body, false)?;
                Ok(())
            },
        )
        .unwrap();

    let consumer = ClientContext::new(&consumer_ctx, "c").unwrap();
    let mut op = consumer
        .invoke_operation(provider.uri().clone(), 200, 1, 1, 4)
        .unwrap();
    let ack = op.invoke(Bytes::from_static(b"go")).unwrap();
    assert_eq!(ack.interaction_stage, malrs::stage::INVOKE_ACK);

    let err = op.response().unwrap_err();
    let InteractionError::ErrorReply(reply) = err else {
        panic!("expected error reply, got {err}");
    };
    assert!(reply.is_error_message);
    assert_eq!(reply.body.as_ref(), &[0x00, 0x01, b'b', b'a', b'd']);

    // A duplicate stage-3 reply for the resolved transaction is dropped
    // by the engine; the endpoint keeps routing other traffic.
    let transaction = txn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    transaction
        .reply(Bytes::from_static(b"too late"), false)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let mut echo = consumer
        .request_operation(provider.uri().clone(), 200, 1, 1, 5)
        .unwrap();
    let response = echo.request(Bytes::from_static(b"still alive")).unwrap();
    assert_eq!(response.body.as_ref(), b"still alive");
}

#[test]
fn progress_streams_updates_then_response() {
    let provider_ctx = bind_context();
    let consumer_ctx = bind_context();

    let provider = ClientContext::new(&provider_ctx, "p").unwrap();
    provider
        .register_handler(InteractionType::Progress, 200, 1, 1, 6, |_msg, transaction| {
            let Transaction::Progress(transaction) = transaction else {
                panic!("expected progress transaction");
            };
            transaction.ack(Bytes::new(), false)?;
            transaction.update(Bytes::from_static(&[1]), false)?;
            transaction.update(Bytes::from_static(&[2]), false)?;
            transaction.reply(Bytes::from_static(&[0xFF]), false)?;
            Ok(())
        })
        .unwrap();

    let consumer = ClientContext::new(&consumer_ctx, "c").unwrap();
    let mut op = consumer
        .progress_operation(provider.uri().clone(), 200, 1, 1, 6)
        .unwrap();
    op.progress(Bytes::new()).unwrap();

    let first = op.update().unwrap().expect("first update");
    assert_eq!(first.body.as_ref(), &[1]);
    let second = op.update().unwrap().expect("second update");
    assert_eq!(second.body.as_ref(), &[2]);
    assert!(op.update().unwrap().is_none());

    let response = op.response().unwrap();
    assert_eq!(response.body.as_ref(), &[0xFF]);
    assert_eq!(response.interaction_stage, malrs::stage::PROGRESS_RESPONSE);
}

#[test]
fn transaction_ids_are_pairwise_distinct() {
    let ctx = bind_context();
    let endpoint = ClientContext::new(&ctx, "ids").unwrap();
    let target = endpoint.uri().clone();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..64 {
        let op = endpoint
            .submit_operation(target.clone(), 200, 1, 1, 1)
            .unwrap();
        assert!(seen.insert(op.transaction_id()), "transaction id reused");
    }
}

#[test]
fn missing_handler_drops_message_without_reply() {
    let provider_ctx = bind_context();
    let consumer_ctx = bind_context();

    // No handler registered on the provider side at all.
    let provider = ClientContext::new(&provider_ctx, "p").unwrap();
    let provider_uri = provider.uri().clone();

    let consumer = ClientContext::new(&consumer_ctx, "c").unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    let mut op = consumer
        .submit_operation(provider_uri, 200, 1, 9, 9)
        .unwrap();
    std::thread::spawn(move || {
        done_tx.send(op.submit(Bytes::new())).ok();
    });

    // The submit never resolves; the provider dropped the message.
    assert!(done_rx.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn endpoint_close_cancels_outstanding_operations() {
    let provider_ctx = bind_context();
    let consumer_ctx = bind_context();

    // Provider accepts the SUBMIT but never acks.
    let provider = ClientContext::new(&provider_ctx, "p").unwrap();
    provider
        .register_handler(InteractionType::Submit, 200, 1, 1, 7, |_msg, _transaction| Ok(()))
        .unwrap();

    let mut consumer = ClientContext::new(&consumer_ctx, "c").unwrap();
    let mut op = consumer
        .submit_operation(provider.uri().clone(), 200, 1, 1, 7)
        .unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        done_tx.send(op.submit(Bytes::new())).ok();
    });
    std::thread::sleep(Duration::from_millis(100));

    consumer.close().unwrap();
    let result = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(InteractionError::Closed)));
}
