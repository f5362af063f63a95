// tests/call_message_test.rs
//
// In-call messages: sending with correlation ids, ack and error replies
// resolving each id exactly once, and inbound delivery rules.

use ringline::CallMessage;
use ringline::call::{DEFAULT_CONTENT_TYPE, USER_DEFINED_MESSAGE};
use ringline::signaling::{AckNotice, ErrorBody, ErrorNotice, MessageNotice, SignalingEvent};
use ringline::test_utils::{
    OUTGOING_CALL_SID, RecordedCommand, invite_notice, open_outgoing_call, recv, register_device,
    test_harness, test_harness_with, test_options,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_send_message_is_acked_once() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut sent_rx = call.events.message_sent.subscribe();

    let sid = call
        .send_message(CallMessage::user_defined(json!({"greeting": "hi"})))
        .await
        .unwrap();
    assert!(sid.starts_with("KX"), "unexpected correlation id {sid}");
    assert_eq!(sid.len(), 34);

    let RecordedCommand::Message(frame) = channel.next_command().await else {
        panic!("expected a message frame");
    };
    assert_eq!(frame.call_sid, OUTGOING_CALL_SID);
    assert_eq!(frame.voice_event_sid, sid);
    assert_eq!(frame.message_type, USER_DEFINED_MESSAGE);
    assert_eq!(frame.content_type, DEFAULT_CONTENT_TYPE);
    assert_eq!(frame.content, json!({"greeting": "hi"}));

    let ack = AckNotice {
        ack_type: "message".to_string(),
        call_sid: Some(OUTGOING_CALL_SID.to_string()),
        voice_event_sid: Some(sid.clone()),
    };
    channel.push(SignalingEvent::Ack(ack.clone())).await;
    let sent = recv(&mut sent_rx).await;
    assert_eq!(sent.voice_event_sid, sid);
    assert_eq!(sent.message.content, json!({"greeting": "hi"}));

    // A replayed ack has nothing left to resolve.
    channel.push(SignalingEvent::Ack(ack)).await;
    let again = tokio::time::timeout(Duration::from_millis(100), sent_rx.recv()).await;
    assert!(again.is_err(), "duplicate ack must not fire a second event");
}

#[tokio::test]
async fn test_send_message_while_incoming_call_still_rings() {
    let harness = test_harness();
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-incoming-1")))
        .await;
    let call = recv(&mut incoming_rx).await;

    // The invite already carries a CallSid and the channel is up, so
    // messages flow before the call is accepted.
    let mut sent_rx = call.events.message_sent.subscribe();
    let sid = call
        .send_message(CallMessage::user_defined(json!({"caller": "screened"})))
        .await
        .unwrap();
    let RecordedCommand::Message(frame) = channel.next_command().await else {
        panic!("expected a message frame");
    };
    assert_eq!(frame.call_sid, "CA-incoming-1");
    assert_eq!(frame.voice_event_sid, sid);

    channel
        .push(SignalingEvent::Ack(AckNotice {
            ack_type: "message".to_string(),
            call_sid: Some("CA-incoming-1".to_string()),
            voice_event_sid: Some(sid.clone()),
        }))
        .await;
    let sent = recv(&mut sent_rx).await;
    assert_eq!(sent.voice_event_sid, sid);
}

#[tokio::test]
async fn test_error_reply_resolves_the_id_instead() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut sent_rx = call.events.message_sent.subscribe();
    let mut error_rx = call.events.error.subscribe();

    let sid = call
        .send_message(CallMessage::user_defined(json!({"greeting": "hi"})))
        .await
        .unwrap();
    assert!(matches!(
        channel.next_command().await,
        RecordedCommand::Message(_)
    ));

    channel
        .push(SignalingEvent::Error(ErrorNotice {
            error: Some(ErrorBody {
                code: Some(31210),
                message: Some("call message event type is invalid".to_string()),
                voice_event_sid: None,
            }),
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            voice_event_sid: Some(sid.clone()),
        }))
        .await;

    let error = recv(&mut error_rx).await;
    assert_eq!(error.error.code(), 31210);
    assert_eq!(error.voice_event_sid.as_deref(), Some(sid.as_str()));
    // A message failure does not end the call.
    assert!(call.state().await.is_open());

    // The id was already resolved, the late ack is dropped.
    channel
        .push(SignalingEvent::Ack(AckNotice {
            ack_type: "message".to_string(),
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            voice_event_sid: Some(sid),
        }))
        .await;
    let late = tokio::time::timeout(Duration::from_millis(100), sent_rx.recv()).await;
    assert!(late.is_err(), "an error reply already resolved this id");
}

#[tokio::test]
async fn test_foreign_acks_leave_pending_messages_alone() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut sent_rx = call.events.message_sent.subscribe();

    let sid = call
        .send_message(CallMessage::user_defined(json!({"n": 1})))
        .await
        .unwrap();
    assert!(matches!(
        channel.next_command().await,
        RecordedCommand::Message(_)
    ));

    // Wrong ack type, then an id that was never issued.
    channel
        .push(SignalingEvent::Ack(AckNotice {
            ack_type: "presence".to_string(),
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            voice_event_sid: Some(sid.clone()),
        }))
        .await;
    channel
        .push(SignalingEvent::Ack(AckNotice {
            ack_type: "message".to_string(),
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            voice_event_sid: Some("KX00000000000000000000000000000000".to_string()),
        }))
        .await;

    // The real ack still resolves, proving neither touched the entry.
    channel
        .push(SignalingEvent::Ack(AckNotice {
            ack_type: "message".to_string(),
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            voice_event_sid: Some(sid.clone()),
        }))
        .await;
    let sent = recv(&mut sent_rx).await;
    assert_eq!(sent.voice_event_sid, sid);
}

#[tokio::test]
async fn test_inbound_message_requires_correlation_id() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut received_rx = call.events.message_received.subscribe();

    // No id, dropped silently.
    channel
        .push(SignalingEvent::Message(MessageNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            content: json!({"ignored": true}),
            content_type: Some("application/json".to_string()),
            message_type: USER_DEFINED_MESSAGE.to_string(),
            voice_event_sid: None,
        }))
        .await;
    // With an id, delivered.
    channel
        .push(SignalingEvent::Message(MessageNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            content: json!({"kind": "update"}),
            content_type: Some("application/json".to_string()),
            message_type: USER_DEFINED_MESSAGE.to_string(),
            voice_event_sid: Some("KXfeed00000000000000000000000000ab".to_string()),
        }))
        .await;

    let received = recv(&mut received_rx).await;
    assert_eq!(
        received.voice_event_sid,
        "KXfeed00000000000000000000000000ab"
    );
    assert_eq!(received.message.content, json!({"kind": "update"}));
    assert_eq!(received.message.message_type, USER_DEFINED_MESSAGE);
}

#[tokio::test]
async fn test_send_message_validation() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;

    let no_type = CallMessage {
        content: json!({"x": 1}),
        content_type: DEFAULT_CONTENT_TYPE.to_string(),
        message_type: "  ".to_string(),
    };
    assert!(call.send_message(no_type).await.is_err());

    let no_content = CallMessage {
        content: Value::Null,
        content_type: DEFAULT_CONTENT_TYPE.to_string(),
        message_type: USER_DEFINED_MESSAGE.to_string(),
    };
    assert!(call.send_message(no_content).await.is_err());

    // An empty content type falls back to the default on the wire.
    let blank_content_type = CallMessage {
        content: json!({"x": 1}),
        content_type: String::new(),
        message_type: USER_DEFINED_MESSAGE.to_string(),
    };
    call.send_message(blank_content_type).await.unwrap();
    let RecordedCommand::Message(frame) = channel.next_command().await else {
        panic!("expected a message frame");
    };
    assert_eq!(frame.content_type, DEFAULT_CONTENT_TYPE);

    // A closed call has detached from signaling and refuses messages.
    call.disconnect().await.unwrap();
    let err = call
        .send_message(CallMessage::user_defined(json!({"x": 1})))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("attached"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_failed_send_leaves_nothing_pending() {
    let mut options = test_options();
    options.voice_event_sid_generator =
        Some(Arc::new(|| "KX-fixed-00000000000000000000000001".to_string()));
    let harness = test_harness_with(options);
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut sent_rx = call.events.message_sent.subscribe();

    channel.set_fail_sends(true);
    assert!(
        call.send_message(CallMessage::user_defined(json!({"n": 1})))
            .await
            .is_err()
    );
    channel.set_fail_sends(false);

    // An ack for the failed send resolves nothing.
    channel
        .push(SignalingEvent::Ack(AckNotice {
            ack_type: "message".to_string(),
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            voice_event_sid: Some("KX-fixed-00000000000000000000000001".to_string()),
        }))
        .await;
    let ghost = tokio::time::timeout(Duration::from_millis(100), sent_rx.recv()).await;
    assert!(ghost.is_err(), "failed send must not stay pending");

    // The same id works fine once the channel recovers.
    let sid = call
        .send_message(CallMessage::user_defined(json!({"n": 2})))
        .await
        .unwrap();
    assert_eq!(sid, "KX-fixed-00000000000000000000000001");
    channel
        .push(SignalingEvent::Ack(AckNotice {
            ack_type: "message".to_string(),
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            voice_event_sid: Some(sid.clone()),
        }))
        .await;
    assert_eq!(recv(&mut sent_rx).await.voice_event_sid, sid);
}
