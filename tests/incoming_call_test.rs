// tests/incoming_call_test.rs
//
// Incoming calls end to end: invite delivery, accepting with a local
// answer, rejecting, ignoring, and the failure paths around the
// microphone and the ringtone player.

use ringline::call::Direction;
use ringline::signaling::{InviteNotice, SignalingEvent};
use ringline::test_utils::{
    RecordedCommand, invite_notice, open_outgoing_call, recv, register_device, test_harness,
    test_harness_with, test_options, wait_until,
};
use ringline::{AcceptOptions, CallState, DisconnectReason};
use std::time::Duration;

#[tokio::test]
async fn test_invite_delivers_incoming_call() {
    let harness = test_harness();
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-incoming-1")))
        .await;

    let call = recv(&mut incoming_rx).await;
    assert_eq!(call.direction(), Direction::Incoming);
    assert_eq!(call.call_sid().await.as_deref(), Some("CA-incoming-1"));
    assert!(call.state().await.can_accept());

    let parameters = call.parameters().await;
    assert_eq!(parameters.get("From").map(String::as_str), Some("client:alice"));
    assert_eq!(parameters.get("To").map(String::as_str), Some("client:bob"));

    // The ringtone started before the call was handed out.
    assert_eq!(harness.sounds.incoming_started(), 1);
}

#[tokio::test]
async fn test_invite_without_sdp_reports_malformed_request() {
    let harness = test_harness();
    let mut error_rx = harness.device.events.error.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(InviteNotice {
            call_sid: Some("CA-broken-1".to_string()),
            sdp: None,
            parameters: Default::default(),
        }))
        .await;

    let error = recv(&mut error_rx).await;
    assert_eq!(error.error.code(), 31100);
    assert_eq!(error.call_sid.as_deref(), Some("CA-broken-1"));
}

#[tokio::test]
async fn test_invite_while_busy_is_dropped() {
    let harness = test_harness();
    let (_call, channel) = open_outgoing_call(&harness).await;
    let mut incoming_rx = harness.device.events.incoming.subscribe();

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-second-1")))
        .await;

    let delivered =
        tokio::time::timeout(Duration::from_millis(100), incoming_rx.recv()).await;
    assert!(delivered.is_err(), "busy device should drop the invite");
}

#[tokio::test]
async fn test_invite_while_busy_delivered_when_allowed() {
    let mut options = test_options();
    options.allow_incoming_while_busy = true;
    let harness = test_harness_with(options);
    let (_call, channel) = open_outgoing_call(&harness).await;
    let mut incoming_rx = harness.device.events.incoming.subscribe();

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-second-1")))
        .await;

    let call = recv(&mut incoming_rx).await;
    assert_eq!(call.call_sid().await.as_deref(), Some("CA-second-1"));
    assert!(call.state().await.can_accept());
}

#[tokio::test]
async fn test_accept_answers_with_local_description() {
    let harness = test_harness();
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-incoming-1")))
        .await;
    let call = recv(&mut incoming_rx).await;
    let mut accept_rx = call.events.accept.subscribe();

    call.accept(AcceptOptions::default()).await.unwrap();

    assert_eq!(
        channel.next_command().await,
        RecordedCommand::Answer {
            call_sid: "CA-incoming-1".to_string(),
            sdp: "answer-to:v=0 remote-offer".to_string(),
        }
    );
    recv(&mut accept_rx).await;
    let opened = call.clone();
    wait_until("call opens", move || {
        let call = opened.clone();
        async move { call.state().await.is_open() }
    })
    .await;
    assert!(harness.sounds.incoming_stopped() >= 1);
}

#[tokio::test]
async fn test_reject_tells_the_gateway() {
    let harness = test_harness();
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-incoming-1")))
        .await;
    let call = recv(&mut incoming_rx).await;
    let mut reject_rx = call.events.reject.subscribe();

    call.reject().await.unwrap();

    assert_eq!(
        channel.next_command().await,
        RecordedCommand::Reject {
            call_sid: "CA-incoming-1".to_string(),
        }
    );
    recv(&mut reject_rx).await;
    match call.state().await {
        CallState::Closed {
            reason,
            duration_secs,
            ..
        } => {
            assert_eq!(reason, DisconnectReason::Rejected);
            assert_eq!(duration_secs, None, "a rejected call never connected");
        }
        other => panic!("expected closed call, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ignore_ends_the_call_silently() {
    let harness = test_harness();
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-incoming-1")))
        .await;
    let call = recv(&mut incoming_rx).await;
    let mut reject_rx = call.events.reject.subscribe();
    let mut cancel_rx = call.events.cancel.subscribe();
    let mut disconnect_rx = call.events.disconnect.subscribe();

    call.ignore().await.unwrap();

    // Nothing went over the wire and no call events fired.
    let commands = channel.commands().await;
    assert!(
        !commands
            .iter()
            .any(|c| matches!(c, RecordedCommand::Reject { .. } | RecordedCommand::Hangup { .. })),
        "ignore must not answer the gateway: {commands:?}"
    );
    assert!(reject_rx.try_recv().is_err());
    assert!(cancel_rx.try_recv().is_err());
    assert!(disconnect_rx.try_recv().is_err());
    assert!(call.state().await.is_terminal());
    // The ringtone still stops.
    assert!(harness.sounds.incoming_stopped() >= 1);
}

#[tokio::test]
async fn test_denied_microphone_fails_the_accept() {
    let harness = test_harness();
    harness.audio.deny_input(true);
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-incoming-1")))
        .await;
    let call = recv(&mut incoming_rx).await;
    let mut error_rx = call.events.error.subscribe();
    let mut disconnect_rx = call.events.disconnect.subscribe();

    // The failure is reported through events, not the return value.
    call.accept(AcceptOptions::default()).await.unwrap();

    let error = recv(&mut error_rx).await;
    assert_eq!(error.error.code(), 31401);
    recv(&mut disconnect_rx).await;
    match call.state().await {
        CallState::Closed { reason, .. } => assert_eq!(reason, DisconnectReason::Error),
        other => panic!("expected closed call, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stuck_ringtone_does_not_block_invite_delivery() {
    let harness = test_harness();
    harness.sounds.block_incoming(true);
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-incoming-1")))
        .await;

    // Give the invite handler a chance to park on the ringtone, then run
    // the clock past its grace period.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::advance(Duration::from_millis(2100)).await;

    let call = recv(&mut incoming_rx).await;
    assert_eq!(call.call_sid().await.as_deref(), Some("CA-incoming-1"));
    assert_eq!(
        harness.sounds.incoming_started(),
        0,
        "the stuck player never finished starting"
    );
}
