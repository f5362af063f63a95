// tests/outgoing_call_test.rs
//
// Outgoing calls: dialing with parameters, the temporary id handed to
// the gateway, ringing and answer handling, hangups in both directions
// and in-call controls.

use indexmap::IndexMap;
use ringline::call::Direction;
use ringline::signaling::{ErrorBody, HangupNotice, RingingNotice, SignalingEvent};
use ringline::test_utils::{
    OUTGOING_CALL_SID, RECONNECT_TOKEN, RecordedCommand, invite_notice, open_outgoing_call, recv,
    register_device, test_harness, test_harness_with, test_options,
};
use ringline::{CallState, ConnectOptions, ConnectToken, DisconnectReason};
use std::sync::Arc;

#[tokio::test]
async fn test_connect_dials_with_custom_parameters() {
    let harness = test_harness();
    let mut params = IndexMap::new();
    params.insert("To".to_string(), "client:carol".to_string());
    params.insert("team".to_string(), "support desk".to_string());

    let call = harness
        .device
        .connect(ConnectOptions {
            params: params.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    let channel = harness.signaling_factory.wait_for_channel().await;

    let RecordedCommand::Invite {
        call_id,
        sdp,
        params: sent,
    } = channel.next_command().await
    else {
        panic!("expected an invite command");
    };
    // The client-generated id stands in for the call sid until the
    // gateway assigns one.
    assert!(call_id.starts_with("TJ"), "unexpected id {call_id}");
    assert_eq!(call_id.len(), 34);
    assert!(call_id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(sdp, format!("offer-for:{call_id}"));
    assert_eq!(sent, params);

    assert_eq!(call.direction(), Direction::Outgoing);
    assert_eq!(call.temp_call_id(), Some(call_id.as_str()));
    assert!(matches!(call.state().await, CallState::Connecting { .. }));
    assert_eq!(call.custom_parameters().await, params);
}

#[tokio::test]
async fn test_connect_refused_while_busy() {
    let harness = test_harness();
    let (_call, _channel) = open_outgoing_call(&harness).await;
    assert!(harness.device.is_busy().await);

    let err = harness
        .device
        .connect(ConnectOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("active"), "unexpected error: {err}");
}

#[tokio::test]
async fn test_connect_abandons_ringing_invites() {
    let harness = test_harness();
    let mut incoming_rx = harness.device.events.incoming.subscribe();
    let channel = register_device(&harness).await;

    channel
        .push(SignalingEvent::Invite(invite_notice("CA-ringing-1")))
        .await;
    let invite = recv(&mut incoming_rx).await;

    // Dialing out drops the unanswered invite locally, without telling
    // the gateway.
    let call = harness
        .device
        .connect(ConnectOptions::default())
        .await
        .unwrap();
    assert!(invite.state().await.is_terminal());
    assert!(harness.device.pending_calls().await.is_empty());
    let active = harness.device.active_call().await.unwrap();
    assert!(Arc::ptr_eq(&active, &call));
    assert!(
        !channel
            .commands()
            .await
            .iter()
            .any(|c| matches!(c, RecordedCommand::Reject { .. })),
        "an abandoned invite must stay local"
    );
}

#[tokio::test]
async fn test_ringing_retires_temporary_id() {
    let harness = test_harness();
    let call = harness
        .device
        .connect(ConnectOptions::default())
        .await
        .unwrap();
    let channel = harness.signaling_factory.wait_for_channel().await;
    let RecordedCommand::Invite { call_id, .. } = channel.next_command().await else {
        panic!("expected an invite command");
    };
    let mut ringing_rx = call.events.ringing.subscribe();

    channel
        .push(SignalingEvent::Ringing(RingingNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            temp_call_sid: Some(call_id),
            sdp: Some("v=0 early-media".to_string()),
        }))
        .await;

    let ringing = recv(&mut ringing_rx).await;
    assert!(ringing.has_early_media);
    assert_eq!(call.call_sid().await.as_deref(), Some(OUTGOING_CALL_SID));
    assert!(matches!(call.state().await, CallState::Ringing { .. }));
}

#[tokio::test]
async fn test_answer_opens_the_call() {
    let harness = test_harness();
    let (call, _channel) = open_outgoing_call(&harness).await;

    assert!(call.state().await.is_open());
    assert_eq!(call.call_sid().await.as_deref(), Some(OUTGOING_CALL_SID));

    // An answered call hands out a token that can re-dial this leg.
    let raw = call.connect_token().await.unwrap();
    let token = ConnectToken::decode(&raw).unwrap();
    assert_eq!(token.call_sid(), OUTGOING_CALL_SID);
    assert_eq!(token.signaling_reconnect_token, RECONNECT_TOKEN);
}

#[tokio::test]
async fn test_disconnect_hangs_up() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut disconnect_rx = call.events.disconnect.subscribe();

    call.disconnect().await.unwrap();

    assert_eq!(
        channel.next_command().await,
        RecordedCommand::Hangup {
            call_sid: OUTGOING_CALL_SID.to_string(),
            message: None,
        }
    );
    recv(&mut disconnect_rx).await;
    match call.state().await {
        CallState::Closed {
            reason,
            duration_secs,
            ..
        } => {
            assert_eq!(reason, DisconnectReason::LocalHangup);
            assert!(duration_secs.is_some(), "an answered call has a duration");
        }
        other => panic!("expected closed call, got {other:?}"),
    }
    assert_eq!(harness.sounds.disconnect_played(), 1);
}

#[tokio::test]
async fn test_remote_hangup_closes_cleanly() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut error_rx = call.events.error.subscribe();
    let mut disconnect_rx = call.events.disconnect.subscribe();

    channel
        .push(SignalingEvent::Hangup(HangupNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            message: Some("goodbye".to_string()),
            error: None,
        }))
        .await;

    recv(&mut disconnect_rx).await;
    assert!(error_rx.try_recv().is_err(), "clean hangup carries no error");
    match call.state().await {
        CallState::Closed { reason, .. } => assert_eq!(reason, DisconnectReason::RemoteHangup),
        other => panic!("expected closed call, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remote_hangup_error_collapses_by_default() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut error_rx = call.events.error.subscribe();

    channel
        .push(SignalingEvent::Hangup(HangupNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            message: None,
            error: Some(ErrorBody {
                code: Some(31486),
                message: Some("busy here".to_string()),
                voice_event_sid: None,
            }),
        }))
        .await;

    // Without the precise catalog opt-in the legacy mapping applies,
    // but the original code is kept for diagnostics.
    let error = recv(&mut error_rx).await;
    assert_eq!(error.error.code(), 31005);
    assert_eq!(error.error.raw_code, Some(31486));
    match call.state().await {
        CallState::Closed { reason, .. } => assert_eq!(reason, DisconnectReason::Error),
        other => panic!("expected closed call, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remote_hangup_error_surfaces_precise_code() {
    let mut options = test_options();
    options.improved_signaling_error_precision = true;
    let harness = test_harness_with(options);
    let (call, channel) = open_outgoing_call(&harness).await;
    let mut error_rx = call.events.error.subscribe();

    channel
        .push(SignalingEvent::Hangup(HangupNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            message: None,
            error: Some(ErrorBody {
                code: Some(31486),
                message: Some("busy here".to_string()),
                voice_event_sid: None,
            }),
        }))
        .await;

    let error = recv(&mut error_rx).await;
    assert_eq!(error.error.code(), 31486);
    assert!(call.state().await.is_terminal());
}

#[tokio::test]
async fn test_send_digits_paces_tones_and_pauses() {
    let harness = test_harness();
    let (call, channel) = open_outgoing_call(&harness).await;

    call.send_digits("12w3").await.unwrap();

    for expected in ['1', '2', '3'] {
        assert_eq!(
            channel.next_command().await,
            RecordedCommand::Dtmf {
                call_sid: OUTGOING_CALL_SID.to_string(),
                digit: expected,
            }
        );
    }
    // The pause digit is local only, the rest played a tone each.
    assert_eq!(
        harness.sounds.dtmf_tones(),
        vec!["dtmf1".to_string(), "dtmf2".to_string(), "dtmf3".to_string()]
    );
}

#[tokio::test]
async fn test_send_digits_rejects_garbage() {
    let harness = test_harness();
    let (call, _channel) = open_outgoing_call(&harness).await;

    assert!(call.send_digits("").await.is_err());
    assert!(call.send_digits("12x").await.is_err());
}

#[tokio::test]
async fn test_mute_round_trip() {
    let harness = test_harness();
    let (call, _channel) = open_outgoing_call(&harness).await;
    let mut mute_rx = call.events.mute.subscribe();

    call.mute(true).await.unwrap();
    assert!(recv(&mut mute_rx).await.muted);
    assert!(call.is_muted().await);

    call.mute(false).await.unwrap();
    assert!(!recv(&mut mute_rx).await.muted);
    assert!(!call.is_muted().await);
}
