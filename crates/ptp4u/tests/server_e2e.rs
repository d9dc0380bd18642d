//! End-to-end scenarios over real loopback UDP sockets: SIGNALING
//! negotiation, ticked Sync/Announce delivery, DelayReq gating, and drain.

mod support;

use std::time::Duration;

use ptp4u::codec::{Message, MessageType, Tlv};

use support::{client_identity, client_socket, recv_message, send_delay_req, send_request, Harness};

#[tokio::test]
async fn announce_grant_then_cadence_with_increasing_sequence_ids() {
    let harness = Harness::spawn(&support::static_config());
    let client = client_socket();
    let identity = client_identity(1);

    send_request(
        &client,
        harness.general_addr,
        identity,
        MessageType::Announce as u8,
        -4, // ~62.5ms, fast enough for a quick test
        60,
        7,
    )
    .await;

    let grant = recv_message(&client, Duration::from_secs(2)).await;
    match grant {
        Message::Signaling(header, body) => {
            assert_eq!(header.sequence_id, 7, "grant echoes the request's sequence id");
            assert_eq!(
                body.tlvs,
                vec![Tlv::GrantUnicastTransmission {
                    message_type: MessageType::Announce as u8,
                    log_inter_message_period: -4,
                    duration_field: 60,
                    renewal: false,
                }]
            );
        }
        other => panic!("expected a SIGNALING grant, got {other:?}"),
    }

    let first = match recv_message(&client, Duration::from_secs(2)).await {
        Message::Announce(header, _) => header.sequence_id,
        other => panic!("expected an Announce, got {other:?}"),
    };
    let second = match recv_message(&client, Duration::from_secs(2)).await {
        Message::Announce(header, _) => header.sequence_id,
        other => panic!("expected an Announce, got {other:?}"),
    };
    assert_eq!(second, first + 1, "sequence id increments tick over tick");

    assert_eq!(harness.counters.snapshot().grants_issued, 1);
}

#[tokio::test]
async fn sync_subscription_pairs_with_a_matching_follow_up() {
    let harness = Harness::spawn(&support::static_config());
    let client = client_socket();
    let identity = client_identity(2);

    send_request(&client, harness.general_addr, identity, MessageType::Sync as u8, -4, 60, 1).await;
    let _grant = recv_message(&client, Duration::from_secs(2)).await;

    let sync_seq = match recv_message(&client, Duration::from_secs(2)).await {
        Message::Sync(header, _) => header.sequence_id,
        other => panic!("expected a Sync, got {other:?}"),
    };
    let (follow_up_seq, precise_origin) = match recv_message(&client, Duration::from_secs(2)).await {
        Message::FollowUp(header, body) => (header.sequence_id, body.precise_origin_timestamp),
        other => panic!("expected a FollowUp, got {other:?}"),
    };
    assert_eq!(follow_up_seq, sync_seq, "FollowUp must carry the preceding Sync's sequence id");

    // Software timestamps are corrected by the default dynamic config's
    // `utc_offset_seconds` (37) to move them onto the TAI scale the wire
    // format expects, so the wire value trails wall-clock `now` by ~37s.
    let now = ptp4u::codec::PtpTimestamp::from_system_time(std::time::SystemTime::now());
    let expected = now.seconds + 37;
    let delta = expected.abs_diff(precise_origin.seconds);
    assert!(delta <= 2, "FollowUp's preciseOriginTimestamp should track wall-clock now plus the UTC offset");
}

#[tokio::test]
async fn delay_req_without_a_grant_is_dropped_silently() {
    let harness = Harness::spawn(&support::static_config());
    let client = client_socket();
    let identity = client_identity(3);

    send_delay_req(&client, harness.event_addr, identity, 1).await;

    let mut buf = [0u8; 256];
    let result = tokio::time::timeout(Duration::from_millis(200), client.recv(&mut buf)).await;
    assert!(result.is_err(), "an ungranted DelayReq must not get a DelayResp");

    assert_eq!(harness.counters.snapshot().rx.delay_req, 1);
}

#[tokio::test]
async fn granted_delay_req_gets_a_delay_resp() {
    let harness = Harness::spawn(&support::static_config());
    let client = client_socket();
    let identity = client_identity(4);

    send_request(
        &client,
        harness.general_addr,
        identity,
        MessageType::DelayResp as u8,
        0,
        60,
        1,
    )
    .await;
    let _grant = recv_message(&client, Duration::from_secs(2)).await;

    send_delay_req(&client, harness.event_addr, identity, 9).await;
    match recv_message(&client, Duration::from_secs(2)).await {
        Message::DelayResp(header, body) => {
            assert_eq!(header.sequence_id, 9);
            assert_eq!(body.requesting_port_identity, identity);
        }
        other => panic!("expected a DelayResp, got {other:?}"),
    }
}

#[tokio::test]
async fn drain_cancels_every_live_subscription() {
    let harness = Harness::spawn(&support::static_config());
    let client = client_socket();
    let identity = client_identity(5);

    send_request(
        &client,
        harness.general_addr,
        identity,
        MessageType::Announce as u8,
        -4,
        60,
        1,
    )
    .await;
    let _grant = recv_message(&client, Duration::from_secs(2)).await;
    let _first_announce = recv_message(&client, Duration::from_secs(2)).await;

    harness.worker.drain_clients().await;

    // Drain the remaining queued Announce ticks (the ticker may have one or
    // two more jobs already in flight) until the server-initiated cancel
    // arrives; it must be the final message this client ever gets.
    let cancel = loop {
        match recv_message(&client, Duration::from_secs(2)).await {
            Message::Announce(_, _) => continue,
            other => break other,
        }
    };
    match cancel {
        Message::Signaling(_, body) => {
            assert_eq!(
                body.tlvs,
                vec![Tlv::CancelUnicastTransmission {
                    message_type: MessageType::Announce as u8
                }]
            );
        }
        other => panic!("expected a server-initiated SIGNALING cancel, got {other:?}"),
    }
}

#[tokio::test]
async fn request_above_max_duration_is_denied_not_clamped() {
    let mut dynamic = support::dynamic_config();
    dynamic.max_subscription_duration = Duration::from_secs(60);
    let harness = Harness::spawn_with_dynamic_config(&support::static_config(), dynamic);
    let client = client_socket();
    let identity = client_identity(6);

    send_request(
        &client,
        harness.general_addr,
        identity,
        MessageType::Announce as u8,
        -4,
        3600,
        1,
    )
    .await;

    match recv_message(&client, Duration::from_secs(2)).await {
        Message::Signaling(_, body) => {
            assert_eq!(
                body.tlvs,
                vec![Tlv::GrantUnicastTransmission {
                    message_type: MessageType::Announce as u8,
                    log_inter_message_period: -4,
                    duration_field: 0,
                    renewal: false,
                }],
                "an over-duration request is denied (duration_field 0), never clamped"
            );
        }
        other => panic!("expected a SIGNALING reply, got {other:?}"),
    }
    assert_eq!(harness.counters.snapshot().grants_denied, 1);

    // No subscription was created, so no Announce ever follows.
    let mut buf = [0u8; 256];
    let result = tokio::time::timeout(Duration::from_millis(200), client.recv(&mut buf)).await;
    assert!(result.is_err());
}
