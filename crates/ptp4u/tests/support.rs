//! Shared harness for the end-to-end tests in this directory: wires a real
//! [`SendWorker`] to a pair of loopback UDP sockets the same way
//! [`ptp4u::server::Server`] does, minus the parts that need a real NIC
//! (interface MAC derivation, privileged ports). Software timestamping works
//! on any loopback socket without special privilege, so these tests exercise
//! the genuine wire codec and worker/listener plumbing end to end.
#![allow(dead_code)]

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use ptp4u::codec::{MessageType, PtpHeader, SignalingBody, Tlv, WireHeader};
use ptp4u::config::{DynamicConfig, DynamicConfigCell, StaticConfig};
use ptp4u::identity::{ClockIdentity, PortIdentity};
use ptp4u::listener::{DrainFlag, Listener, PortRole};
use ptp4u::metrics::Counters;
use ptp4u::timestamping::TimestampMode;
use ptp4u::worker::SendWorker;

pub fn static_config() -> StaticConfig {
    StaticConfig {
        interface: "lo".into(),
        ip: "127.0.0.1".parse().unwrap(),
        event_port: 0,
        general_port: 0,
        worker_count: 1,
        queue_capacity: 128,
        timestamp_mode: TimestampMode::Software,
        dscp: 0,
        pid_file: std::env::temp_dir().join("ptp4u-support-test.pid"),
        dynamic_config_path: None,
        attempts_txts: 20,
        timeout_txts: Duration::from_millis(20),
    }
}

/// Matches [`DynamicConfig::default`] except for a 1ms minimum subscription
/// interval, fast enough for these tests' short grant durations without
/// waiting on the production 100ms floor.
pub fn dynamic_config() -> DynamicConfig {
    DynamicConfig {
        min_subscription_interval: Duration::from_millis(1),
        ..DynamicConfig::default()
    }
}

/// A single-worker harness: one [`SendWorker`] reachable over its own
/// event/general loopback addresses, plus the shared [`Counters`] a test can
/// inspect directly (the worker only ever sees an `Arc` clone of it).
pub struct Harness {
    pub event_addr: SocketAddr,
    pub general_addr: SocketAddr,
    pub counters: Arc<Counters>,
    pub drain: Arc<DrainFlag>,
    pub worker: Arc<SendWorker>,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl Harness {
    pub fn spawn(config: &StaticConfig) -> Self {
        Self::spawn_with_dynamic_config(config, dynamic_config())
    }

    pub fn spawn_with_dynamic_config(config: &StaticConfig, dynamic: DynamicConfig) -> Self {
        let clock_identity = ClockIdentity::from_mac([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let event_socket = UdpSocket::bind(SocketAddr::new(config.ip, 0)).unwrap();
        let general_socket = UdpSocket::bind(SocketAddr::new(config.ip, 0)).unwrap();
        let event_addr = event_socket.local_addr().unwrap();
        let general_addr = general_socket.local_addr().unwrap();

        let dynamic_config = Arc::new(DynamicConfigCell::new(dynamic));
        let counters = Arc::new(Counters::default());
        let drain = Arc::new(DrainFlag::default());

        let worker = Arc::new(
            SendWorker::new(
                0,
                clock_identity,
                event_addr.port(),
                config,
                event_socket,
                general_socket,
                Arc::clone(&dynamic_config),
                Arc::clone(&counters),
                Arc::clone(&drain),
            )
            .unwrap(),
        );

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(Arc::clone(&worker).run(stop_rx.clone()));

        // The listener needs its own bound sockets to route datagrams to the
        // worker; give it a second pair rather than racing the worker's own
        // sockets for incoming reads.
        let listener_event = UdpSocket::bind(SocketAddr::new(config.ip, 0)).unwrap();
        let listener_general = UdpSocket::bind(SocketAddr::new(config.ip, 0)).unwrap();
        let listener_event_addr = listener_event.local_addr().unwrap();
        let listener_general_addr = listener_general.local_addr().unwrap();

        let workers = Arc::new(vec![Arc::clone(&worker)]);
        let event_ts = ptp4u::timestamping::TimestampedSocket::new(
            listener_event,
            &config.interface,
            config.timestamp_mode,
            config.attempts_txts,
            config.timeout_txts,
        )
        .unwrap();
        let general_ts = ptp4u::timestamping::TimestampedSocket::new(
            listener_general,
            &config.interface,
            config.timestamp_mode,
            config.attempts_txts,
            config.timeout_txts,
        )
        .unwrap();
        let event_listener = Listener::new(
            PortRole::Event,
            event_ts,
            Arc::clone(&workers),
            Arc::clone(&drain),
            Arc::clone(&counters),
        );
        let general_listener = Listener::new(
            PortRole::General,
            general_ts,
            Arc::clone(&workers),
            Arc::clone(&drain),
            Arc::clone(&counters),
        );
        tokio::spawn(event_listener.run(stop_rx.clone()));
        tokio::spawn(general_listener.run(stop_rx));

        Self {
            event_addr: listener_event_addr,
            general_addr: listener_general_addr,
            counters,
            drain,
            worker,
            stop_tx,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

pub fn client_identity(port: u16) -> PortIdentity {
    PortIdentity::new(ClockIdentity(0x0a0b0c0d0e0f1011), port)
}

/// A loopback UDP socket a test plays the role of a client on: async
/// send/recv via tokio, bound to an OS-assigned port on 127.0.0.1.
pub fn client_socket() -> tokio::net::UdpSocket {
    let std_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    std_socket.set_nonblocking(true).unwrap();
    tokio::net::UdpSocket::from_std(std_socket).unwrap()
}

/// Build and send a SIGNALING Request-Unicast-Transmission datagram from
/// `client` to `dest`.
pub async fn send_request(
    socket: &tokio::net::UdpSocket,
    dest: SocketAddr,
    client: PortIdentity,
    message_type: u8,
    log_inter_message_period: i8,
    duration_field: u32,
    sequence_id: u16,
) {
    let mut header = PtpHeader::new(MessageType::Signaling, client, 0);
    header.sequence_id = sequence_id;
    let body = SignalingBody {
        target_port_identity: client,
        tlvs: vec![Tlv::RequestUnicastTransmission {
            message_type,
            log_inter_message_period,
            duration_field,
        }],
    };
    let mut buf = vec![0u8; WireHeader::SIZE + body.encoded_len()];
    let body_len = body.encode(&mut buf[WireHeader::SIZE..]).unwrap();
    header.encode(body_len, &mut buf).unwrap();
    socket
        .send_to(&buf[..WireHeader::SIZE + body_len], dest)
        .await
        .unwrap();
}

/// Build and send a bare DelayReq datagram from `client` to `dest`.
pub async fn send_delay_req(
    socket: &tokio::net::UdpSocket,
    dest: SocketAddr,
    client: PortIdentity,
    sequence_id: u16,
) {
    let mut header = PtpHeader::new(MessageType::DelayReq, client, 0);
    header.sequence_id = sequence_id;
    let body = ptp4u::codec::DelayReqBody::default();
    let mut buf = [0u8; 64];
    let body_len = body.encode(&mut buf[WireHeader::SIZE..]).unwrap();
    header.encode(body_len, &mut buf).unwrap();
    socket
        .send_to(&buf[..WireHeader::SIZE + body_len], dest)
        .await
        .unwrap();
}

/// Receive and decode one datagram on `socket`, or panic after `timeout`.
pub async fn recv_message(
    socket: &tokio::net::UdpSocket,
    timeout: Duration,
) -> ptp4u::codec::Message {
    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    ptp4u::codec::Message::decode(&buf[..n]).unwrap()
}
