//! A send worker owns one shard of the client population: its own event
//! (319) and general (320) sockets, every subscription hashed onto it, and
//! the job queues those subscriptions' tickers and the listener feed sends
//! through.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::codec::{
    AnnounceBody, DelayRespBody, FollowUpBody, MessageType, PtpHeader, PtpTimestamp, SignalingBody,
    SyncBody, Tlv,
};
use crate::config::{DynamicConfigCell, StaticConfig};
use crate::error::{Error, Result};
use crate::identity::{ClockIdentity, PortIdentity};
use crate::listener::DrainFlag;
use crate::metrics::Counters;
use crate::subscription::{Subscription, WorkerJob};
use crate::timestamping::TimestampedSocket;

/// Key under which a worker looks up a client's subscription for a given
/// message kind. `DelayResp` and the rest are tracked separately because a
/// client can hold independent grants per kind.
type ClientKey = (MessageType, PortIdentity);

/// A SIGNALING request routed to this worker by the listener, already
/// split into the negotiation action it names.
#[derive(Debug, Clone)]
pub enum SignalingJob {
    Request {
        client: PortIdentity,
        addr: SocketAddr,
        sequence_id: u16,
        message_type: u8,
        log_inter_message_period: i8,
        duration_field: u32,
    },
    Cancel {
        client: PortIdentity,
        addr: SocketAddr,
        sequence_id: u16,
        message_type: u8,
    },
}

/// A DelayReq routed to this worker: answered immediately if (and only if)
/// the client holds a live `DelayResp` grant.
#[derive(Debug, Clone)]
pub struct DelayReqJob {
    pub client: PortIdentity,
    pub addr: SocketAddr,
    pub sequence_id: u16,
    pub rx_timestamp: PtpTimestamp,
}

/// What flows through a worker's secondary queue: datagrams the listener
/// routed here that must be answered on the same FD the ticker's sends use,
/// so they're serialized through this worker's single `run` loop rather than
/// answered directly from the listener task.
#[derive(Debug, Clone)]
pub enum InboundJob {
    DelayReq(DelayReqJob),
    Signaling(SignalingJob),
}

pub struct SendWorker {
    pub index: usize,
    source_identity: PortIdentity,
    domain_number: u8,
    event_socket: TimestampedSocket,
    general_socket: TimestampedSocket,
    clients: AsyncMutex<HashMap<ClientKey, Arc<Subscription>>>,
    job_tx: mpsc::Sender<WorkerJob>,
    job_rx: AsyncMutex<mpsc::Receiver<WorkerJob>>,
    inbound_tx: mpsc::Sender<InboundJob>,
    inbound_rx: AsyncMutex<mpsc::Receiver<InboundJob>>,
    queue_capacity: usize,
    dynamic_config: Arc<DynamicConfigCell>,
    counters: Arc<Counters>,
    drain: Arc<DrainFlag>,
}

impl SendWorker {
    pub fn new(
        index: usize,
        clock_identity: ClockIdentity,
        port_number: u16,
        static_config: &StaticConfig,
        event_socket: std::net::UdpSocket,
        general_socket: std::net::UdpSocket,
        dynamic_config: Arc<DynamicConfigCell>,
        counters: Arc<Counters>,
        drain: Arc<DrainFlag>,
    ) -> Result<Self> {
        let event_socket = TimestampedSocket::new(
            event_socket,
            &static_config.interface,
            static_config.timestamp_mode,
            static_config.attempts_txts,
            static_config.timeout_txts,
        )?;
        let general_socket = TimestampedSocket::new(
            general_socket,
            &static_config.interface,
            static_config.timestamp_mode,
            static_config.attempts_txts,
            static_config.timeout_txts,
        )?;
        let (job_tx, job_rx) = mpsc::channel(static_config.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(static_config.queue_capacity);
        Ok(Self {
            index,
            source_identity: PortIdentity::new(clock_identity, port_number),
            domain_number: 0,
            event_socket,
            general_socket,
            clients: AsyncMutex::new(HashMap::new()),
            job_tx,
            job_rx: AsyncMutex::new(job_rx),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            queue_capacity: static_config.queue_capacity,
            dynamic_config,
            counters,
            drain,
        })
    }

    pub fn job_sink(&self) -> mpsc::Sender<WorkerJob> {
        self.job_tx.clone()
    }

    /// Channel the listener hands DelayReq/SIGNALING datagrams to. Kept
    /// separate from `job_sink` so a Signaling/DelayReq job can never land in
    /// the primary tick queue, matching this worker's own dispatch rule that
    /// only the secondary queue ever feeds `handle_delay_req`/`handle_signaling`.
    pub fn inbound_sink(&self) -> mpsc::Sender<InboundJob> {
        self.inbound_tx.clone()
    }

    /// Number of live subscriptions this worker carries, for the periodic
    /// metrics snapshot and for the drain/reload inventory sweep. Acts as a
    /// backstop for a subscription whose ticker task never got to run its
    /// self-expiry check (e.g. the worker was never polled); the common path
    /// removes a subscription via its own `WorkerJob::Expired` notice.
    pub async fn inventory_clients(&self, now: std::time::Instant) -> usize {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        let mut expired = Vec::new();
        for (key, sub) in clients.iter() {
            if sub.is_expired(now) {
                expired.push(*key);
            }
        }
        for key in &expired {
            if let Some(sub) = clients.remove(key) {
                sub.stop();
                self.counters.record_subscription_expired();
            }
        }
        tracing::debug!(
            worker = self.index,
            expired = expired.len(),
            "inventoried worker client map"
        );
        before - expired.len()
    }

    async fn send_sync_and_follow_up(&self, job: &crate::subscription::SendJob) {
        let mut header = PtpHeader::new(MessageType::Sync, self.source_identity, self.domain_number);
        header.sequence_id = job.sequence_id;
        header.flags = crate::codec::Flags::TWO_STEP;

        let mut buf = [0u8; 64];
        let body = SyncBody::default();
        let body_len = match body.encode(&mut buf[crate::codec::WireHeader::SIZE..]) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode Sync body");
                return;
            }
        };
        if let Err(err) = header.encode(body_len, &mut buf) {
            tracing::warn!(error = %err, "failed to encode Sync header");
            return;
        }
        let total = crate::codec::WireHeader::SIZE + body_len;

        let tx_timestamp = match self.event_socket.send_and_timestamp(&buf[..total], job.addr).await {
            Ok(ts) => ts,
            Err(Error::TxTimestampMissing) => {
                // Sync itself made it onto the wire; only the TX timestamp
                // read failed, so Sync still counts as sent and FollowUp is
                // skipped for this round.
                self.counters.record_tx(MessageType::Sync);
                self.counters.record_txts_missing();
                return;
            }
            Err(err) => {
                tracing::warn!(client = %job.client, error = %err, "Sync send failed");
                return;
            }
        };
        self.counters.record_tx(MessageType::Sync);

        let corrected = if self.event_socket.mode().needs_utc_correction() {
            tx_timestamp.apply_utc_offset(self.dynamic_config.get().utc_offset_seconds)
        } else {
            tx_timestamp
        };

        let mut fup_header =
            PtpHeader::new(MessageType::FollowUp, self.source_identity, self.domain_number);
        fup_header.sequence_id = job.sequence_id;
        let fup_body = FollowUpBody {
            precise_origin_timestamp: corrected,
        };
        let mut fbuf = [0u8; 64];
        let fbody_len = match fup_body.encode(&mut fbuf[crate::codec::WireHeader::SIZE..]) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode FollowUp body");
                return;
            }
        };
        if let Err(err) = fup_header.encode(fbody_len, &mut fbuf) {
            tracing::warn!(error = %err, "failed to encode FollowUp header");
            return;
        }
        let ftotal = crate::codec::WireHeader::SIZE + fbody_len;
        match self.general_socket.send_and_timestamp(&fbuf[..ftotal], job.addr).await {
            Ok(_) => self.counters.record_tx(MessageType::FollowUp),
            Err(err) => tracing::warn!(client = %job.client, error = %err, "FollowUp send failed"),
        }
    }

    async fn send_announce(&self, job: &crate::subscription::SendJob) {
        let dyn_cfg = self.dynamic_config.get();
        let mut header =
            PtpHeader::new(MessageType::Announce, self.source_identity, self.domain_number);
        header.sequence_id = job.sequence_id;
        let body = AnnounceBody {
            origin_timestamp: PtpTimestamp::from_system_time(std::time::SystemTime::now()),
            current_utc_offset: dyn_cfg.utc_offset_seconds,
            grandmaster_priority1: dyn_cfg.priority1,
            grandmaster_clock_quality_class: dyn_cfg.clock_class,
            grandmaster_clock_quality_accuracy: dyn_cfg.clock_accuracy,
            grandmaster_clock_quality_log_variance: dyn_cfg.clock_log_variance,
            grandmaster_priority2: dyn_cfg.priority2,
            grandmaster_identity: self.source_identity.clock_identity,
            steps_removed: 0,
            time_source: dyn_cfg.time_source,
        };
        let mut buf = [0u8; 64];
        let body_len = match body.encode(&mut buf[crate::codec::WireHeader::SIZE..]) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode Announce body");
                return;
            }
        };
        if let Err(err) = header.encode(body_len, &mut buf) {
            tracing::warn!(error = %err, "failed to encode Announce header");
            return;
        }
        let total = crate::codec::WireHeader::SIZE + body_len;
        match self.general_socket.send_and_timestamp(&buf[..total], job.addr).await {
            Ok(_) => self.counters.record_tx(MessageType::Announce),
            Err(err) => tracing::warn!(client = %job.client, error = %err, "Announce send failed"),
        }
    }

    pub async fn handle_send_job(&self, job: crate::subscription::SendJob) {
        match job.kind {
            MessageType::Sync => self.send_sync_and_follow_up(&job).await,
            MessageType::Announce => self.send_announce(&job).await,
            other => {
                tracing::debug!(?other, "ticker produced a job for a non-ticked kind");
            }
        }
    }

    /// A subscription's own ticker detected it outlived its grant: remove it
    /// from the map (if still present — a concurrent explicit cancel may
    /// have already done so) and send the client its exit cancellation.
    async fn handle_expired(&self, client: PortIdentity, addr: SocketAddr, kind: MessageType) {
        let removed = {
            let mut clients = self.clients.lock().await;
            clients.remove(&(kind, client))
        };
        if removed.is_none() {
            return;
        }
        self.counters.record_subscription_expired();
        let reply = SignalingBody {
            target_port_identity: client,
            tlvs: vec![Tlv::CancelUnicastTransmission { message_type: kind as u8 }],
        };
        self.reply_signaling(addr, 0, reply).await;
        self.counters.record_cancel();
        tracing::debug!(%client, ?kind, "subscription expired naturally, cancel sent");
    }

    /// Answer a DelayReq, but only if the client holds a live `DelayResp` grant.
    pub async fn handle_delay_req(&self, job: DelayReqJob) {
        self.counters.record_rx(MessageType::DelayReq);
        let has_grant = {
            let clients = self.clients.lock().await;
            clients.contains_key(&(MessageType::DelayResp, job.client))
        };
        if !has_grant {
            tracing::debug!(client = %job.client, "DelayReq from client with no DelayResp grant, dropping");
            return;
        }

        let mut header =
            PtpHeader::new(MessageType::DelayResp, self.source_identity, self.domain_number);
        header.sequence_id = job.sequence_id;
        let body = DelayRespBody {
            receive_timestamp: job.rx_timestamp,
            requesting_port_identity: job.client,
        };
        let mut buf = [0u8; 64];
        let body_len = match body.encode(&mut buf[crate::codec::WireHeader::SIZE..]) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode DelayResp body");
                return;
            }
        };
        if let Err(err) = header.encode(body_len, &mut buf) {
            tracing::warn!(error = %err, "failed to encode DelayResp header");
            return;
        }
        let total = crate::codec::WireHeader::SIZE + body_len;
        match self.general_socket.send_and_timestamp(&buf[..total], job.addr).await {
            Ok(_) => self.counters.record_tx(MessageType::DelayResp),
            Err(err) => tracing::warn!(error = %err, "failed to send DelayResp"),
        }
    }

    async fn reply_signaling(&self, addr: SocketAddr, sequence_id: u16, body: SignalingBody) {
        let mut header =
            PtpHeader::new(MessageType::Signaling, self.source_identity, self.domain_number);
        header.sequence_id = sequence_id;
        let mut buf = vec![0u8; crate::codec::WireHeader::SIZE + body.encoded_len()];
        let body_len = match body.encode(&mut buf[crate::codec::WireHeader::SIZE..]) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode SIGNALING reply body");
                return;
            }
        };
        if let Err(err) = header.encode(body_len, &mut buf) {
            tracing::warn!(error = %err, "failed to encode SIGNALING reply header");
            return;
        }
        let total = crate::codec::WireHeader::SIZE + body_len;
        match self.general_socket.send_and_timestamp(&buf[..total], addr).await {
            Ok(_) => self.counters.record_tx(MessageType::Signaling),
            Err(err) => tracing::warn!(error = %err, "failed to send SIGNALING reply"),
        }
    }

    pub async fn handle_signaling(&self, job: SignalingJob) {
        self.counters.record_rx(MessageType::Signaling);
        match job {
            SignalingJob::Request {
                client,
                addr,
                sequence_id,
                message_type,
                log_inter_message_period,
                duration_field,
            } => self
                .handle_request(client, addr, sequence_id, message_type, log_inter_message_period, duration_field)
                .await,
            SignalingJob::Cancel {
                client,
                addr,
                sequence_id,
                message_type,
            } => self.handle_cancel(client, addr, sequence_id, message_type).await,
        }
    }

    async fn handle_request(
        &self,
        client: PortIdentity,
        addr: SocketAddr,
        sequence_id: u16,
        message_type: u8,
        requested_log_interval: i8,
        requested_duration: u32,
    ) {
        let kind = match MessageType::from_nibble(message_type) {
            Ok(k) => k,
            Err(_) => {
                tracing::debug!(message_type, "SIGNALING request for unrecognized message type");
                return;
            }
        };

        let dyn_cfg = self.dynamic_config.get();
        let requested_interval = crate::codec::interval_from_log(requested_log_interval);
        let requested_duration_secs = std::time::Duration::from_secs(requested_duration as u64);
        let granted = requested_interval >= dyn_cfg.min_subscription_interval
            && requested_duration_secs <= dyn_cfg.max_subscription_duration
            && matches!(kind, MessageType::Sync | MessageType::Announce | MessageType::DelayResp)
            && !self.drain.is_draining();

        if !granted {
            self.counters.record_grant_denied();
            let reply = SignalingBody {
                target_port_identity: client,
                tlvs: vec![Tlv::GrantUnicastTransmission {
                    message_type,
                    log_inter_message_period: requested_log_interval,
                    duration_field: 0,
                    renewal: false,
                }],
            };
            self.reply_signaling(addr, sequence_id, reply).await;
            return;
        }

        let duration = requested_duration_secs;
        let key = (kind, client);
        let renewal = {
            let mut clients = self.clients.lock().await;
            if let Some(existing) = clients.get(&key) {
                existing.set_addr(addr);
                existing.set_expire(duration);
                existing.set_interval(requested_interval, requested_log_interval);
                true
            } else {
                let sub = Arc::new(Subscription::new(
                    client,
                    addr,
                    kind,
                    requested_interval,
                    duration,
                    requested_log_interval,
                ));
                sub.start(self.job_tx.clone());
                clients.insert(key, sub);
                self.counters.observe_queue_depth(clients.len());
                false
            }
        };

        self.counters.record_grant_issued();
        let reply = SignalingBody {
            target_port_identity: client,
            tlvs: vec![Tlv::GrantUnicastTransmission {
                message_type,
                log_inter_message_period: requested_log_interval,
                duration_field: duration.as_secs() as u32,
                renewal,
            }],
        };
        self.reply_signaling(addr, sequence_id, reply).await;
    }

    async fn handle_cancel(
        &self,
        client: PortIdentity,
        addr: SocketAddr,
        sequence_id: u16,
        message_type: u8,
    ) {
        let kind = match MessageType::from_nibble(message_type) {
            Ok(k) => k,
            Err(_) => return,
        };
        let key = (kind, client);
        let mut clients = self.clients.lock().await;
        if let Some(sub) = clients.remove(&key) {
            sub.stop();
            self.counters.record_cancel();
        }
        drop(clients);

        let reply = SignalingBody {
            target_port_identity: client,
            tlvs: vec![Tlv::AcknowledgeCancelUnicastTransmission { message_type }],
        };
        self.reply_signaling(addr, sequence_id, reply).await;
    }

    /// Cancel every subscription this worker holds, notifying each client
    /// with a server-initiated SIGNALING cancel before removing it. Called
    /// when the server transitions into `Draining`.
    pub async fn drain_clients(&self) {
        let drained: Vec<Arc<Subscription>> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, sub)| sub).collect()
        };
        for sub in drained {
            sub.stop();
            let reply = SignalingBody {
                target_port_identity: sub.client,
                tlvs: vec![Tlv::CancelUnicastTransmission {
                    message_type: sub.kind as u8,
                }],
            };
            // No client-supplied sequence_id to echo: this cancel is
            // server-initiated, not a reply to a request.
            self.reply_signaling(sub.addr(), 0, reply).await;
            self.counters.record_cancel();
        }
    }

    /// Drive this worker's two queues until `stop` fires: the primary queue
    /// (ticked Sync/Announce sends and self-reported expiry) and the
    /// secondary queue (DelayReq/SIGNALING the listener routed here). Both
    /// are drained from the same `select!` so every send this worker issues
    /// — ticked or request-driven — goes out serialized on the same FDs.
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut job_rx = self.job_rx.lock().await;
        let mut inbound_rx = self.inbound_rx.lock().await;
        loop {
            tokio::select! {
                Some(job) = job_rx.recv() => {
                    match job {
                        WorkerJob::Send(job) => self.handle_send_job(job).await,
                        WorkerJob::Expired { client, addr, kind } => {
                            self.handle_expired(client, addr, kind).await
                        }
                    }
                }
                Some(job) = inbound_rx.recv() => {
                    match job {
                        InboundJob::DelayReq(job) => self.handle_delay_req(job).await,
                        InboundJob::Signaling(job) => self.handle_signaling(job).await,
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}
