//! Dual-port receive loop: classifies inbound datagrams and routes them to
//! the owning send worker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::{Message, Tlv};
use crate::metrics::Counters;
use crate::shard::find_worker;
use crate::timestamping::TimestampedSocket;
use crate::worker::{DelayReqJob, InboundJob, SendWorker, SignalingJob};

/// Shared drain flag: set by the [`crate::server::Server`], read by every
/// listener on every received datagram. A plain atomic rather than a
/// `watch` channel because listeners only ever need the latest value, never
/// a notification of the transition.
#[derive(Debug, Default)]
pub struct DrainFlag(AtomicBool);

impl DrainFlag {
    pub fn is_draining(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, draining: bool) {
        self.0.store(draining, Ordering::Relaxed);
    }
}

/// Which of the two PTP ports a listener is bound to. The event port carries
/// RX timestamps and is the only one drain silences; the general port always
/// keeps processing so SIGNALING denials remain visible during drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Event,
    General,
}

/// Owns one receive socket and forwards decoded messages to the worker pool.
pub struct Listener {
    role: PortRole,
    socket: TimestampedSocket,
    workers: Arc<Vec<Arc<SendWorker>>>,
    drain: Arc<DrainFlag>,
    counters: Arc<Counters>,
}

impl Listener {
    pub fn new(
        role: PortRole,
        socket: TimestampedSocket,
        workers: Arc<Vec<Arc<SendWorker>>>,
        drain: Arc<DrainFlag>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            role,
            socket,
            workers,
            drain,
            counters,
        }
    }

    /// Run the receive loop until `stop` fires or the socket errors out.
    pub async fn run(self, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut buf = [0u8; 256];
        loop {
            tokio::select! {
                result = self.socket.recv_timestamped(&mut buf) => {
                    match result {
                        Ok((n, addr, rx_timestamp)) => {
                            self.handle_datagram(&buf[..n], addr, rx_timestamp).await;
                        }
                        Err(err) => {
                            tracing::warn!(role = ?self.role, error = %err, "recv failed on listener socket");
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        addr: SocketAddr,
        rx_timestamp: crate::codec::PtpTimestamp,
    ) {
        if self.role == PortRole::Event && self.drain.is_draining() {
            tracing::debug!(%addr, "dropping event-port traffic while draining");
            return;
        }

        let message = match Message::decode(data) {
            Ok(m) => m,
            Err(err) => {
                self.counters.record_read_error();
                tracing::debug!(%addr, error = %err, "failed to decode inbound PTP datagram");
                return;
            }
        };

        let client = message.source();
        let worker = &self.workers[find_worker(client, self.workers.len())];

        // Routed through the worker's inbound queue, not called directly: the
        // worker's own `run` loop serializes these against its ticked sends
        // so every reply on a given FD goes out from a single task.
        let inbound = worker.inbound_sink();
        match message {
            Message::DelayReq(header, _body) => {
                let job = InboundJob::DelayReq(DelayReqJob {
                    client,
                    addr,
                    sequence_id: header.sequence_id,
                    rx_timestamp,
                });
                if inbound.send(job).await.is_err() {
                    tracing::warn!(%addr, "worker inbound queue closed, dropping DelayReq");
                }
            }
            Message::Signaling(header, body) => {
                for tlv in body.tlvs {
                    match tlv {
                        Tlv::RequestUnicastTransmission {
                            message_type,
                            log_inter_message_period,
                            duration_field,
                        } => {
                            let job = InboundJob::Signaling(SignalingJob::Request {
                                client,
                                addr,
                                sequence_id: header.sequence_id,
                                message_type,
                                log_inter_message_period,
                                duration_field,
                            });
                            if inbound.send(job).await.is_err() {
                                tracing::warn!(%addr, "worker inbound queue closed, dropping SIGNALING request");
                            }
                        }
                        Tlv::CancelUnicastTransmission { message_type } => {
                            let job = InboundJob::Signaling(SignalingJob::Cancel {
                                client,
                                addr,
                                sequence_id: header.sequence_id,
                                message_type,
                            });
                            if inbound.send(job).await.is_err() {
                                tracing::warn!(%addr, "worker inbound queue closed, dropping SIGNALING cancel");
                            }
                        }
                        other => {
                            tracing::debug!(?other, %addr, "ignoring non-request/cancel SIGNALING TLV");
                        }
                    }
                }
            }
            other => {
                tracing::debug!(kind = ?other.header().message_type, %addr, "dropping message kind not handled by the listener");
            }
        }
    }
}
