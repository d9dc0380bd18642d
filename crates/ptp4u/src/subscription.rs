//! Per-client subscription: the state SIGNALING negotiation creates, renews,
//! and tears down, and the ticker that turns a granted interval into actual
//! Sync/Announce sends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::codec::MessageType;
use crate::identity::PortIdentity;

/// What a subscription sends on each tick: enough to build a Sync+FollowUp
/// pair, a bare Announce, or nothing (DelayResp/Signaling are answered
/// per-request by the worker and never ticked).
#[derive(Debug, Clone)]
pub struct SendJob {
    pub client: PortIdentity,
    pub addr: SocketAddr,
    pub kind: MessageType,
    pub sequence_id: u16,
}

/// What flows through a worker's primary job channel: either a ticked send,
/// or an expiry notice a subscription's own ticker raises when it finds
/// itself past `expire` instead of enqueueing another send.
#[derive(Debug, Clone)]
pub enum WorkerJob {
    Send(SendJob),
    Expired {
        client: PortIdentity,
        addr: SocketAddr,
        kind: MessageType,
    },
}

/// One (client, message kind) grant. `Announce` and `Sync` subscriptions run
/// their own ticker; `DelayResp` subscriptions exist only to remember the
/// grant was made (spec.md's DelayReq dispatch rule checks for it) and never
/// tick.
pub struct Subscription {
    pub client: PortIdentity,
    pub kind: MessageType,
    state: Mutex<SubscriptionState>,
    sequence_id: AtomicU16,
    stop: watch::Sender<bool>,
}

struct SubscriptionState {
    /// General-port client socket address (`gclisa`). Rewritten on a renewal
    /// grant so a client that rebinds to a new ephemeral source port (NAT,
    /// interface flap) keeps receiving traffic rather than being sent to a
    /// stale address forever.
    addr: SocketAddr,
    interval: Duration,
    expires_at: Instant,
    /// The `logInterMessagePeriod` last granted to this client for this
    /// subscription kind; re-sent verbatim on a renewal grant rather than
    /// recomputed, so a renewed grant never silently narrows or widens the
    /// interval the client already agreed to.
    granted_log_interval: i8,
    running: bool,
}

impl Subscription {
    pub fn new(
        client: PortIdentity,
        addr: SocketAddr,
        kind: MessageType,
        interval: Duration,
        duration: Duration,
        granted_log_interval: i8,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            client,
            kind,
            state: Mutex::new(SubscriptionState {
                addr,
                interval,
                expires_at: Instant::now() + duration,
                granted_log_interval,
                running: false,
            }),
            sequence_id: AtomicU16::new(0),
            stop,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.state.lock().expect("subscription mutex poisoned").addr
    }

    /// Rewrite the client address a renewal grant is allowed to update (see
    /// `SubscriptionState::addr`'s doc comment for the NAT-rebinding rationale).
    pub fn set_addr(&self, addr: SocketAddr) {
        self.state.lock().expect("subscription mutex poisoned").addr = addr;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.state.lock().expect("subscription mutex poisoned").expires_at
    }

    pub fn granted_log_interval(&self) -> i8 {
        self.state.lock().expect("subscription mutex poisoned").granted_log_interval
    }

    /// Extend the grant by `duration` from now, keeping the interval
    /// unchanged. Called on a renewal SIGNALING request for the same kind.
    pub fn set_expire(&self, duration: Duration) {
        let mut state = self.state.lock().expect("subscription mutex poisoned");
        state.expires_at = Instant::now() + duration;
    }

    /// Replace the send interval (a renewal is allowed to request a
    /// different period than the original grant).
    pub fn set_interval(&self, interval: Duration, granted_log_interval: i8) {
        let mut state = self.state.lock().expect("subscription mutex poisoned");
        state.interval = interval;
        state.granted_log_interval = granted_log_interval;
    }

    fn next_sequence_id(&self) -> u16 {
        self.sequence_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn the ticker task for `Announce`/`Sync` subscriptions. Ticks fire
    /// immediately on the first iteration (fast-start) rather than waiting a
    /// full interval, so a freshly granted client doesn't sit idle. Each tick
    /// re-checks `is_expired`: once expired, the ticker stops enqueueing
    /// sends, reports itself as no longer running, and hands the worker a
    /// `WorkerJob::Expired` so it can remove the map entry and emit the
    /// client's cancellation SIGNALING — the same exit contract an explicit
    /// `stop()` gets, but self-triggered. `sink` is the worker-owned channel
    /// jobs are handed off to for the actual send + timestamp work.
    pub fn start(self: &std::sync::Arc<Self>, sink: tokio::sync::mpsc::Sender<WorkerJob>) {
        if matches!(self.kind, MessageType::DelayResp | MessageType::Signaling) {
            return;
        }
        {
            let mut state = self.state.lock().expect("subscription mutex poisoned");
            if state.running {
                return;
            }
            state.running = true;
        }

        let this = std::sync::Arc::clone(self);
        let mut stop_rx = this.stop.subscribe();
        tokio::spawn(async move {
            let interval = { this.state.lock().expect("subscription mutex poisoned").interval };
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if this.is_expired(Instant::now()) {
                            this.state.lock().expect("subscription mutex poisoned").running = false;
                            let _ = sink.send(WorkerJob::Expired {
                                client: this.client,
                                addr: this.addr(),
                                kind: this.kind,
                            }).await;
                            break;
                        }
                        let job = SendJob {
                            client: this.client,
                            addr: this.addr(),
                            kind: this.kind,
                            sequence_id: this.next_sequence_id(),
                        };
                        if sink.send(WorkerJob::Send(job)).await.is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Signal the ticker task to exit. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
        self.state.lock().expect("subscription mutex poisoned").running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ClockIdentity;

    fn client() -> PortIdentity {
        PortIdentity::new(ClockIdentity(0x1122334455667788), 1)
    }

    #[test]
    fn expiry_respects_granted_duration() {
        let sub = Subscription::new(
            client(),
            "127.0.0.1:319".parse().unwrap(),
            MessageType::Announce,
            Duration::from_secs(1),
            Duration::from_millis(10),
            0,
        );
        assert!(!sub.is_expired(Instant::now()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(sub.is_expired(Instant::now()));
    }

    #[test]
    fn renewal_extends_expiry_without_losing_interval() {
        let sub = Subscription::new(
            client(),
            "127.0.0.1:319".parse().unwrap(),
            MessageType::Sync,
            Duration::from_secs(1),
            Duration::from_millis(10),
            0,
        );
        sub.set_expire(Duration::from_secs(60));
        assert!(!sub.is_expired(Instant::now()));
    }

    #[test]
    fn set_addr_rewrites_the_client_address() {
        let sub = Subscription::new(
            client(),
            "127.0.0.1:319".parse().unwrap(),
            MessageType::Sync,
            Duration::from_secs(1),
            Duration::from_secs(60),
            0,
        );
        let rebound: SocketAddr = "127.0.0.1:4800".parse().unwrap();
        sub.set_addr(rebound);
        assert_eq!(sub.addr(), rebound);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_delivers_jobs_until_stopped() {
        let sub = std::sync::Arc::new(Subscription::new(
            client(),
            "127.0.0.1:319".parse().unwrap(),
            MessageType::Announce,
            Duration::from_millis(10),
            Duration::from_secs(60),
            0,
        ));
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        sub.start(tx);

        tokio::time::advance(Duration::from_millis(35)).await;
        let job = match rx.recv().await.unwrap() {
            WorkerJob::Send(job) => job,
            other => panic!("expected a Send job, got {other:?}"),
        };
        assert_eq!(job.kind, MessageType::Announce);

        sub.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_self_reports_expiry_instead_of_ticking_forever() {
        let sub = std::sync::Arc::new(Subscription::new(
            client(),
            "127.0.0.1:319".parse().unwrap(),
            MessageType::Announce,
            Duration::from_millis(10),
            Duration::from_millis(15),
            0,
        ));
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        sub.start(tx);

        // First tick fires immediately (fast-start) and is still live.
        match rx.recv().await.unwrap() {
            WorkerJob::Send(_) => {}
            other => panic!("expected the fast-start Send job, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(20)).await;
        match rx.recv().await.unwrap() {
            WorkerJob::Expired { kind, .. } => assert_eq!(kind, MessageType::Announce),
            other => panic!("expected an Expired job once past the grant, got {other:?}"),
        }

        // The ticker task has exited and dropped its sender; the channel is
        // now closed rather than merely idle.
        assert!(rx.recv().await.is_none());
    }
}
