//! Aggregate counters, owned by the [`crate::server::Server`] and shared
//! (`Arc`) into every listener and worker. Plain atomics rather than a
//! metrics-crate registry: this crate treats metrics export as an external
//! collaborator's concern and only needs a cheap, lock-free sink to snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::MessageType;

#[derive(Debug, Default)]
struct PerMessageCounters {
    sync: AtomicU64,
    delay_req: AtomicU64,
    follow_up: AtomicU64,
    delay_resp: AtomicU64,
    announce: AtomicU64,
    signaling: AtomicU64,
}

impl PerMessageCounters {
    fn get(&self, kind: MessageType) -> &AtomicU64 {
        match kind {
            MessageType::Sync => &self.sync,
            MessageType::DelayReq => &self.delay_req,
            MessageType::FollowUp => &self.follow_up,
            MessageType::DelayResp => &self.delay_resp,
            MessageType::Announce => &self.announce,
            MessageType::Signaling => &self.signaling,
        }
    }

    fn snapshot(&self) -> PerMessageSnapshot {
        PerMessageSnapshot {
            sync: self.sync.load(Ordering::Relaxed),
            delay_req: self.delay_req.load(Ordering::Relaxed),
            follow_up: self.follow_up.load(Ordering::Relaxed),
            delay_resp: self.delay_resp.load(Ordering::Relaxed),
            announce: self.announce.load(Ordering::Relaxed),
            signaling: self.signaling.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time read of [`PerMessageCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerMessageSnapshot {
    pub sync: u64,
    pub delay_req: u64,
    pub follow_up: u64,
    pub delay_resp: u64,
    pub announce: u64,
    pub signaling: u64,
}

/// Server-wide counters: RX/TX per message kind, grant/cancel outcomes, TX
/// timestamp misses, and the high-water mark across all worker job queues.
#[derive(Debug, Default)]
pub struct Counters {
    rx: PerMessageCounters,
    tx: PerMessageCounters,
    grants_issued: AtomicU64,
    grants_denied: AtomicU64,
    cancels_processed: AtomicU64,
    subscriptions_expired: AtomicU64,
    txts_missing: AtomicU64,
    txts_attempts_max: AtomicU64,
    queue_high_water_mark: AtomicU64,
    draining: AtomicU64,
    reloads: AtomicU64,
    read_errors: AtomicU64,
}

impl Counters {
    pub fn record_rx(&self, kind: MessageType) {
        self.rx.get(kind).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx(&self, kind: MessageType) {
        self.tx.get(kind).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant_issued(&self) {
        self.grants_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant_denied(&self) {
        self.grants_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel(&self) {
        self.cancels_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_expired(&self) {
        self.subscriptions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txts_missing(&self) {
        self.txts_missing.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the largest retry-attempt count observed across all TX timestamp
    /// reads, for alerting on a NIC/driver slowly losing timestamping support.
    pub fn observe_txts_attempts(&self, attempts: u32) {
        self.txts_attempts_max
            .fetch_max(attempts as u64, Ordering::Relaxed);
    }

    pub fn observe_queue_depth(&self, depth: usize) {
        self.queue_high_water_mark
            .fetch_max(depth as u64, Ordering::Relaxed);
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining as u64, Ordering::Relaxed);
    }

    pub fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram failed to decode (truncated or unrecognized framing).
    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            rx: self.rx.snapshot(),
            tx: self.tx.snapshot(),
            grants_issued: self.grants_issued.load(Ordering::Relaxed),
            grants_denied: self.grants_denied.load(Ordering::Relaxed),
            cancels_processed: self.cancels_processed.load(Ordering::Relaxed),
            subscriptions_expired: self.subscriptions_expired.load(Ordering::Relaxed),
            txts_missing: self.txts_missing.load(Ordering::Relaxed),
            txts_attempts_max: self.txts_attempts_max.load(Ordering::Relaxed),
            queue_high_water_mark: self.queue_high_water_mark.load(Ordering::Relaxed),
            draining: self.draining.load(Ordering::Relaxed) != 0,
            reloads: self.reloads.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time read of [`Counters`], cheap to log or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub rx: PerMessageSnapshot,
    pub tx: PerMessageSnapshot,
    pub grants_issued: u64,
    pub grants_denied: u64,
    pub cancels_processed: u64,
    pub subscriptions_expired: u64,
    pub txts_missing: u64,
    pub txts_attempts_max: u64,
    pub queue_high_water_mark: u64,
    pub draining: bool,
    pub reloads: u64,
    pub read_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_message_type() {
        let counters = Counters::default();
        counters.record_rx(MessageType::Sync);
        counters.record_rx(MessageType::Sync);
        counters.record_rx(MessageType::Announce);
        let snap = counters.snapshot();
        assert_eq!(snap.rx.sync, 2);
        assert_eq!(snap.rx.announce, 1);
        assert_eq!(snap.rx.delay_req, 0);
    }

    #[test]
    fn queue_high_water_mark_keeps_the_max() {
        let counters = Counters::default();
        counters.observe_queue_depth(3);
        counters.observe_queue_depth(1);
        counters.observe_queue_depth(7);
        assert_eq!(counters.snapshot().queue_high_water_mark, 7);
    }
}
