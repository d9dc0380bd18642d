//! Server controller: derives the process `ClockIdentity`, stands up the
//! worker pool and dual-port listeners, and exposes the `start`/`drain`/
//! `undrain`/`reload_from_str`/`shutdown` lifecycle an embedding binary
//! wires up to `clap` and `tokio::signal`.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{DynamicConfig, DynamicConfigCell, StaticConfig};
use crate::error::{Error, Result};
use crate::identity::{interface_mac, ClockIdentity};
use crate::listener::{DrainFlag, Listener, PortRole};
use crate::metrics::{Counters, CountersSnapshot};
use crate::worker::SendWorker;

/// A predicate the drain-check task consults on every tick; any predicate
/// returning `true` puts the server into `Draining`. External backends (BGP
/// withdrawal, VIP health) register these — this crate only runs the list.
pub type DrainPredicate = Box<dyn Fn() -> bool + Send + Sync>;

struct Handles {
    worker_stop: watch::Sender<bool>,
    listener_stop: watch::Sender<bool>,
    background_stop: watch::Sender<bool>,
}

/// Owns every long-lived task of a running server. Constructed by
/// [`Server::start`]; dropped (after [`Server::shutdown`]) once every
/// spawned task has observed its stop signal.
pub struct Server {
    static_config: StaticConfig,
    clock_identity: ClockIdentity,
    workers: Arc<Vec<Arc<SendWorker>>>,
    dynamic_config: Arc<DynamicConfigCell>,
    counters: Arc<Counters>,
    drain: Arc<DrainFlag>,
    drain_predicates: Vec<DrainPredicate>,
    handles: Option<Handles>,
}

impl Server {
    /// Derive the clock identity, open every socket, and build (but do not
    /// yet run) the worker pool. Call [`Server::start`] to spawn the tasks.
    pub fn new(static_config: StaticConfig) -> Result<Self> {
        static_config.validate()?;
        let mac = interface_mac(&static_config.interface)?;
        let clock_identity = ClockIdentity::from_mac(mac);
        let dynamic_config = Arc::new(DynamicConfigCell::new(DynamicConfig::default()));
        let counters = Arc::new(Counters::default());
        let drain = Arc::new(DrainFlag::default());

        let mut workers = Vec::with_capacity(static_config.worker_count);
        for index in 0..static_config.worker_count {
            let event_socket = bind_ephemeral(static_config.ip, static_config.dscp_tos_byte())?;
            let general_socket = bind_ephemeral(static_config.ip, static_config.dscp_tos_byte())?;
            let worker = SendWorker::new(
                index,
                clock_identity,
                event_socket.local_addr()?.port(),
                &static_config,
                event_socket,
                general_socket,
                Arc::clone(&dynamic_config),
                Arc::clone(&counters),
                Arc::clone(&drain),
            )?;
            workers.push(Arc::new(worker));
        }

        Ok(Self {
            static_config,
            clock_identity,
            workers: Arc::new(workers),
            dynamic_config,
            counters,
            drain,
            drain_predicates: Vec::new(),
            handles: None,
        })
    }

    pub fn clock_identity(&self) -> ClockIdentity {
        self.clock_identity
    }

    /// Register an external drain predicate, consulted on every
    /// `drain_check_interval` tick by the background task `start` spawns.
    pub fn add_drain_predicate(&mut self, predicate: DrainPredicate) {
        self.drain_predicates.push(predicate);
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// `{pid}\n`, written to `static_config.pid_file` by [`Server::start`]
    /// and handed back so an embedding binary can re-derive it without
    /// re-reading the file.
    pub fn pid_file_contents() -> String {
        format!("{}\n", std::process::id())
    }

    /// Bind the event/general listener sockets, spawn every worker and
    /// listener task, and spawn the background drain-check and
    /// metrics-snapshot loops.
    pub async fn start(&mut self) -> Result<()> {
        if self.handles.is_some() {
            tracing::warn!("Server::start called on an already-running server");
            return Ok(());
        }

        tokio::fs::write(&self.static_config.pid_file, Self::pid_file_contents())
            .await
            .map_err(Error::Io)?;

        let event_addr = SocketAddr::new(self.static_config.ip, self.static_config.event_port);
        let general_addr = SocketAddr::new(self.static_config.ip, self.static_config.general_port);
        let event_listener_socket = bind_with_dscp(event_addr, self.static_config.dscp_tos_byte())?;
        let general_listener_socket =
            bind_with_dscp(general_addr, self.static_config.dscp_tos_byte())?;

        let event_socket = crate::timestamping::TimestampedSocket::new(
            event_listener_socket,
            &self.static_config.interface,
            self.static_config.timestamp_mode,
            self.static_config.attempts_txts,
            self.static_config.timeout_txts,
        )?;
        let general_socket = crate::timestamping::TimestampedSocket::new(
            general_listener_socket,
            &self.static_config.interface,
            self.static_config.timestamp_mode,
            self.static_config.attempts_txts,
            self.static_config.timeout_txts,
        )?;

        let (worker_stop, worker_stop_rx) = watch::channel(false);
        let (listener_stop, listener_stop_rx) = watch::channel(false);
        let (background_stop, background_stop_rx) = watch::channel(false);

        for worker in self.workers.iter() {
            let worker = Arc::clone(worker);
            let stop_rx = worker_stop_rx.clone();
            tokio::spawn(async move { worker.run(stop_rx).await });
        }

        let event_listener = Listener::new(
            PortRole::Event,
            event_socket,
            Arc::clone(&self.workers),
            Arc::clone(&self.drain),
            Arc::clone(&self.counters),
        );
        let general_listener = Listener::new(
            PortRole::General,
            general_socket,
            Arc::clone(&self.workers),
            Arc::clone(&self.drain),
            Arc::clone(&self.counters),
        );
        tokio::spawn(event_listener.run(listener_stop_rx.clone()));
        tokio::spawn(general_listener.run(listener_stop_rx));

        let predicates = std::mem::take(&mut self.drain_predicates);
        self.spawn_drain_check(predicates, background_stop_rx.clone());
        self.spawn_metrics_snapshot(background_stop_rx);

        self.handles = Some(Handles {
            worker_stop,
            listener_stop,
            background_stop,
        });

        tracing::info!(
            clock_identity = %self.clock_identity,
            workers = self.workers.len(),
            "ptp4u server started"
        );
        Ok(())
    }

    /// `tokio::time::Interval` cannot change its period once built, so both
    /// background loops below rebuild theirs whenever the reloaded
    /// `drain_check_interval`/`metrics_interval` no longer matches the one
    /// currently running.
    fn make_ticker(period: Duration) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker
    }

    fn spawn_drain_check(&self, predicates: Vec<DrainPredicate>, mut stop: watch::Receiver<bool>) {
        if predicates.is_empty() {
            return;
        }
        let dynamic_config = Arc::clone(&self.dynamic_config);
        let drain = Arc::clone(&self.drain);
        let counters = Arc::clone(&self.counters);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let mut period = dynamic_config.get().drain_check_interval;
            let mut ticker = Self::make_ticker(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = dynamic_config.get().drain_check_interval;
                        if current != period {
                            period = current;
                            ticker = Self::make_ticker(period);
                        }
                        let should_drain = predicates.iter().any(|predicate| predicate());
                        if should_drain != drain.is_draining() {
                            drain.set(should_drain);
                            counters.set_draining(should_drain);
                            tracing::info!(should_drain, "drain predicate transition");
                            if should_drain {
                                for worker in workers.iter() {
                                    worker.drain_clients().await;
                                }
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
        });
    }

    fn spawn_metrics_snapshot(&self, mut stop: watch::Receiver<bool>) {
        let dynamic_config = Arc::clone(&self.dynamic_config);
        let workers = Arc::clone(&self.workers);
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            let mut period = dynamic_config.get().metrics_interval;
            let mut ticker = Self::make_ticker(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = dynamic_config.get().metrics_interval;
                        if current != period {
                            period = current;
                            ticker = Self::make_ticker(period);
                        }
                        let now = std::time::Instant::now();
                        let mut live = 0usize;
                        for worker in workers.iter() {
                            live += worker.inventory_clients(now).await;
                        }
                        let snapshot = counters.snapshot();
                        tracing::info!(live_subscriptions = live, ?snapshot, "metrics snapshot");
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop accepting event-port traffic, deny new SIGNALING grants, and
    /// cancel every live subscription (each client gets a server-initiated
    /// SIGNALING cancel as its final message).
    pub fn drain(&self) {
        self.drain.set(true);
        self.counters.set_draining(true);
        tracing::info!("server entering drain state");
        self.spawn_client_drain();
    }

    fn spawn_client_drain(&self) {
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            for worker in workers.iter() {
                worker.drain_clients().await;
            }
        });
    }

    /// Resume accepting event-port traffic and granting new subscriptions.
    pub fn undrain(&self) {
        self.drain.set(false);
        self.counters.set_draining(false);
        tracing::info!("server leaving drain state");
    }

    /// Parse and hot-swap the dynamic config. Rejected (and logged, not
    /// applied) if the new values fail sanity validation.
    pub fn reload_from_str(&self, text: &str) -> Result<()> {
        let parsed = DynamicConfig::parse(text)?;
        self.dynamic_config.replace(parsed);
        self.counters.record_reload();
        tracing::info!("dynamic configuration reloaded");
        Ok(())
    }

    /// Stop every worker, listener, and background task, then remove the
    /// pid file. Idempotent if called before `start`.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(handles) = self.handles.take() {
            let _ = handles.worker_stop.send(true);
            let _ = handles.listener_stop.send(true);
            let _ = handles.background_stop.send(true);
        }
        match tokio::fs::remove_file(&self.static_config.pid_file).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::Io(err)),
        }
        tracing::info!("server shut down");
        Ok(())
    }
}

fn bind_with_dscp(addr: SocketAddr, tos: u8) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).map_err(Error::Io)?;
    apply_dscp(&socket, addr.ip(), tos)?;
    Ok(socket)
}

fn bind_ephemeral(ip: IpAddr, tos: u8) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).map_err(Error::Io)?;
    apply_dscp(&socket, ip, tos)?;
    Ok(socket)
}

/// Set `IP_TOS`/`IPV6_TCLASS` to `tos` (the DSCP value already shifted left
/// by 2, leaving the ECN bits at zero).
fn apply_dscp(socket: &UdpSocket, ip: IpAddr, tos: u8) -> Result<()> {
    let value = tos as libc::c_int;
    let (level, name) = match ip {
        IpAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_TOS),
        IpAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_TCLASS),
    };
    // SAFETY: `value` is a valid, fully-initialized `c_int` on the stack;
    // `setsockopt` only reads from it for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamping::TimestampMode;

    fn loopback_config(worker_count: usize) -> StaticConfig {
        StaticConfig {
            interface: "lo".into(),
            ip: "127.0.0.1".parse().unwrap(),
            event_port: 0,
            general_port: 1,
            worker_count,
            queue_capacity: 128,
            timestamp_mode: TimestampMode::Software,
            dscp: 46,
            pid_file: std::env::temp_dir().join("ptp4u-test.pid"),
            dynamic_config_path: None,
            attempts_txts: 10,
            timeout_txts: Duration::from_millis(5),
        }
    }

    #[test]
    #[ignore = "getifaddrs enumeration is environment-dependent; run under `integration`"]
    fn new_rejects_unknown_interface() {
        let mut cfg = loopback_config(1);
        cfg.interface = "ptp4u-does-not-exist".into();
        let err = Server::new(cfg).unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound(_)));
    }

    #[test]
    fn drain_toggles_counters_gauge() {
        let counters = Counters::default();
        counters.set_draining(true);
        assert!(counters.snapshot().draining);
        counters.set_draining(false);
        assert!(!counters.snapshot().draining);
    }
}
