//! Unicast PTPv2 (IEEE 1588) time server core.
//!
//! This crate implements the hard engineering of a unicast-only PTP grandmaster:
//! a per-client subscription state machine driven by SIGNALING negotiation, a
//! sharded send-worker pool with hardware-assisted TX timestamping, a dual-port
//! listener (319 event / 320 general), and a drain/reload/shutdown controller.
//!
//! CLI parsing and process bootstrap (pid file creation aside, which this
//! crate does for you) are left to an embedding binary, which wires
//! [`Server`](server::Server) up to `clap` and `tokio::signal`.
//!
//! # Example
//!
//! ```ignore
//! use ptp4u::config::StaticConfig;
//! use ptp4u::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> ptp4u::error::Result<()> {
//!     let static_config = StaticConfig {
//!         interface: "eth0".into(),
//!         ip: "0.0.0.0".parse().unwrap(),
//!         event_port: 319,
//!         general_port: 320,
//!         worker_count: 4,
//!         queue_capacity: 4096,
//!         timestamp_mode: "hardware".parse()?,
//!         dscp: 46,
//!         pid_file: "/var/run/ptp4u.pid".into(),
//!         dynamic_config_path: Some("/etc/ptp4u/dynamic.conf".into()),
//!         attempts_txts: 100,
//!         timeout_txts: std::time::Duration::from_millis(1),
//!     };
//!
//!     let mut server = Server::new(static_config)?;
//!     // Subscription interval/duration limits and the metrics/drain-check
//!     // cadence all live in the hot-reloadable dynamic config, not here;
//!     // load it once before `start` so the first grant already sees it.
//!     if let Ok(text) = tokio::fs::read_to_string("/etc/ptp4u/dynamic.conf").await {
//!         server.reload_from_str(&text)?;
//!     }
//!     server.start().await?;
//!
//!     let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
//!     let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
//!     loop {
//!         tokio::select! {
//!             _ = sighup.recv() => {
//!                 if let Ok(text) = tokio::fs::read_to_string("/etc/ptp4u/dynamic.conf").await {
//!                     let _ = server.reload_from_str(&text);
//!                 }
//!             }
//!             _ = sigterm.recv() => {
//!                 server.drain();
//!                 server.shutdown().await?;
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
pub mod metrics;
pub mod server;
pub mod shard;
pub mod subscription;
pub mod timestamping;
pub mod worker;
