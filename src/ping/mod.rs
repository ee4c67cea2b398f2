//! Concurrent latency measurement engine
//!
//! A bounded pool of workers probes every target once over a shared ICMP
//! socket. Each probe gets a unique sequence number; a background reader
//! routes inbound echo replies back to the waiting prober. An unanswered
//! probe yields an absent latency rather than an error, so one dead relay
//! never aborts the scan.

pub mod factory;
pub mod packet;

#[cfg(unix)]
pub mod socket;
#[cfg(windows)]
pub mod windows;

#[cfg(test)]
mod mock;

use crate::relays::{IpVersion, Location};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Errors produced by a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The probing backend could not be set up.
    #[error("failed to open ICMP socket: {0}")]
    Socket(String),

    /// The scan was cancelled before every target was probed. Results for
    /// targets that completed before cancellation are preserved.
    #[error("scan cancelled after {} of {total} targets", partial.len())]
    Cancelled {
        /// Locations whose probes finished before cancellation.
        partial: Vec<Location>,
        /// Number of targets the scan set out to probe.
        total: usize,
    },
}

/// A single-probe latency measurement backend.
///
/// Implementations share one underlying socket across concurrent callers,
/// so `ping` takes `&self` and may be invoked from many tasks at once.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Probe `addr` once. Returns the round-trip time in milliseconds, or
    /// `None` when the probe timed out, was cancelled, or `addr` could not
    /// be parsed.
    async fn ping(&self, addr: &str, timeout: Duration, cancel: &CancellationToken) -> Option<f64>;

    /// Release the backend's resources. Subsequent probes fail fast.
    fn close(&self) -> anyhow::Result<()>;
}

/// Constructs the probing backend for a scan.
///
/// A factory seam instead of direct construction so tests can substitute
/// a scripted backend.
pub trait PingerFactory: Send + Sync {
    /// Build a pinger for the given address family.
    fn create(&self, ip_version: IpVersion, verbose: u8) -> anyhow::Result<Arc<dyn Pinger>>;
}

/// Factory producing the platform's real ICMP backend.
pub struct DefaultPingerFactory;

impl PingerFactory for DefaultPingerFactory {
    fn create(&self, ip_version: IpVersion, verbose: u8) -> anyhow::Result<Arc<dyn Pinger>> {
        factory::create_pinger(ip_version, verbose)
    }
}

/// Scan settings shared by every probe.
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    /// Address family to probe.
    pub ip_version: IpVersion,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Upper bound on concurrent probes.
    pub workers: usize,
    /// Diagnostic verbosity.
    pub verbose: u8,
}

/// Probe every location once with the platform's ICMP backend.
///
/// Returns the input locations, each annotated with its measured latency
/// (or `None` on timeout), in no particular order.
pub async fn scan_locations(
    locations: Vec<Location>,
    config: ScanConfig,
    cancel: &CancellationToken,
) -> Result<Vec<Location>, ScanError> {
    scan_locations_with_factory(locations, config, cancel, &DefaultPingerFactory).await
}

/// [`scan_locations`] with an explicit backend factory.
pub async fn scan_locations_with_factory(
    locations: Vec<Location>,
    config: ScanConfig,
    cancel: &CancellationToken,
    factory: &dyn PingerFactory,
) -> Result<Vec<Location>, ScanError> {
    let total = locations.len();
    if total == 0 {
        return Ok(locations);
    }

    let pinger = factory
        .create(config.ip_version, config.verbose)
        .map_err(|e| ScanError::Socket(e.to_string()))?;

    // Never spin up more workers than there are targets.
    let worker_count = config.workers.clamp(1, total);
    crate::vlog!(
        config.verbose,
        1,
        "scanning {total} relays with {worker_count} workers, {:?} timeout",
        config.timeout
    );

    let (work_tx, work_rx) = mpsc::channel::<Location>(worker_count);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (done_tx, mut done_rx) = mpsc::channel::<Location>(total);

    // Feed targets into the queue, stopping early on cancellation. Workers
    // drain what was already queued and then exit when the channel closes.
    let feeder_cancel = cancel.clone();
    let feeder = tokio::spawn(async move {
        for location in locations {
            tokio::select! {
                result = work_tx.send(location) => {
                    if result.is_err() {
                        return;
                    }
                }
                () = feeder_cancel.cancelled() => return,
            }
        }
    });

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let work_rx = Arc::clone(&work_rx);
        let done_tx = done_tx.clone();
        let pinger = Arc::clone(&pinger);
        let cancel = cancel.clone();
        let timeout = config.timeout;
        let ip_version = config.ip_version;
        workers.push(tokio::spawn(async move {
            loop {
                let next = {
                    let mut rx = work_rx.lock().await;
                    rx.recv().await
                };
                let Some(mut location) = next else {
                    return;
                };
                if cancel.is_cancelled() {
                    return;
                }
                let addr = location.address(ip_version).to_string();
                location.latency_ms = pinger.ping(&addr, timeout, &cancel).await;
                if done_tx.send(location).await.is_err() {
                    return;
                }
            }
        }));
    }
    drop(done_tx);

    let mut results = Vec::with_capacity(total);
    while let Some(location) = done_rx.recv().await {
        results.push(location);
    }

    let _ = feeder.await;
    for worker in workers {
        let _ = worker.await;
    }

    if let Err(err) = pinger.close() {
        crate::vlog!(config.verbose, 1, "error closing pinger: {err}");
    }

    // A cancelled scan is never reported as success, even when every
    // target had already produced a (cut-short) result.
    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled {
            partial: results,
            total,
        });
    }

    Ok(results)
}
