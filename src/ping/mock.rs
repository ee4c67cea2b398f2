//! Scripted probing backend for dispatcher tests

use super::{Pinger, PingerFactory};
use crate::relays::IpVersion;
use anyhow::bail;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared observation state for a scripted backend.
#[derive(Default)]
pub struct MockState {
    /// Latency to report per address; absent addresses time out.
    pub latencies: Mutex<HashMap<String, f64>>,
    /// Addresses probed, in call order.
    pub calls: Mutex<Vec<String>>,
    /// Number of `close` calls.
    pub closes: AtomicUsize,
    concurrent: AtomicUsize,
    /// High-water mark of probes running at the same time.
    pub max_concurrent: AtomicUsize,
}

impl MockState {
    pub fn with_latencies(latencies: &[(&str, f64)]) -> Arc<Self> {
        let state = Self::default();
        {
            let mut map = state.latencies.lock().expect("latencies lock poisoned");
            for (addr, ms) in latencies {
                map.insert((*addr).to_string(), *ms);
            }
        }
        Arc::new(state)
    }
}

/// Pinger that answers from a script instead of the network.
pub struct MockPinger {
    state: Arc<MockState>,
    /// Artificial per-probe delay, for concurrency and cancellation tests.
    delay: Duration,
}

impl MockPinger {
    pub fn new(state: Arc<MockState>, delay: Duration) -> Self {
        Self { state, delay }
    }
}

#[async_trait]
impl Pinger for MockPinger {
    async fn ping(&self, addr: &str, _timeout: Duration, cancel: &CancellationToken) -> Option<f64> {
        self.state
            .calls
            .lock()
            .expect("calls lock poisoned")
            .push(addr.to_string());

        let running = self.state.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_concurrent.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = cancel.cancelled() => {
                    self.state.concurrent.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
            }
        }
        self.state.concurrent.fetch_sub(1, Ordering::SeqCst);

        self.state
            .latencies
            .lock()
            .expect("latencies lock poisoned")
            .get(addr)
            .copied()
    }

    fn close(&self) -> anyhow::Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockPinger`]s over shared state.
pub struct MockPingerFactory {
    pub state: Arc<MockState>,
    pub delay: Duration,
    pub fail_create: bool,
    /// Number of backends created.
    pub created: AtomicUsize,
}

impl MockPingerFactory {
    pub fn new(state: Arc<MockState>) -> Self {
        Self {
            state,
            delay: Duration::ZERO,
            fail_create: false,
            created: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            delay: Duration::ZERO,
            fail_create: true,
            created: AtomicUsize::new(0),
        }
    }
}

impl PingerFactory for MockPingerFactory {
    fn create(&self, _ip_version: IpVersion, _verbose: u8) -> anyhow::Result<Arc<dyn Pinger>> {
        if self.fail_create {
            bail!("scripted backend failure");
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPinger::new(Arc::clone(&self.state), self.delay)))
    }
}
