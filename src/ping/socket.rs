//! Shared-socket ICMP backend for Unix platforms
//!
//! One socket serves every concurrent probe. A blocking reader thread
//! drains inbound datagrams and routes each echo reply, by sequence
//! number, to the prober waiting on it. Unprivileged DGRAM ICMP sockets
//! are tried first; raw sockets are the fallback for systems that restrict
//! them (raw needs root or CAP_NET_RAW).

use super::packet::{build_echo_request, parse_echo_reply};
use super::Pinger;
use crate::relays::IpVersion;
use anyhow::{bail, Context};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::process;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How often the reader thread wakes up to check for shutdown.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECV_BUFFER_SIZE: usize = 1500;

type InFlightMap = Arc<Mutex<HashMap<u16, oneshot::Sender<IpAddr>>>>;

/// Shared ICMP socket multiplexing concurrent echo probes.
pub struct SocketManager {
    /// Taken on close so the last reference (the reader's) going away
    /// releases the file descriptor.
    socket: Mutex<Option<Arc<Socket>>>,
    ip_version: IpVersion,
    identifier: u16,
    next_seq: AtomicU16,
    in_flight: InFlightMap,
    shutdown: CancellationToken,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    verbose: u8,
}

impl SocketManager {
    /// Open the shared socket and start the reader.
    pub fn open(ip_version: IpVersion, verbose: u8) -> anyhow::Result<Arc<Self>> {
        let socket = Arc::new(open_icmp_socket(ip_version, verbose)?);
        // The reader blocks in recv with a short timeout so it can notice
        // shutdown even on platforms where close() cannot interrupt it.
        socket
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .context("failed to set socket read timeout")?;

        let manager = Arc::new(Self {
            socket: Mutex::new(Some(Arc::clone(&socket))),
            ip_version,
            identifier: (process::id() & 0xffff) as u16,
            next_seq: AtomicU16::new(1),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            reader: Mutex::new(None),
            verbose,
        });

        let reader = thread::spawn({
            let in_flight = Arc::clone(&manager.in_flight);
            let shutdown = manager.shutdown.clone();
            move || reader_loop(&socket, ip_version, &in_flight, &shutdown, verbose)
        });
        *manager.reader.lock().expect("reader lock poisoned") = Some(reader);

        Ok(manager)
    }

    fn allocate_seq(&self) -> u16 {
        // Wrapping is fine: a scan never has 65k probes in flight at once.
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Removes the in-flight entry on every exit path. Idempotent with the
/// reader's own removal on reply delivery.
struct InFlightGuard {
    in_flight: InFlightMap,
    sequence: u16,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.sequence);
    }
}

#[async_trait]
impl Pinger for SocketManager {
    async fn ping(&self, addr: &str, timeout: Duration, cancel: &CancellationToken) -> Option<f64> {
        let target: IpAddr = match addr.parse() {
            Ok(ip) => ip,
            Err(_) => {
                crate::vlog!(self.verbose, 2, "unparseable address {addr:?}, skipping");
                return None;
            }
        };
        let socket = {
            let guard = self.socket.lock().expect("socket lock poisoned");
            match guard.as_ref() {
                Some(socket) => Arc::clone(socket),
                // Probes after close fail fast.
                None => return None,
            }
        };

        let sequence = self.allocate_seq();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(sequence, reply_tx);
        let _guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            sequence,
        };

        let request = build_echo_request(self.ip_version, self.identifier, sequence);
        let dest = SocketAddr::new(target, 0);
        let started = Instant::now();
        if let Err(err) = socket.send_to(&request, &dest.into()) {
            crate::vlog!(self.verbose, 2, "send to {target} failed: {err}");
            return None;
        }

        tokio::select! {
            reply = reply_rx => {
                match reply {
                    Ok(peer) if peer == target => {
                        Some(started.elapsed().as_secs_f64() * 1000.0)
                    }
                    // Reply from the wrong host, or the reader went away.
                    _ => None,
                }
            }
            () = tokio::time::sleep(timeout) => None,
            () = cancel.cancelled() => None,
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        let reader = self
            .reader
            .lock()
            .expect("reader lock poisoned")
            .take();
        let Some(reader) = reader else {
            bail!("socket manager already closed");
        };
        self.shutdown.cancel();
        if let Some(socket) = self.socket.lock().expect("socket lock poisoned").take() {
            // Unblocks an in-progress read where the platform supports it;
            // the reader's poll timeout bounds the wait where it doesn't.
            let _ = socket.shutdown(Shutdown::Both);
        }
        // The reader's socket reference is the last one; joining it here
        // guarantees the descriptor is released before close returns.
        if reader.join().is_err() {
            bail!("reader thread panicked");
        }
        Ok(())
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        // Stops the reader even when close() was never called.
        self.shutdown.cancel();
    }
}

/// What the reader loop does with a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// Poll timeout or signal; part of normal operation.
    Transient,
    /// Unexpected error; log it and keep demultiplexing.
    Retry,
    /// Shutting down; exit the loop.
    Exit,
}

fn classify_read_error(err: &std::io::Error, shutting_down: bool) -> ReadOutcome {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {
            ReadOutcome::Transient
        }
        _ if shutting_down => ReadOutcome::Exit,
        _ => ReadOutcome::Retry,
    }
}

/// Drain the socket, routing echo replies to their probers. Runs on its
/// own thread until shutdown.
fn reader_loop(
    socket: &Socket,
    ip_version: IpVersion,
    in_flight: &InFlightMap,
    shutdown: &CancellationToken,
    verbose: u8,
) {
    let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];
    while !shutdown.is_cancelled() {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) => match classify_read_error(&err, shutdown.is_cancelled()) {
                ReadOutcome::Transient => continue,
                ReadOutcome::Retry => {
                    crate::vlog!(verbose, 2, "socket read error: {err}");
                    continue;
                }
                ReadOutcome::Exit => return,
            },
        };

        // recv_from initialized the first `len` bytes.
        let datagram: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };
        let Some(reply) = parse_echo_reply(ip_version, datagram) else {
            continue;
        };
        let Some(peer_ip) = peer.as_socket().map(|s| s.ip()) else {
            continue;
        };

        // Remove-then-send makes the lookup atomic: a late duplicate reply
        // finds no entry and is dropped.
        let waiter = in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&reply.sequence);
        if let Some(tx) = waiter {
            // The prober may have timed out already; that's fine.
            let _ = tx.send(peer_ip);
        }
    }
}

/// Open an ICMP socket, preferring the unprivileged DGRAM kind.
fn open_icmp_socket(ip_version: IpVersion, verbose: u8) -> anyhow::Result<Socket> {
    let (domain, protocol) = match ip_version {
        IpVersion::V4 => (Domain::IPV4, Protocol::ICMPV4),
        IpVersion::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };

    match Socket::new(domain, Type::DGRAM, Some(protocol)) {
        Ok(socket) => {
            crate::vlog!(verbose, 2, "opened unprivileged DGRAM ICMP socket");
            return Ok(socket);
        }
        Err(err) => {
            crate::vlog!(
                verbose,
                2,
                "DGRAM ICMP socket unavailable ({err}), trying raw"
            );
        }
    }

    Socket::new(domain, Type::RAW, Some(protocol)).context(
        "failed to open ICMP socket; raw sockets need root or CAP_NET_RAW, \
         and unprivileged ping sockets may be disabled (net.ipv4.ping_group_range)",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn icmp_available() -> bool {
        open_icmp_socket(IpVersion::V4, 0).is_ok()
    }

    #[test]
    fn read_error_classification() {
        use std::io::Error;

        let timed_out = Error::from(ErrorKind::TimedOut);
        let would_block = Error::from(ErrorKind::WouldBlock);
        let interrupted = Error::from(ErrorKind::Interrupted);
        let hard = Error::from(ErrorKind::ConnectionReset);

        // Poll timeouts are routine whether or not we are shutting down.
        assert_eq!(classify_read_error(&timed_out, false), ReadOutcome::Transient);
        assert_eq!(classify_read_error(&would_block, true), ReadOutcome::Transient);
        assert_eq!(classify_read_error(&interrupted, false), ReadOutcome::Transient);
        // A hard error mid-scan must not kill reply demultiplexing.
        assert_eq!(classify_read_error(&hard, false), ReadOutcome::Retry);
        // The same error during shutdown ends the loop.
        assert_eq!(classify_read_error(&hard, true), ReadOutcome::Exit);
    }

    #[tokio::test]
    async fn unparseable_address_returns_none_immediately() {
        if !icmp_available() {
            eprintln!("skipping: no ICMP socket available");
            return;
        }
        let manager = SocketManager::open(IpVersion::V4, 0).expect("socket must open");
        let started = Instant::now();
        let latency = manager
            .ping("not-an-ip", Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(latency, None);
        assert!(started.elapsed() < Duration::from_millis(500));
        manager.close().expect("close must succeed");
    }

    #[tokio::test]
    async fn double_close_fails() {
        if !icmp_available() {
            eprintln!("skipping: no ICMP socket available");
            return;
        }
        let manager = SocketManager::open(IpVersion::V4, 0).expect("socket must open");
        manager.close().expect("first close must succeed");
        assert!(manager.close().is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn close_joins_reader_and_releases_the_descriptor() {
        use std::os::unix::io::AsRawFd;

        if !icmp_available() {
            eprintln!("skipping: no ICMP socket available");
            return;
        }
        let manager = SocketManager::open(IpVersion::V4, 0).expect("socket must open");
        let fd = {
            let guard = manager.socket.lock().expect("socket lock poisoned");
            guard.as_ref().expect("socket present before close").as_raw_fd()
        };
        let fd_path = format!("/proc/self/fd/{fd}");
        let inode = std::fs::read_link(&fd_path)
            .expect("manager socket fd must be open")
            .into_os_string();

        let started = Instant::now();
        manager.close().expect("close must succeed");
        // close joins the reader, so it may block up to one poll interval.
        assert!(started.elapsed() < Duration::from_secs(1));

        // The descriptor is gone, or the number was already reused for
        // something else. Either way our socket was released.
        let after = std::fs::read_link(&fd_path).ok().map(|p| p.into_os_string());
        assert_ne!(
            Some(inode),
            after,
            "socket fd {fd} still open after close() returned"
        );
    }

    #[tokio::test]
    async fn probes_after_close_fail_fast() {
        if !icmp_available() {
            eprintln!("skipping: no ICMP socket available");
            return;
        }
        let manager = SocketManager::open(IpVersion::V4, 0).expect("socket must open");
        manager.close().expect("close must succeed");
        let started = Instant::now();
        let latency = manager
            .ping("127.0.0.1", Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(latency, None);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancellation_ends_probe_before_timeout() {
        if !icmp_available() {
            eprintln!("skipping: no ICMP socket available");
            return;
        }
        let manager = SocketManager::open(IpVersion::V4, 0).expect("socket must open");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        // TEST-NET-1, no reply expected; cancellation should win regardless.
        let latency = manager
            .ping("192.0.2.1", Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(latency, None);
        assert!(started.elapsed() < Duration::from_secs(1));
        manager.close().expect("close must succeed");
    }

    #[tokio::test]
    async fn concurrent_sequence_allocations_never_collide() {
        if !icmp_available() {
            eprintln!("skipping: no ICMP socket available");
            return;
        }
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;

        let manager = SocketManager::open(IpVersion::V4, 0).expect("socket must open");
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| manager.allocate_seq())
                        .collect::<Vec<u16>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().expect("allocator thread panicked") {
                assert!(seen.insert(seq), "sequence {seq} allocated twice");
            }
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
        manager.close().expect("close must succeed");
    }
}
