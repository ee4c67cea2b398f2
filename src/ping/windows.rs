//! Windows ICMP backend
//!
//! Uses the IcmpSendEcho2 family from iphlpapi rather than raw sockets,
//! which need no privileges on Windows. Each probe registers its own event
//! handle; a blocking task waits on it and hands the reply buffer back.
//!
//! Cancellation bounds the caller's wait only: a native echo call that is
//! already in flight runs to its own timeout before the system releases
//! its buffers.

use super::packet::ECHO_PAYLOAD;
use super::Pinger;
use crate::relays::IpVersion;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::ffi::c_void;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::NetworkManagement::IpHelper::{
    Icmp6CreateFile, Icmp6SendEcho2, IcmpCloseHandle, IcmpCreateFile, IcmpSendEcho2,
    ICMPV6_ECHO_REPLY_LH, ICMP_ECHO_REPLY, IP_SUCCESS,
};
use windows_sys::Win32::Networking::WinSock::{AF_INET6, SOCKADDR_IN6};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

/// ICMP echo backend built on the Windows ICMP API.
pub struct IcmpApiPinger {
    icmp_handle: HANDLE,
    ip_version: IpVersion,
    closed: Mutex<bool>,
    verbose: u8,
}

impl IcmpApiPinger {
    /// Open an ICMP handle for the given address family.
    pub fn open(ip_version: IpVersion, verbose: u8) -> anyhow::Result<Self> {
        let icmp_handle = unsafe {
            match ip_version {
                IpVersion::V4 => IcmpCreateFile(),
                IpVersion::V6 => Icmp6CreateFile(),
            }
        };
        // The ICMP API reports failure with INVALID_HANDLE_VALUE, not null;
        // reject both.
        if icmp_handle.is_null() || icmp_handle == INVALID_HANDLE_VALUE {
            bail!("failed to create ICMP handle (error {})", unsafe {
                GetLastError()
            });
        }
        Ok(Self {
            icmp_handle,
            ip_version,
            closed: Mutex::new(false),
            verbose,
        })
    }

    /// Issue the echo, then wait on the probe's event from a blocking task.
    /// Resolves to the reply buffer once the native call completes.
    fn start_probe(
        &self,
        target: IpAddr,
        timeout: Duration,
    ) -> anyhow::Result<oneshot::Receiver<anyhow::Result<Vec<u8>>>> {
        let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if event.is_null() || event == INVALID_HANDLE_VALUE {
            bail!("failed to create event (error {})", unsafe {
                GetLastError()
            });
        }

        let reply_size = match target {
            IpAddr::V4(_) => mem::size_of::<ICMP_ECHO_REPLY>(),
            IpAddr::V6(_) => mem::size_of::<ICMPV6_ECHO_REPLY_LH>(),
        } + ECHO_PAYLOAD.len()
            + 8;
        // Boxed so the buffer keeps a stable address across the await.
        let mut reply_buffer = vec![0u8; reply_size].into_boxed_slice();
        let reply_ptr = reply_buffer.as_mut_ptr().cast::<c_void>();
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        let result = match target {
            IpAddr::V4(addr) => unsafe {
                IcmpSendEcho2(
                    self.icmp_handle,
                    event,
                    None,
                    ptr::null(),
                    u32::from_ne_bytes(addr.octets()),
                    ECHO_PAYLOAD.as_ptr().cast::<c_void>(),
                    ECHO_PAYLOAD.len() as u16,
                    ptr::null(),
                    reply_ptr,
                    reply_size as u32,
                    timeout_ms,
                )
            },
            IpAddr::V6(addr) => {
                let mut source: SOCKADDR_IN6 = unsafe { mem::zeroed() };
                source.sin6_family = AF_INET6;
                let mut dest: SOCKADDR_IN6 = unsafe { mem::zeroed() };
                dest.sin6_family = AF_INET6;
                dest.sin6_addr.u.Byte = addr.octets();
                unsafe {
                    Icmp6SendEcho2(
                        self.icmp_handle,
                        event,
                        None,
                        ptr::null(),
                        &mut source,
                        &mut dest,
                        ECHO_PAYLOAD.as_ptr().cast::<c_void>(),
                        ECHO_PAYLOAD.len() as u16,
                        ptr::null(),
                        reply_ptr,
                        reply_size as u32,
                        timeout_ms,
                    )
                }
            }
        };

        if result == 0 {
            let error = unsafe { GetLastError() };
            if error != ERROR_IO_PENDING {
                unsafe { CloseHandle(event) };
                bail!("IcmpSendEcho2 failed (error {error})");
            }
        }

        let (tx, rx) = oneshot::channel();
        // HANDLE is a raw pointer and not Send; pass it as usize.
        let event_handle = event as usize;
        tokio::task::spawn_blocking(move || {
            let event = event_handle as HANDLE;
            let wait = unsafe { WaitForSingleObject(event, INFINITE) };
            unsafe { CloseHandle(event) };
            if wait == WAIT_OBJECT_0 {
                let _ = tx.send(Ok(reply_buffer.into_vec()));
            } else {
                let _ = tx.send(Err(anyhow!("event wait failed ({wait})")));
            }
        });

        Ok(rx)
    }

    /// `elapsed` stands in for the API's RoundTripTime when the latter is
    /// zero, which it is for sub-millisecond replies.
    fn parse_reply(&self, buffer: &[u8], target: IpAddr, elapsed: Duration) -> Option<f64> {
        match target {
            IpAddr::V4(addr) => {
                if buffer.len() < mem::size_of::<ICMP_ECHO_REPLY>() {
                    return None;
                }
                let reply = unsafe { &*buffer.as_ptr().cast::<ICMP_ECHO_REPLY>() };
                if reply.Status != IP_SUCCESS {
                    return None;
                }
                let responder = Ipv4Addr::from(reply.Address.to_ne_bytes());
                if responder != addr {
                    crate::vlog!(self.verbose, 2, "reply from {responder}, expected {addr}");
                    return None;
                }
                if reply.RoundTripTime > 0 {
                    Some(f64::from(reply.RoundTripTime))
                } else {
                    Some(elapsed.as_secs_f64() * 1000.0)
                }
            }
            IpAddr::V6(addr) => {
                if buffer.len() < mem::size_of::<ICMPV6_ECHO_REPLY_LH>() {
                    return None;
                }
                let reply = unsafe { &*buffer.as_ptr().cast::<ICMPV6_ECHO_REPLY_LH>() };
                if reply.Status != IP_SUCCESS {
                    return None;
                }
                let addr_words = reply.Address.sin6_addr;
                let segments = addr_words.map(u16::from_be);
                let responder = Ipv6Addr::new(
                    segments[0],
                    segments[1],
                    segments[2],
                    segments[3],
                    segments[4],
                    segments[5],
                    segments[6],
                    segments[7],
                );
                if responder != addr {
                    crate::vlog!(self.verbose, 2, "reply from {responder}, expected {addr}");
                    return None;
                }
                if reply.RoundTripTime > 0 {
                    Some(f64::from(reply.RoundTripTime))
                } else {
                    Some(elapsed.as_secs_f64() * 1000.0)
                }
            }
        }
    }
}

#[async_trait]
impl Pinger for IcmpApiPinger {
    async fn ping(&self, addr: &str, timeout: Duration, cancel: &CancellationToken) -> Option<f64> {
        let target: IpAddr = match addr.parse() {
            Ok(ip) => ip,
            Err(_) => {
                crate::vlog!(self.verbose, 2, "unparseable address {addr:?}, skipping");
                return None;
            }
        };
        let family_matches = matches!(
            (target, self.ip_version),
            (IpAddr::V4(_), IpVersion::V4) | (IpAddr::V6(_), IpVersion::V6)
        );
        if !family_matches {
            return None;
        }
        if *self.closed.lock().expect("closed lock poisoned") {
            return None;
        }

        let sent_at = Instant::now();
        let rx = match self.start_probe(target, timeout) {
            Ok(rx) => rx,
            Err(err) => {
                crate::vlog!(self.verbose, 2, "probe to {target} failed to start: {err}");
                return None;
            }
        };

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(buffer)) => self.parse_reply(&buffer, target, sent_at.elapsed()),
                _ => None,
            },
            () = cancel.cancelled() => None,
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        let mut closed = self.closed.lock().expect("closed lock poisoned");
        if *closed {
            bail!("pinger already closed");
        }
        *closed = true;
        Ok(())
    }
}

impl Drop for IcmpApiPinger {
    fn drop(&mut self) {
        if !self.icmp_handle.is_null() {
            unsafe { IcmpCloseHandle(self.icmp_handle) };
        }
    }
}

// Safety: the ICMP handle is only used for issuing echo requests, which
// iphlpapi permits from multiple threads on one handle.
unsafe impl Send for IcmpApiPinger {}
unsafe impl Sync for IcmpApiPinger {}
