//! Platform backend selection

use super::Pinger;
use crate::relays::IpVersion;
use std::sync::Arc;

/// Build the ICMP backend for the current platform.
#[cfg(unix)]
pub fn create_pinger(ip_version: IpVersion, verbose: u8) -> anyhow::Result<Arc<dyn Pinger>> {
    let manager = super::socket::SocketManager::open(ip_version, verbose)?;
    Ok(manager as Arc<dyn Pinger>)
}

/// Build the ICMP backend for the current platform.
#[cfg(windows)]
pub fn create_pinger(ip_version: IpVersion, verbose: u8) -> anyhow::Result<Arc<dyn Pinger>> {
    let pinger = super::windows::IcmpApiPinger::open(ip_version, verbose)?;
    Ok(Arc::new(pinger))
}

/// Build the ICMP backend for the current platform.
#[cfg(not(any(unix, windows)))]
pub fn create_pinger(_ip_version: IpVersion, _verbose: u8) -> anyhow::Result<Arc<dyn Pinger>> {
    anyhow::bail!("latency probing is not supported on this platform")
}
