//! TUN interface management.
//!
//! Every client session gets an interface of its own: the kernel picks
//! a fresh name from the configured prefix, and the address pool hands
//! out a distinct local address inside the tunnel subnet. Dropping the
//! device closes the descriptor and returns the address to the pool.

#[cfg(target_os = "linux")]
mod tun_linux;

#[cfg(target_os = "linux")]
pub use tun_linux::TunDevice;

use std::collections::BTreeSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[cfg(target_os = "linux")]
use tracing::info;

use crate::error::{Error, Result};

/// Session-facing interface handle.
///
/// `recv` is a readiness-polled read: it blocks for at most `timeout`
/// and reports `None` when nothing arrived, so a blocking reader thread
/// can re-check its stop condition between packets.
pub trait TunInterface: Send + Sync {
    /// Interface name as assigned by the kernel.
    fn name(&self) -> &str;

    /// Read one packet, waiting at most `timeout`.
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Write one packet.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

/// Creates one configured interface per session.
pub trait DeviceManager: Send + Sync {
    /// Create, address, and bring up a fresh interface.
    fn acquire(&self) -> Result<Arc<dyn TunInterface>>;
}

/// Production [`DeviceManager`] backed by `/dev/net/tun`.
pub struct TunManager {
    name_prefix: String,
    netmask: Ipv4Addr,
    mtu: Option<u16>,
    pool: AddrPool,
}

impl TunManager {
    pub fn new(
        name_prefix: &str,
        tunnel_addr: Ipv4Addr,
        netmask: Ipv4Addr,
        mtu: Option<u16>,
    ) -> Self {
        Self {
            name_prefix: name_prefix.to_string(),
            netmask,
            mtu,
            pool: AddrPool::new(tunnel_addr, netmask),
        }
    }
}

impl DeviceManager for TunManager {
    #[cfg(target_os = "linux")]
    fn acquire(&self) -> Result<Arc<dyn TunInterface>> {
        let lease = self.pool.lease()?;

        let mut dev = TunDevice::create(&self.name_prefix)
            .map_err(|e| Error::DeviceUnavailable(format!("/dev/net/tun: {}", e)))?;

        dev.configure(lease.addr(), self.netmask).map_err(|e| {
            Error::ConfigurationFailed(format!(
                "address {} on {}: {}",
                lease.addr(),
                dev.name(),
                e
            ))
        })?;

        if let Some(mtu) = self.mtu {
            dev.set_mtu(mtu).map_err(|e| {
                Error::ConfigurationFailed(format!("mtu {} on {}: {}", mtu, dev.name(), e))
            })?;
        }

        dev.set_up().map_err(|e| {
            Error::ConfigurationFailed(format!("bring up {}: {}", dev.name(), e))
        })?;

        info!(
            "Interface {} ready at {}/{}",
            dev.name(),
            lease.addr(),
            self.netmask
        );
        Ok(Arc::new(LeasedDevice { dev, _lease: lease }))
    }

    #[cfg(not(target_os = "linux"))]
    fn acquire(&self) -> Result<Arc<dyn TunInterface>> {
        Err(Error::DeviceUnavailable(
            "TUN devices are only supported on Linux".to_string(),
        ))
    }
}

/// Ties a device to its address lease so both release together.
#[cfg(target_os = "linux")]
struct LeasedDevice {
    dev: TunDevice,
    _lease: AddrLease,
}

#[cfg(target_os = "linux")]
impl TunInterface for LeasedDevice {
    fn name(&self) -> &str {
        self.dev.name()
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.dev.recv(buf, timeout)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.dev.send(buf)
    }
}

/// Hands out distinct host addresses inside the tunnel subnet.
///
/// The configured tunnel address is issued first; freed addresses
/// become available again. The subnet's network and broadcast
/// addresses are never issued.
pub struct AddrPool {
    inner: Arc<Mutex<PoolInner>>,
    network: u32,
    broadcast: u32,
}

struct PoolInner {
    in_use: BTreeSet<u32>,
    next: u32,
}

impl AddrPool {
    pub fn new(base: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let base = u32::from(base);
        let mask = u32::from(netmask);
        let network = base & mask;
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                in_use: BTreeSet::new(),
                next: base,
            })),
            network,
            broadcast: network | !mask,
        }
    }

    /// Lease the next free host address.
    ///
    /// Exhaustion is a configuration failure for the requesting session
    /// only; the pool recovers as leases are dropped.
    pub fn lease(&self) -> Result<AddrLease> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let host_count = (self.broadcast - self.network).saturating_sub(1);
        let mut candidate = inner.next;
        for _ in 0..host_count {
            if candidate <= self.network || candidate >= self.broadcast {
                candidate = self.network + 1;
            }
            if !inner.in_use.contains(&candidate) {
                inner.in_use.insert(candidate);
                inner.next = candidate.wrapping_add(1);
                return Ok(AddrLease {
                    addr: candidate,
                    pool: Arc::clone(&self.inner),
                });
            }
            candidate += 1;
        }

        Err(Error::ConfigurationFailed(format!(
            "tunnel subnet exhausted ({} addresses in use)",
            inner.in_use.len()
        )))
    }
}

/// Holds one address out of the pool until dropped.
pub struct AddrLease {
    addr: u32,
    pool: Arc<Mutex<PoolInner>>,
}

impl AddrLease {
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }
}

impl Drop for AddrLease {
    fn drop(&mut self) {
        let mut inner = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        inner.in_use.remove(&self.addr);
    }
}
