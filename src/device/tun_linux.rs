//! Linux TUN device implementation.

use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use libc::{
    c_char, c_int, c_short, c_void, close, ioctl, open, poll, pollfd, read, socket, write,
    AF_INET, IFF_NO_PI, IFF_TUN, O_RDWR, POLLIN, SOCK_DGRAM,
};
use tracing::{debug, info};

use crate::error::is_transient;

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// SIOCSIFADDR - Set interface address.
const SIOCSIFADDR: libc::c_ulong = 0x8916;

/// SIOCSIFNETMASK - Set interface netmask.
const SIOCSIFNETMASK: libc::c_ulong = 0x891c;

/// SIOCSIFFLAGS - Set interface flags.
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

/// SIOCGIFFLAGS - Get interface flags.
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;

/// SIOCSIFMTU - Set interface MTU.
const SIOCSIFMTU: libc::c_ulong = 0x8922;

/// IFF_UP - Interface is up.
const IFF_UP: c_short = 0x1;

/// IFF_RUNNING - Interface is running.
const IFF_RUNNING: c_short = 0x40;

/// Interface request structure.
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; 16],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// Interface request with address.
#[repr(C)]
struct IfReqAddr {
    ifr_name: [c_char; 16],
    ifr_addr: libc::sockaddr_in,
}

/// Interface request with MTU.
#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; 16],
    ifr_mtu: c_int,
    _pad: [u8; 20],
}

/// Linux TUN device.
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl TunDevice {
    /// Create a new TUN device.
    ///
    /// The kernel appends the first free index to `name_prefix`, so
    /// repeated calls yield `rtun0`, `rtun1`, and so on.
    pub fn create(name_prefix: &str) -> io::Result<Self> {
        unsafe {
            // Open the TUN clone device
            let fd = open(b"/dev/net/tun\0".as_ptr() as *const c_char, O_RDWR);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut ifr = IfReq {
                ifr_name: [0; 16],
                ifr_flags: (IFF_TUN | IFF_NO_PI) as c_short,
                _pad: [0; 22],
            };

            // "%d" asks the kernel for the next unused index.
            let pattern = format!("{}%d", name_prefix);
            for (i, byte) in pattern.bytes().take(15).enumerate() {
                ifr.ifr_name[i] = byte as c_char;
            }

            if ioctl(fd, TUNSETIFF, &mut ifr as *mut _ as *mut c_void) < 0 {
                close(fd);
                return Err(io::Error::last_os_error());
            }

            // Get the actual interface name
            let name = CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned();

            info!("Created TUN device: {}", name);

            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
                name,
            })
        }
    }

    /// Get the interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one packet, waiting at most `timeout` for it to arrive.
    ///
    /// Returns `Ok(None)` when the timeout elapses or the read is
    /// interrupted, so callers can re-check their stop condition.
    pub fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let mut pfd = pollfd {
            fd: self.fd.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;

        let rc = unsafe { poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                return Ok(None);
            }
            return Err(err);
        }
        if rc == 0 || (pfd.revents & POLLIN) == 0 {
            return Ok(None);
        }

        let n = unsafe {
            read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                return Ok(None);
            }
            return Err(err);
        }

        Ok(Some(n as usize))
    }

    /// Write one packet.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const c_void,
                buf.len(),
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }

    /// Assign an IP address and netmask.
    pub fn configure(&mut self, ip: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
        with_control_socket(|sock| {
            self.set_addr(sock, SIOCSIFADDR, ip)?;
            self.set_addr(sock, SIOCSIFNETMASK, netmask)
        })?;

        info!("Configured {} with IP {} netmask {}", self.name, ip, netmask);
        Ok(())
    }

    /// Set the interface MTU.
    pub fn set_mtu(&mut self, mtu: u16) -> io::Result<()> {
        with_control_socket(|sock| {
            let mut ifr = IfReqMtu {
                ifr_name: [0; 16],
                ifr_mtu: mtu as c_int,
                _pad: [0; 20],
            };
            self.copy_name(&mut ifr.ifr_name);

            if unsafe { ioctl(sock, SIOCSIFMTU, &mut ifr as *mut _ as *mut c_void) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })?;

        debug!("Set MTU to {} on {}", mtu, self.name);
        Ok(())
    }

    /// Bring the interface up.
    pub fn set_up(&mut self) -> io::Result<()> {
        with_control_socket(|sock| {
            // Get current flags
            let mut ifr = IfReq {
                ifr_name: [0; 16],
                ifr_flags: 0,
                _pad: [0; 22],
            };
            self.copy_name(&mut ifr.ifr_name);

            if unsafe { ioctl(sock, SIOCGIFFLAGS, &mut ifr as *mut _ as *mut c_void) } < 0 {
                return Err(io::Error::last_os_error());
            }

            // Set UP and RUNNING flags
            ifr.ifr_flags |= IFF_UP | IFF_RUNNING;

            if unsafe { ioctl(sock, SIOCSIFFLAGS, &mut ifr as *mut _ as *mut c_void) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })?;

        info!("Interface {} is up", self.name);
        Ok(())
    }

    fn set_addr(&self, sock: c_int, request: libc::c_ulong, addr: Ipv4Addr) -> io::Result<()> {
        let mut ifr = IfReqAddr {
            ifr_name: [0; 16],
            ifr_addr: unsafe { std::mem::zeroed() },
        };
        self.copy_name(&mut ifr.ifr_name);
        ifr.ifr_addr.sin_family = AF_INET as u16;
        ifr.ifr_addr.sin_addr.s_addr = u32::from_ne_bytes(addr.octets());

        if unsafe { ioctl(sock, request, &mut ifr as *mut _ as *mut c_void) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Copy interface name to a buffer.
    fn copy_name(&self, buf: &mut [c_char; 16]) {
        for (i, byte) in self.name.bytes().take(15).enumerate() {
            buf[i] = byte as c_char;
        }
    }
}

/// Run `f` with a throwaway AF_INET control socket for ioctl calls.
fn with_control_socket<T>(f: impl FnOnce(c_int) -> io::Result<T>) -> io::Result<T> {
    let sock = unsafe { socket(AF_INET, SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = f(sock);
    unsafe { close(sock) };
    result
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        debug!("Closing TUN device: {}", self.name);
    }
}
