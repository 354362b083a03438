//! Per-client forwarding session.
//!
//! Each accepted connection runs one [`ClientSession`] on its own task.
//! The session owns the TCP stream and a freshly acquired TUN interface
//! for its whole lifetime; both are released when `run` returns, on any
//! exit path. Inbound frames are deframed and written to the interface,
//! interface packets are framed and written to the stream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::classify::classify;
use crate::device::{DeviceManager, TunInterface};
use crate::framing::{encode_frame, FrameDecoder};
use crate::shutdown::ShutdownSignal;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server-wide shutdown was requested.
    Shutdown,
    /// The peer closed its end of the connection.
    PeerClosed,
    /// No interface could be acquired for this session.
    DeviceFailed,
    /// A non-transient I/O error on the socket or interface.
    IoFailed,
}

/// One client connection bridged to one TUN interface.
pub struct ClientSession {
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<dyn DeviceManager>,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
}

impl ClientSession {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        manager: Arc<dyn DeviceManager>,
        shutdown: ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stream,
            peer,
            manager,
            shutdown,
            poll_interval,
        }
    }

    /// Run the session to completion.
    ///
    /// Never propagates an error: every failure mode ends only this
    /// session, and the outcome says which one it was. The socket and
    /// the interface are both released by the time this returns.
    pub async fn run(self) -> SessionEnd {
        let ClientSession {
            mut stream,
            peer,
            manager,
            shutdown,
            poll_interval,
        } = self;

        let device = match manager.acquire() {
            Ok(device) => device,
            Err(e) => {
                warn!("Session {} aborted: {}", peer, e);
                return SessionEnd::DeviceFailed;
            }
        };

        info!("Session {} forwarding via {}", peer, device.name());
        let end = forward(&mut stream, peer, device, &shutdown, poll_interval).await;
        info!("Session {} closed: {:?}", peer, end);
        end
    }
}

/// Bidirectional forwarding loop between `stream` and `device`.
async fn forward(
    stream: &mut TcpStream,
    peer: SocketAddr,
    device: Arc<dyn TunInterface>,
    shutdown: &ShutdownSignal,
    poll_interval: Duration,
) -> SessionEnd {
    let (tun_tx, mut tun_rx) = mpsc::channel::<Vec<u8>>(256);

    // Blocking reader thread for the interface. It wakes at least once
    // per poll interval, so it notices shutdown or a closed channel
    // within that bound even when no packets arrive.
    let reader_device = Arc::clone(&device);
    let reader_shutdown = shutdown.clone();
    let tun_reader = tokio::task::spawn_blocking(move || {
        let mut read_buf = vec![0u8; 65535];

        while !reader_shutdown.is_triggered() {
            match reader_device.recv(&mut read_buf, poll_interval) {
                Ok(Some(n)) if n > 0 => {
                    if tun_tx.blocking_send(read_buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Interface read failed on {}: {}", reader_device.name(), e);
                    break;
                }
            }
            if tun_tx.is_closed() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut net_buf = vec![0u8; 65536];
    let mut tx_bytes = 0u64;
    let mut rx_bytes = 0u64;

    let end = 'session: loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                break 'session SessionEnd::Shutdown;
            }

            maybe = tun_rx.recv() => match maybe {
                Some(packet) => match encode_frame(&packet) {
                    Ok(frame) => {
                        if let Err(e) = stream.write_all(&frame).await {
                            warn!("Session {} network write failed: {}", peer, e);
                            break 'session SessionEnd::IoFailed;
                        }
                        tx_bytes += packet.len() as u64;
                        log_flow("tun->net", &packet);
                    }
                    Err(e) => {
                        debug!("Session {} dropped outbound packet: {}", peer, e);
                    }
                },
                None => {
                    warn!("Session {} interface reader stopped", peer);
                    break 'session SessionEnd::IoFailed;
                }
            },

            result = stream.read(&mut net_buf) => match result {
                Ok(0) => {
                    break 'session SessionEnd::PeerClosed;
                }
                Ok(n) => {
                    decoder.feed(&net_buf[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(payload)) => {
                                if let Err(e) = device.send(&payload) {
                                    warn!(
                                        "Session {} interface write failed: {}",
                                        peer, e
                                    );
                                    break 'session SessionEnd::IoFailed;
                                }
                                rx_bytes += payload.len() as u64;
                                log_flow("net->tun", &payload);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Session {} dropped inbound frame: {}", peer, e);
                            }
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Session {} network read failed: {}", peer, e);
                    break 'session SessionEnd::IoFailed;
                }
            },
        }
    };

    // Closing the channel fails the reader's next send, and the poll
    // timeout bounds how long it can sit without one.
    drop(tun_rx);
    if let Err(e) = tun_reader.await {
        debug!("Session {} reader task error: {}", peer, e);
    }

    debug!(
        "Session {} totals: {} bytes out, {} bytes in",
        peer, tx_bytes, rx_bytes
    );
    end
}

/// Trace-level flow log for one forwarded packet.
fn log_flow(direction: &str, packet: &[u8]) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    match classify(packet) {
        Some(info) => match info.tcp {
            Some(ref tcp) => trace!(
                "{} TCP {}:{} -> {}:{} ({} bytes)",
                direction,
                info.src_ip(),
                tcp.src_port_host(),
                info.dst_ip(),
                tcp.dst_port_host(),
                packet.len()
            ),
            None => trace!(
                "{} {} -> {} ({} bytes)",
                direction,
                info.src_ip(),
                info.dst_ip(),
                packet.len()
            ),
        },
        None => trace!("{} {} bytes (not IPv4)", direction, packet.len()),
    }
}
