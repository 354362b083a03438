//! End-to-end tests against a bound server with in-memory interfaces.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

use tunneld::{
    encode_frame, DeviceManager, Error, Result, ServerConfig, ShutdownSignal, TunInterface,
    TunnelServer,
};

const WAIT: Duration = Duration::from_secs(5);

/// In-memory stand-in for a TUN interface.
struct TestDevice {
    incoming: Mutex<std_mpsc::Receiver<Vec<u8>>>,
    written: UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl TestDevice {
    #[allow(clippy::type_complexity)]
    fn new() -> (
        Arc<Self>,
        std_mpsc::Sender<Vec<u8>>,
        UnboundedReceiver<Vec<u8>>,
        Arc<AtomicBool>,
    ) {
        let (inject_tx, inject_rx) = std_mpsc::channel();
        let (written_tx, written_rx) = unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let device = Arc::new(Self {
            incoming: Mutex::new(inject_rx),
            written: written_tx,
            closed: Arc::clone(&closed),
        });
        (device, inject_tx, written_rx, closed)
    }
}

impl TunInterface for TestDevice {
    fn name(&self) -> &str {
        "testtun0"
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let rx = self.incoming.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(Some(n))
            }
            Err(_) => Ok(None),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.written
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "device gone"))?;
        Ok(buf.len())
    }
}

impl Drop for TestDevice {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Manager that serves scripted acquire outcomes in order.
struct TestManager {
    devices: Mutex<Vec<Option<Arc<TestDevice>>>>,
}

impl TestManager {
    fn with(devices: Vec<Option<Arc<TestDevice>>>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
        })
    }
}

impl DeviceManager for TestManager {
    fn acquire(&self) -> Result<Arc<dyn TunInterface>> {
        let mut devices = self.devices.lock().unwrap();
        let next = if devices.is_empty() {
            None
        } else {
            devices.remove(0)
        };
        match next {
            Some(device) => Ok(device),
            None => Err(Error::DeviceUnavailable("no test device".to_string())),
        }
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1".to_string(),
        listen_port: 0,
        poll_interval_ms: 50,
        ..Default::default()
    }
}

async fn start_server(
    manager: Arc<dyn DeviceManager>,
    shutdown: ShutdownSignal,
) -> (SocketAddr, tokio::task::JoinHandle<Result<()>>) {
    let server = TunnelServer::bind(&test_config(), manager, shutdown).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());
    (addr, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn forwards_frames_between_socket_and_interface() {
    let (device, inject, mut written, _closed) = TestDevice::new();
    let shutdown = ShutdownSignal::new();
    let (addr, server) =
        start_server(TestManager::with(vec![Some(device)]), shutdown.clone()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Client to interface.
    let frame = encode_frame(b"ping").unwrap();
    client.write_all(&frame).await.unwrap();
    let delivered = timeout(WAIT, written.recv())
        .await
        .expect("interface should receive the payload")
        .expect("channel open");
    assert_eq!(delivered, b"ping");

    // Interface to client.
    inject.send(b"pong".to_vec()).unwrap();
    let mut framed = [0u8; 8];
    timeout(WAIT, client.read_exact(&mut framed))
        .await
        .expect("frame should arrive")
        .unwrap();
    assert_eq!(&framed[..4], &[0, 0, 0, 4]);
    assert_eq!(&framed[4..], b"pong");

    shutdown.trigger();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_length_prefix_keeps_connection_alive() {
    let (device, inject, mut written, _closed) = TestDevice::new();
    let shutdown = ShutdownSignal::new();
    let (addr, server) =
        start_server(TestManager::with(vec![Some(device)]), shutdown.clone()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Zero length prefix followed by a valid frame.
    let mut bytes = vec![0, 0, 0, 0];
    bytes.extend_from_slice(&encode_frame(b"after").unwrap());
    client.write_all(&bytes).await.unwrap();

    let delivered = timeout(WAIT, written.recv())
        .await
        .expect("valid frame should still arrive")
        .expect("channel open");
    assert_eq!(delivered, b"after");

    // The session survived; traffic still flows the other way.
    inject.send(b"still-here".to_vec()).unwrap();
    let mut framed = [0u8; 14];
    timeout(WAIT, client.read_exact(&mut framed))
        .await
        .expect("frame should arrive")
        .unwrap();
    assert_eq!(&framed[..4], &[0, 0, 0, 10]);
    assert_eq!(&framed[4..], b"still-here");

    shutdown.trigger();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn device_failure_closes_socket_but_not_listener() {
    let (device, _inject, mut written, _closed) = TestDevice::new();
    let shutdown = ShutdownSignal::new();
    // First connection gets no interface, the second gets a working one.
    let manager = TestManager::with(vec![None, Some(device)]);
    let (addr, server) = start_server(manager, shutdown.clone()).await;

    let mut unlucky = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, unlucky.read(&mut buf))
        .await
        .expect("read should complete")
        .unwrap();
    assert_eq!(n, 0, "failed session should close its socket");

    let mut lucky = TcpStream::connect(addr).await.unwrap();
    let frame = encode_frame(b"second").unwrap();
    lucky.write_all(&frame).await.unwrap();
    let delivered = timeout(WAIT, written.recv())
        .await
        .expect("second session should forward")
        .expect("channel open");
    assert_eq!(delivered, b"second");

    shutdown.trigger();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_server_and_closes_sessions() {
    let (device, _inject, mut written, closed) = TestDevice::new();
    let shutdown = ShutdownSignal::new();
    let (addr, server) =
        start_server(TestManager::with(vec![Some(device)]), shutdown.clone()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Confirm the session is up before pulling the plug.
    let frame = encode_frame(b"hello").unwrap();
    client.write_all(&frame).await.unwrap();
    let delivered = timeout(WAIT, written.recv())
        .await
        .expect("session should be forwarding")
        .expect("channel open");
    assert_eq!(delivered, b"hello");

    shutdown.trigger();

    // The listener task winds down cleanly.
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();

    // The session saw it too: socket closed, interface released.
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, client.read(&mut buf))
        .await
        .expect("read should complete")
        .unwrap();
    assert_eq!(n, 0);
    assert!(closed.load(Ordering::SeqCst), "interface should be released");

    // And nothing is listening anymore.
    assert!(TcpStream::connect(addr).await.is_err());
}
