//! Server-side TCP-to-TUN tunnel endpoint.
//!
//! Accepts TCP clients and bridges each one to its own Linux TUN
//! interface: length-prefixed frames arriving on the socket become raw
//! IP packets on the interface, and packets the kernel routes into the
//! interface travel back to the client as frames.

pub mod classify;
pub mod config;
pub mod device;
pub mod error;
pub mod framing;
pub mod server;
pub mod session;
pub mod shutdown;

// Re-export main types
pub use classify::{classify, PacketInfo, TcpInfo};
pub use config::ServerConfig;
pub use device::{DeviceManager, TunInterface, TunManager};
pub use error::{Error, Result};
pub use framing::{encode_frame, FrameDecoder, MAX_FRAME_LEN};
pub use server::TunnelServer;
pub use session::{ClientSession, SessionEnd};
pub use shutdown::{watch_signals, ShutdownSignal};

// Default configuration constants
pub const DEFAULT_CONFIG_FILE: &str = "tunneld.json";
pub const DEFAULT_PORT: u16 = 12345;
