//! Configuration management for the tunnel server.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::DEFAULT_PORT;

/// Tunnel server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port to listen on (default: 12345)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Name prefix for created TUN interfaces (default: "rtun")
    #[serde(default = "default_tun_name_prefix")]
    pub tun_name_prefix: String,

    /// First local address assigned inside the tunnel subnet (default: 10.8.0.1)
    #[serde(default = "default_tunnel_addr")]
    pub tunnel_addr: Ipv4Addr,

    /// Netmask of the tunnel subnet (default: 255.255.255.0)
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,

    /// Interface read poll interval in milliseconds (default: 1000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// MTU for created interfaces; kernel default when unset
    #[serde(default)]
    pub mtu: Option<u16>,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    DEFAULT_PORT
}
fn default_tun_name_prefix() -> String {
    "rtun".to_string()
}
fn default_tunnel_addr() -> Ipv4Addr {
    Ipv4Addr::new(10, 8, 0, 1)
}
fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}
fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            tun_name_prefix: default_tun_name_prefix(),
            tunnel_addr: default_tunnel_addr(),
            netmask: default_netmask(),
            poll_interval_ms: default_poll_interval_ms(),
            mtu: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: ServerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.listen_addr))?;

        if self.listen_port == 0 {
            anyhow::bail!("Listen port cannot be zero");
        }

        if self.tun_name_prefix.is_empty() {
            anyhow::bail!("Interface name prefix cannot be empty");
        }

        // IFNAMSIZ is 16 including the terminator; leave room for the
        // index the kernel appends.
        if self.tun_name_prefix.len() > 11 {
            anyhow::bail!("Interface name prefix cannot exceed 11 characters");
        }

        if !self
            .tun_name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
        {
            anyhow::bail!("Interface name prefix must be ASCII alphanumeric");
        }

        let mask = u32::from(self.netmask);
        if mask == 0 {
            anyhow::bail!("Netmask cannot be empty");
        }
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            anyhow::bail!("Netmask must have contiguous bits");
        }

        let addr = u32::from(self.tunnel_addr);
        let network = addr & mask;
        let broadcast = network | !mask;
        if addr == network {
            anyhow::bail!("Tunnel address cannot be the subnet network address");
        }
        if addr == broadcast {
            anyhow::bail!("Tunnel address cannot be the subnet broadcast address");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval cannot be zero");
        }

        if let Some(mtu) = self.mtu {
            if mtu < 576 {
                anyhow::bail!("MTU must be at least 576");
            }
        }

        Ok(())
    }

    /// Socket address to bind the listener to.
    pub fn listen_socket_addr(&self) -> crate::error::Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_addr
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen address: {}", self.listen_addr)))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.listen_addr, "0.0.0.0");
        assert_eq!(config.listen_port, 12345);
        assert_eq!(config.tun_name_prefix, "rtun");
        assert_eq!(config.tunnel_addr, Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.mtu, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        // Unparseable listen address
        config.listen_addr = "nonsense".to_string();
        assert!(config.validate().is_err());
        config.listen_addr = "127.0.0.1".to_string();

        // Zero port
        config.listen_port = 0;
        assert!(config.validate().is_err());
        config.listen_port = 12345;

        // Prefix too long for IFNAMSIZ
        config.tun_name_prefix = "waytoolongprefix".to_string();
        assert!(config.validate().is_err());
        config.tun_name_prefix = "rtun".to_string();

        // Non-contiguous netmask
        config.netmask = Ipv4Addr::new(255, 0, 255, 0);
        assert!(config.validate().is_err());
        config.netmask = Ipv4Addr::new(255, 255, 255, 0);

        // Tunnel address on the subnet boundary
        config.tunnel_addr = Ipv4Addr::new(10, 8, 0, 0);
        assert!(config.validate().is_err());
        config.tunnel_addr = Ipv4Addr::new(10, 8, 0, 255);
        assert!(config.validate().is_err());
        config.tunnel_addr = Ipv4Addr::new(10, 8, 0, 1);

        // Zero poll interval
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.poll_interval_ms = 1000;

        // MTU below the IPv4 minimum
        config.mtu = Some(100);
        assert!(config.validate().is_err());
        config.mtu = Some(1400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() -> Result<()> {
        let config = ServerConfig {
            listen_addr: "192.0.2.1".to_string(),
            listen_port: 4444,
            mtu: Some(1400),
            ..Default::default()
        };

        let json = serde_json::to_string(&config)?;
        let deserialized: ServerConfig = serde_json::from_str(&json)?;

        assert_eq!(config.listen_addr, deserialized.listen_addr);
        assert_eq!(config.listen_port, deserialized.listen_port);
        assert_eq!(config.tunnel_addr, deserialized.tunnel_addr);
        assert_eq!(config.mtu, deserialized.mtu);

        Ok(())
    }

    #[test]
    fn test_config_file_operations() -> Result<()> {
        let config = ServerConfig {
            listen_port: 4444,
            ..Default::default()
        };

        let temp_file = NamedTempFile::new()?;
        config.to_file(temp_file.path())?;

        let loaded_config = ServerConfig::from_file(temp_file.path())?;
        assert_eq!(config.listen_addr, loaded_config.listen_addr);
        assert_eq!(config.listen_port, loaded_config.listen_port);

        Ok(())
    }

    #[test]
    fn test_partial_config_uses_defaults() -> Result<()> {
        let config: ServerConfig = serde_json::from_str(r#"{"listen_port": 5555}"#)?;

        assert_eq!(config.listen_port, 5555);
        assert_eq!(config.listen_addr, "0.0.0.0");
        assert_eq!(config.tun_name_prefix, "rtun");

        Ok(())
    }

    #[test]
    fn test_listen_socket_addr() {
        let config = ServerConfig {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 9000,
            ..Default::default()
        };

        let addr = config.listen_socket_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }
}
