use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub start_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router_ip: Ipv4Addr,
    pub dns_ip: Ipv4Addr,
    pub pool_size: u32,
    pub lease_duration_seconds: u32,
    pub store_host: String,
    pub store_port: u16,
    #[serde(default = "default_max_tx_retry_attempts")]
    pub max_tx_retry_attempts: u8,
    #[serde(default = "default_reap_interval_seconds")]
    pub reap_interval_seconds: u64,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_op_timeout_seconds")]
    pub op_timeout_seconds: u64,
}

fn default_max_tx_retry_attempts() -> u8 {
    5
}

fn default_reap_interval_seconds() -> u64 {
    300
}

fn default_listen_port() -> u16 {
    67
}

fn default_op_timeout_seconds() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 249),
            start_ip: Ipv4Addr::new(192, 168, 1, 115),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router_ip: Ipv4Addr::new(192, 168, 1, 254),
            dns_ip: Ipv4Addr::new(192, 168, 1, 254),
            pool_size: 50,
            lease_duration_seconds: 3600,
            store_host: "localhost".to_string(),
            store_port: 6379,
            max_tx_retry_attempts: default_max_tx_retry_attempts(),
            reap_interval_seconds: default_reap_interval_seconds(),
            listen_port: default_listen_port(),
            op_timeout_seconds: default_op_timeout_seconds(),
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        let Some(end) = u32::from(self.start_ip).checked_add(self.pool_size - 1) else {
            return Err(Error::InvalidConfig(
                "pool extends past the end of the IPv4 address space".to_string(),
            ));
        };

        let server = u32::from(self.server_ip);
        if server >= u32::from(self.start_ip) && server <= end {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if !Self::is_valid_subnet_mask(self.subnet_mask) {
            return Err(Error::InvalidConfig(format!(
                "invalid subnet mask: {} (must be contiguous)",
                self.subnet_mask
            )));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.max_tx_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_tx_retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.reap_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "reap_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.op_timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "op_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.store_host.is_empty() {
            return Err(Error::InvalidConfig(
                "store_host must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    fn is_valid_subnet_mask(mask: Ipv4Addr) -> bool {
        let mask_bits = u32::from(mask);
        if mask_bits == 0 {
            return false;
        }
        let inverted = !mask_bits;
        inverted.count_ones() == inverted.trailing_ones()
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        let start = u32::from(self.start_ip);
        addr >= start && u64::from(addr) < u64::from(start) + u64::from(self.pool_size)
    }

    pub fn pool_end(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.start_ip) + (self.pool_size - 1))
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_seconds))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_seconds)
    }
}
