use std::net::Ipv4Addr;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("No available IP addresses in pool")]
    PoolExhausted,

    #[error("Availability bitset is not initialized in the store")]
    BitsetMissing,

    #[error("No address mapping initialized in the store")]
    NoMapping,

    #[error("Max retry transaction attempts exceeded ({0})")]
    RetryExhausted(u8),

    #[error("Operation deadline exceeded")]
    Deadline,

    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
