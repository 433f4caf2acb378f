pub mod config;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod reaper;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use lease::{LeaseAllocator, MacAddr};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use reaper::Reaper;
pub use server::{DhcpServer, Handler};
pub use store::{MemoryStore, RedisStore, Store};
