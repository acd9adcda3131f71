pub mod cache_key;
pub mod checksum;
pub mod config;
pub mod error;
pub mod fsutil;
#[cfg(feature = "http")]
pub mod http;
pub mod ldd;
pub mod policy;
