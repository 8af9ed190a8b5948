//! Skailar chat-completion client with proxy reachability probing.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod stream;
pub mod types;

pub use client::SkailarClient;
pub use error::SkailarError;
pub use proxy::{ClientProvider, InstanceProvider, ProxyConfig};
pub use types::*;
