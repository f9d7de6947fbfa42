pub mod config;
pub mod error;
pub mod interface;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod rpc;
#[cfg(test)]
mod test_util;
pub mod types;

pub use config::{InterfaceConfig, TlsPolicy};
pub use error::{CoreError, RpcError};
pub use interface::Interface;
pub use proxy::{parse_proxy, ProxyConfig, ProxyMode, ProxySetting};
pub use types::{Callback, ConnectionState, Endpoint, Event, Message, Protocol, Response};
