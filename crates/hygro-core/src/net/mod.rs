//! Network bring-up and request orchestration
//!
//! The pieces, leaves first:
//! - [`resolver`]: ARP-style hardware address and DNS name resolution
//! - [`pump`]: moves link-layer frames between the radio and the stack
//! - [`bring_up`]: the staged state machine taking the device to `Ready`
//! - [`http`]: one HTTP GET over a freshly dialed TCP connection
//!
//! All of them share a [`NetworkContext`], which owns the stack handle and
//! publishes the current [`BringUpStage`].

pub mod bring_up;
pub mod context;
pub mod device;
pub mod error;
pub mod http;
pub mod pump;
pub mod resolver;
pub mod stack;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bring_up::{BringUp, PumpLauncher};
pub use context::NetworkContext;
pub use device::{RadioConfig, RadioDevice, RadioFactory};
pub use error::NetError;
pub use http::{HttpClient, HttpResponse};
pub use pump::PacketPump;
pub use stack::{
    DnsQuery, DnsRecord, LeaseRequest, LeaseState, NetworkStack, QueryClass, QueryType,
    ResponseCode, StackConfig, StackFactory, TcpState,
};
pub use types::{BringUpStage, LeaseInfo, MacAddress, NetworkInfo};

/// UDP port of the DHCP client
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Local UDP port used for DNS queries
pub const DNS_CLIENT_PORT: u16 = 53;

/// We need one TCP port to make one HTTP request at a time
pub const TCP_PORTS: usize = 1;

/// We need two UDP ports: one for DHCP, one for DNS
pub const UDP_PORTS: usize = 2;

/// Size of each outbound frame buffer in the packet pump
pub const MAX_FRAME_LEN: usize = 1536;
