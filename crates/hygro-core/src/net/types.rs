//! Plain data shared by the bring-up, resolver and request paths

use core::fmt;
use core::net::Ipv4Addr;
use core::time::Duration;

/// Maximum number of name servers kept from a lease
pub const MAX_NAME_SERVERS: usize = 3;

/// A 6-byte link-layer (MAC) address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Where the network bring-up currently is.
///
/// Stages are attempted strictly in declaration order, so knowing the current
/// stage tells how far initialization got. Spending a long time on one stage
/// usually means the step after it keeps failing and being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BringUpStage {
    #[default]
    Uninitialized,
    CreatingDevice,
    ConnectingToWiFi,
    CreatingStack,
    ObtainingAddress,
    ConfiguringNameResolution,
    ObtainingGatewayHardwareAddress,
    Ready,
}

impl BringUpStage {
    /// Stages the bring-up task works through, in order
    pub const SEQUENCE: [Self; 6] = [
        Self::CreatingDevice,
        Self::ConnectingToWiFi,
        Self::CreatingStack,
        Self::ObtainingAddress,
        Self::ConfiguringNameResolution,
        Self::ObtainingGatewayHardwareAddress,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::CreatingDevice => "CreatingDevice",
            Self::ConnectingToWiFi => "ConnectingToWiFi",
            Self::CreatingStack => "CreatingStack",
            Self::ObtainingAddress => "ObtainingAddress",
            Self::ConfiguringNameResolution => "ConfiguringNameResolution",
            Self::ObtainingGatewayHardwareAddress => "ObtainingGatewayHardwareAddress",
            Self::Ready => "Ready",
        }
    }

    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for BringUpStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the address-lease client learned from the lease server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub router: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub server: Option<Ipv4Addr>,
    pub name_servers: heapless::Vec<Ipv4Addr, MAX_NAME_SERVERS>,
    pub hostname: Option<heapless::String<32>>,
    pub lease_time: Option<Duration>,
    pub renewal_time: Option<Duration>,
    pub rebinding_time: Option<Duration>,
}

impl LeaseInfo {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
            router: None,
            gateway: None,
            server: None,
            name_servers: heapless::Vec::new(),
            hostname: None,
            lease_time: None,
            renewal_time: None,
            rebinding_time: None,
        }
    }

    /// The first usable name server, if the lease carried one
    pub fn primary_name_server(&self) -> Option<Ipv4Addr> {
        self.name_servers
            .first()
            .copied()
            .filter(|ip| !ip.is_unspecified() && !ip.is_broadcast())
    }

    /// Address of the next hop for off-link traffic
    pub fn default_route(&self) -> Option<Ipv4Addr> {
        self.router.or(self.gateway)
    }

    pub fn netmask(&self) -> u32 {
        netmask(self.prefix_len)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | !self.netmask())
    }

    /// Whether `ip` sits inside the leased subnet
    pub fn is_on_link(&self, ip: Ipv4Addr) -> bool {
        same_subnet(self.address, ip, self.prefix_len)
    }
}

const fn netmask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len if len >= 32 => u32::MAX,
        len => u32::MAX << (32 - len),
    }
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, prefix_len: u8) -> bool {
    let mask = netmask(prefix_len);
    u32::from(a) & mask == u32::from(b) & mask
}

/// Immutable view of the network published once bring-up reaches `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub local_mac: MacAddress,
    pub local_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddress,
    pub name_server: Ipv4Addr,
    /// Hardware address DNS queries are sent to
    pub name_server_mac: MacAddress,
}

impl NetworkInfo {
    pub fn is_on_link(&self, ip: Ipv4Addr) -> bool {
        same_subnet(self.local_ip, ip, self.prefix_len)
    }
}
