//! Network stack seam
//!
//! The stack (Ethernet framing, the lease protocol, DNS/ARP wire encoding and
//! the TCP state machine) is a black box. Each of its protocol clients follows
//! the same start/poll shape: begin an operation, then ask whether it is done.
//! Nothing here blocks; waiting is done by the callers with bounded retries.

use alloc::vec::Vec;
use core::fmt::{self, Debug};
use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use super::types::{LeaseInfo, MacAddress};

/// Parameters for creating the network stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    pub mac: MacAddress,
    pub max_tcp_ports: usize,
    pub max_udp_ports: usize,
    pub mtu: usize,
    pub random_seed: u64,
}

pub trait StackFactory {
    type Stack: NetworkStack;

    fn create(&mut self, config: &StackConfig) -> Option<Self::Stack>;
}

/// Progress of the address-lease client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Init,
    Selecting,
    Requesting,
    Bound,
}

/// Parameters of one lease request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRequest<'a> {
    pub transaction_id: u32,
    pub hostname: Option<&'a str>,
}

/// Record types a query can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
}

/// Record classes a query can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Internet,
}

/// A single-question DNS query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsQuery<'a> {
    pub name: &'a str,
    pub qtype: QueryType,
    pub qclass: QueryClass,
    pub server: Ipv4Addr,
    /// Hardware address the query frame is sent to
    pub server_mac: MacAddress,
    pub recursion_desired: bool,
}

/// DNS response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Other(u8),
}

impl ResponseCode {
    pub const fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::FormatError,
            2 => Self::ServerFailure,
            3 => Self::NameError,
            4 => Self::NotImplemented,
            5 => Self::Refused,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::FormatError => f.write_str("format error"),
            Self::ServerFailure => f.write_str("server failure"),
            Self::NameError => f.write_str("name error"),
            Self::NotImplemented => f.write_str("not implemented"),
            Self::Refused => f.write_str("refused"),
            Self::Other(code) => write!(f, "rcode {code}"),
        }
    }
}

/// Raw resource record data of one answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub data: heapless::Vec<u8, 16>,
}

impl DnsRecord {
    pub fn new(data: &[u8]) -> Self {
        let mut record = Self {
            data: heapless::Vec::new(),
        };
        let len = data.len().min(record.data.capacity());
        let _ = record.data.extend_from_slice(&data[..len]);
        record
    }

    /// The record as an IPv4 address, if it is 4 bytes long
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }
}

/// TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::TimeWait)
    }

    /// Whether the peer will send no more data
    pub const fn peer_finished(self) -> bool {
        matches!(
            self,
            Self::Closed | Self::CloseWait | Self::LastAck | Self::Closing | Self::TimeWait
        )
    }
}

/// The calls the core makes into the network stack.
///
/// One stack instance carries one TCP connection at a time and one outstanding
/// ARP and DNS resolution each.
pub trait NetworkStack {
    type Error: Debug;

    // Link layer

    /// Hand one inbound Ethernet frame to the stack
    fn receive_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Write the next pending outbound frame into `buf`.
    ///
    /// Returns its length, 0 when nothing is pending.
    fn poll_outbound(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    // Addressing

    fn set_local_address(&mut self, ip: Ipv4Addr);

    fn local_address(&self) -> Option<Ipv4Addr>;

    // Hardware address resolution

    /// Forget any outstanding resolution. Calling it with none pending is fine.
    fn arp_abort(&mut self);

    fn arp_begin(&mut self, ip: Ipv4Addr) -> Result<(), Self::Error>;

    fn arp_is_done(&mut self) -> bool;

    fn arp_result(&mut self) -> Result<MacAddress, Self::Error>;

    // Address lease

    fn lease_create(&mut self, port: u16) -> Result<(), Self::Error>;

    fn lease_begin(&mut self, request: &LeaseRequest<'_>) -> Result<(), Self::Error>;

    fn lease_state(&mut self) -> LeaseState;

    /// The lease details, once bound
    fn lease_info(&self) -> Option<LeaseInfo>;

    // Name resolution

    fn dns_create(&mut self, port: u16) -> Result<(), Self::Error>;

    fn dns_start(&mut self, query: &DnsQuery<'_>) -> Result<(), Self::Error>;

    /// The response code once the outstanding query is done
    fn dns_poll(&mut self) -> Option<ResponseCode>;

    fn dns_answers(&mut self) -> Vec<DnsRecord>;

    /// Release a UDP port opened by one of the protocol clients
    fn close_udp(&mut self, port: u16);

    // TCP

    fn tcp_open(
        &mut self,
        local_port: u16,
        next_hop: MacAddress,
        remote: SocketAddrV4,
    ) -> Result<(), Self::Error>;

    fn tcp_state(&self) -> TcpState;

    /// Deadline after which the stack gives up on an unresponsive peer
    fn tcp_set_timeout(&mut self, timeout: Option<Duration>);

    /// Queue bytes for sending. Returns how many were accepted.
    fn tcp_send(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Copy received bytes into `buf`. Returns 0 when none are buffered.
    fn tcp_recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Begin a graceful close
    fn tcp_close(&mut self) -> Result<(), Self::Error>;

    /// Drop the connection immediately
    fn tcp_abort(&mut self);
}
