//! smoltcp behind the core's `NetworkStack` seam
//!
//! Frames are exchanged with the packet pump through a pair of queues that act
//! as the smoltcp phy. Lease, DNS and TCP are smoltcp sockets. Hardware address
//! resolution is done here by hand, since smoltcp keeps its neighbor cache
//! private: requests are emitted into the outbound queue and replies are
//! spotted on their way in.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use hygro_core::net::{
    DnsQuery, DnsRecord, LeaseInfo, LeaseRequest, LeaseState, MacAddress, NetworkStack,
    ResponseCode, StackConfig, StackFactory, TcpState,
};
use log::{debug, info, warn};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{dhcpv4, dns, tcp};
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, DhcpOption, DnsQueryType, EthernetAddress, EthernetFrame,
    EthernetProtocol, EthernetRepr, HardwareAddress, IpAddress, IpCidr, Ipv4Cidr,
};
use thiserror_no_std::Error;

use crate::smol_now;

/// Frames smoltcp may queue before the pump drains them
const TX_QUEUE_DEPTH: usize = 8;
const RX_QUEUE_DEPTH: usize = 8;

const TCP_BUFFER_LEN: usize = 2048;
const DNS_QUERY_SLOTS: usize = 1;

/// DHCP option carrying the client's host name
const DHCP_OPT_HOSTNAME: u8 = 12;

#[derive(Error, Debug)]
pub enum SmolError {
    #[error("no local address yet")]
    NoAddress,
    #[error("socket not created")]
    NoSocket,
    #[error("no reply to hardware address request")]
    ArpIncomplete,
    #[error("{0} byte frame does not fit the {1} byte buffer")]
    FrameTooLarge(usize, usize),
    #[error("inbound queue full")]
    RxQueueFull,
    #[error("starting name query failed: {0:?}")]
    Query(dns::StartQueryError),
    #[error("connect failed: {0:?}")]
    Connect(tcp::ConnectError),
    #[error("send failed: {0:?}")]
    Send(tcp::SendError),
    #[error("receive failed: {0:?}")]
    Recv(tcp::RecvError),
}

/// The smoltcp phy: inbound frames pushed by the pump, outbound frames
/// collected for it.
pub struct FrameQueue {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl FrameQueue {
    fn new(mtu: usize) -> Self {
        Self {
            rx: VecDeque::with_capacity(RX_QUEUE_DEPTH),
            tx: VecDeque::with_capacity(TX_QUEUE_DEPTH),
            mtu,
        }
    }
}

impl Device for FrameQueue {
    type RxToken<'a>
        = QueuedRx
    where
        Self: 'a;
    type TxToken<'a>
        = QueuedTx<'a>
    where
        Self: 'a;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((QueuedRx { frame }, QueuedTx { tx: &mut self.tx }))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        (self.tx.len() < TX_QUEUE_DEPTH).then(|| QueuedTx { tx: &mut self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ethernet;
        caps
    }
}

pub struct QueuedRx {
    frame: Vec<u8>,
}

impl RxToken for QueuedRx {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.frame)
    }
}

pub struct QueuedTx<'a> {
    tx: &'a mut VecDeque<Vec<u8>>,
}

impl TxToken for QueuedTx<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.tx.push_back(frame);
        result
    }
}

#[derive(Debug, Default)]
struct ArpProbe {
    target: Option<Ipv4Addr>,
    answer: Option<MacAddress>,
}

pub struct SmolStack {
    mac: MacAddress,
    device: FrameQueue,
    iface: Interface,
    sockets: SocketSet<'static>,
    tcp: SocketHandle,
    dhcp: Option<SocketHandle>,
    dns: Option<SocketHandle>,
    query: Option<dns::QueryHandle>,
    answers: Vec<DnsRecord>,
    arp: ArpProbe,
    lease: Option<LeaseInfo>,
    lease_state: LeaseState,
    local: Option<Ipv4Addr>,
    hostname_sent: bool,
}

impl SmolStack {
    pub fn new(config: &StackConfig) -> Self {
        let mut device = FrameQueue::new(config.mtu);

        let mut iface_config =
            IfaceConfig::new(HardwareAddress::Ethernet(EthernetAddress(config.mac.0)));
        iface_config.random_seed = config.random_seed;
        let iface = Interface::new(iface_config, &mut device, smol_now());

        let mut sockets = SocketSet::new(Vec::with_capacity(
            config.max_tcp_ports + config.max_udp_ports,
        ));
        let tcp = sockets.add(tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_LEN]),
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_LEN]),
        ));

        Self {
            mac: config.mac,
            device,
            iface,
            sockets,
            tcp,
            dhcp: None,
            dns: None,
            query: None,
            answers: Vec::new(),
            arp: ArpProbe::default(),
            lease: None,
            lease_state: LeaseState::Init,
            local: None,
            hostname_sent: false,
        }
    }

    fn poll_iface(&mut self) {
        self.iface.poll(smol_now(), &mut self.device, &mut self.sockets);
    }

    fn tcp_socket(&mut self) -> &mut tcp::Socket<'static> {
        self.sockets.get_mut::<tcp::Socket>(self.tcp)
    }

    fn apply_address(&mut self, cidr: Ipv4Cidr) {
        self.iface.update_ip_addrs(|addrs| {
            addrs.clear();
            if addrs.push(IpCidr::Ipv4(cidr)).is_err() {
                warn!("Interface address table full");
            }
        });
        self.local = Some(cidr.address());
    }

    fn sniff_arp_reply(&mut self, frame: &[u8]) {
        let Some(target) = self.arp.target else {
            return;
        };
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return;
        };
        if eth.ethertype() != EthernetProtocol::Arp {
            return;
        }
        let Ok(packet) = ArpPacket::new_checked(eth.payload()) else {
            return;
        };
        if let Ok(ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr,
            source_protocol_addr,
            ..
        }) = ArpRepr::parse(&packet)
            && source_protocol_addr == target
        {
            self.arp.answer = Some(MacAddress(source_hardware_addr.0));
        }
    }

    fn on_lease(&mut self, lease: LeaseInfo) {
        self.apply_address(Ipv4Cidr::new(lease.address, lease.prefix_len));
        match lease.router {
            Some(router) => {
                if self.iface.routes_mut().add_default_ipv4_route(router).is_err() {
                    warn!("Route table full, no default route");
                }
            }
            None => {
                self.iface.routes_mut().remove_default_ipv4_route();
            }
        }

        info!("Lease bound: {}/{}", lease.address, lease.prefix_len);
        self.lease = Some(lease);
        self.lease_state = LeaseState::Bound;
    }
}

fn lease_from(config: &dhcpv4::Config<'_>) -> LeaseInfo {
    let mut lease = LeaseInfo::new(config.address.address(), config.address.prefix_len());
    lease.router = config.router;
    lease.gateway = config.router;
    lease.server = Some(config.server.identifier);
    for server in config.dns_servers.iter() {
        if lease.name_servers.push(*server).is_err() {
            break;
        }
    }
    lease
}

impl NetworkStack for SmolStack {
    type Error = SmolError;

    fn receive_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        self.sniff_arp_reply(frame);
        if self.device.rx.len() >= RX_QUEUE_DEPTH {
            return Err(SmolError::RxQueueFull);
        }
        self.device.rx.push_back(frame.to_vec());
        self.poll_iface();
        Ok(())
    }

    fn poll_outbound(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.poll_iface();
        let Some(frame) = self.device.tx.pop_front() else {
            return Ok(0);
        };
        if frame.len() > buf.len() {
            return Err(SmolError::FrameTooLarge(frame.len(), buf.len()));
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn set_local_address(&mut self, ip: Ipv4Addr) {
        let prefix_len = self.lease.as_ref().map_or(24, |lease| lease.prefix_len);
        self.apply_address(Ipv4Cidr::new(ip, prefix_len));
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.local
    }

    fn arp_abort(&mut self) {
        self.arp = ArpProbe::default();
    }

    fn arp_begin(&mut self, ip: Ipv4Addr) -> Result<(), Self::Error> {
        let local = self.local.ok_or(SmolError::NoAddress)?;

        let arp = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: EthernetAddress(self.mac.0),
            source_protocol_addr: local,
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: ip,
        };
        let eth = EthernetRepr {
            src_addr: EthernetAddress(self.mac.0),
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EthernetProtocol::Arp,
        };

        let mut frame = vec![0u8; eth.buffer_len() + arp.buffer_len()];
        let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
        eth.emit(&mut eth_frame);
        arp.emit(&mut ArpPacket::new_unchecked(eth_frame.payload_mut()));
        self.device.tx.push_back(frame);

        self.arp = ArpProbe {
            target: Some(ip),
            answer: None,
        };
        Ok(())
    }

    fn arp_is_done(&mut self) -> bool {
        self.arp.answer.is_some()
    }

    fn arp_result(&mut self) -> Result<MacAddress, Self::Error> {
        self.arp.answer.ok_or(SmolError::ArpIncomplete)
    }

    fn lease_create(&mut self, port: u16) -> Result<(), Self::Error> {
        if self.dhcp.is_none() {
            debug!("Lease client on port {}", port);
            self.dhcp = Some(self.sockets.add(dhcpv4::Socket::new()));
        }
        Ok(())
    }

    fn lease_begin(&mut self, request: &LeaseRequest<'_>) -> Result<(), Self::Error> {
        let handle = self.dhcp.ok_or(SmolError::NoSocket)?;
        // smoltcp picks its own transaction id
        debug!("Lease request, transaction {:#010x}", request.transaction_id);

        let hostname = match request.hostname {
            Some(name) if !self.hostname_sent => Some(name),
            _ => None,
        };
        let socket = self.sockets.get_mut::<dhcpv4::Socket>(handle);
        if let Some(name) = hostname {
            // Outgoing options must outlive the socket; set once per boot
            let data: &'static [u8] = Box::leak(Box::<[u8]>::from(name.as_bytes()));
            let options: &'static [DhcpOption<'static>] = Box::leak(Box::new([DhcpOption {
                kind: DHCP_OPT_HOSTNAME,
                data,
            }]));
            socket.set_outgoing_options(options);
            self.hostname_sent = true;
        }
        socket.reset();
        self.lease_state = LeaseState::Selecting;
        Ok(())
    }

    fn lease_state(&mut self) -> LeaseState {
        let Some(handle) = self.dhcp else {
            return LeaseState::Init;
        };
        self.poll_iface();

        let event = match self.sockets.get_mut::<dhcpv4::Socket>(handle).poll() {
            Some(dhcpv4::Event::Configured(config)) => Some(Some(lease_from(&config))),
            Some(dhcpv4::Event::Deconfigured) => Some(None),
            None => None,
        };
        match event {
            Some(Some(lease)) => self.on_lease(lease),
            Some(None) => {
                warn!("Lease lost");
                self.lease = None;
                self.lease_state = LeaseState::Selecting;
            }
            None => {}
        }
        self.lease_state
    }

    fn lease_info(&self) -> Option<LeaseInfo> {
        self.lease.clone()
    }

    fn dns_create(&mut self, port: u16) -> Result<(), Self::Error> {
        if self.dns.is_none() {
            debug!("Name client on port {}", port);
            let queries: Vec<Option<dns::DnsQuery>> = (0..DNS_QUERY_SLOTS).map(|_| None).collect();
            self.dns = Some(self.sockets.add(dns::Socket::new(&[], queries)));
        }
        Ok(())
    }

    fn dns_start(&mut self, query: &DnsQuery<'_>) -> Result<(), Self::Error> {
        let handle = self.dns.ok_or(SmolError::NoSocket)?;
        let socket = self.sockets.get_mut::<dns::Socket>(handle);
        if let Some(previous) = self.query.take() {
            socket.cancel_query(previous);
        }
        socket.update_servers(&[IpAddress::Ipv4(query.server)]);

        let started = socket
            .start_query(self.iface.context(), query.name, DnsQueryType::A)
            .map_err(SmolError::Query)?;
        self.query = Some(started);
        self.answers.clear();
        Ok(())
    }

    fn dns_poll(&mut self) -> Option<ResponseCode> {
        let handle = self.dns?;
        let query = self.query?;
        self.poll_iface();

        match self.sockets.get_mut::<dns::Socket>(handle).get_query_result(query) {
            Ok(addresses) => {
                self.query = None;
                self.answers = addresses
                    .iter()
                    .filter_map(|address| match address {
                        IpAddress::Ipv4(v4) => Some(DnsRecord::new(&v4.octets())),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    })
                    .collect();
                Some(ResponseCode::Success)
            }
            Err(dns::GetQueryResultError::Pending) => None,
            Err(dns::GetQueryResultError::Failed) => {
                // smoltcp does not report the server's response code
                self.query = None;
                Some(ResponseCode::ServerFailure)
            }
        }
    }

    fn dns_answers(&mut self) -> Vec<DnsRecord> {
        core::mem::take(&mut self.answers)
    }

    fn close_udp(&mut self, port: u16) {
        if let (Some(handle), Some(query)) = (self.dns, self.query.take()) {
            debug!("Cancelling name query on port {}", port);
            self.sockets.get_mut::<dns::Socket>(handle).cancel_query(query);
        }
    }

    fn tcp_open(
        &mut self,
        local_port: u16,
        _next_hop: MacAddress,
        remote: SocketAddrV4,
    ) -> Result<(), Self::Error> {
        let socket = self.sockets.get_mut::<tcp::Socket>(self.tcp);
        if socket.is_open() {
            socket.abort();
        }
        socket
            .connect(
                self.iface.context(),
                (IpAddress::Ipv4(*remote.ip()), remote.port()),
                local_port,
            )
            .map_err(SmolError::Connect)
    }

    fn tcp_state(&self) -> TcpState {
        match self.sockets.get::<tcp::Socket>(self.tcp).state() {
            tcp::State::Closed => TcpState::Closed,
            tcp::State::Listen => TcpState::Listen,
            tcp::State::SynSent => TcpState::SynSent,
            tcp::State::SynReceived => TcpState::SynReceived,
            tcp::State::Established => TcpState::Established,
            tcp::State::FinWait1 => TcpState::FinWait1,
            tcp::State::FinWait2 => TcpState::FinWait2,
            tcp::State::CloseWait => TcpState::CloseWait,
            tcp::State::Closing => TcpState::Closing,
            tcp::State::LastAck => TcpState::LastAck,
            tcp::State::TimeWait => TcpState::TimeWait,
        }
    }

    fn tcp_set_timeout(&mut self, timeout: Option<Duration>) {
        let timeout =
            timeout.map(|t| smoltcp::time::Duration::from_millis(t.as_millis() as u64));
        self.tcp_socket().set_timeout(timeout);
    }

    fn tcp_send(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        let socket = self.tcp_socket();
        if !socket.can_send() {
            return Ok(0);
        }
        socket.send_slice(data).map_err(SmolError::Send)
    }

    fn tcp_recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.tcp_socket().recv_slice(buf) {
            Ok(n) => Ok(n),
            Err(tcp::RecvError::Finished) => Ok(0),
            Err(e) => Err(SmolError::Recv(e)),
        }
    }

    fn tcp_close(&mut self) -> Result<(), Self::Error> {
        self.tcp_socket().close();
        Ok(())
    }

    fn tcp_abort(&mut self) {
        self.tcp_socket().abort();
    }
}

/// Builds a `SmolStack`. smoltcp allocates from the heap and cannot fail here.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmolStackFactory;

impl StackFactory for SmolStackFactory {
    type Stack = SmolStack;

    fn create(&mut self, config: &StackConfig) -> Option<Self::Stack> {
        info!(
            "Creating stack: mtu {}, {} TCP and {} UDP sockets",
            config.mtu, config.max_tcp_ports, config.max_udp_ports
        );
        Some(SmolStack::new(config))
    }
}
