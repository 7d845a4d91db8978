//! Scripted collaborators for the unit tests

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use embedded_hal_async::delay::DelayNs;

use super::bring_up::PumpLauncher;
use super::context::NetworkContext;
use super::device::{RadioConfig, RadioDevice, RadioFactory};
use super::stack::{
    DnsQuery, DnsRecord, LeaseRequest, LeaseState, NetworkStack, ResponseCode, StackConfig,
    StackFactory, TcpState,
};
use super::types::{LeaseInfo, MacAddress, NetworkInfo};

pub const LOCAL_MAC: MacAddress = MacAddress([0x28, 0xcd, 0xc1, 0x00, 0x00, 0x01]);
pub const GATEWAY_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0xfe]);
pub const NAME_SERVER_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x35]);
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const NAME_SERVER_IP: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_network_info() -> NetworkInfo {
    NetworkInfo {
        local_mac: LOCAL_MAC,
        local_ip: LOCAL_IP,
        prefix_len: 24,
        gateway_ip: GATEWAY_IP,
        gateway_mac: GATEWAY_MAC,
        name_server: NAME_SERVER_IP,
        name_server_mac: GATEWAY_MAC,
    }
}

pub fn test_lease() -> LeaseInfo {
    let mut lease = LeaseInfo::new(LOCAL_IP, 24);
    lease.router = Some(GATEWAY_IP);
    lease.gateway = Some(GATEWAY_IP);
    lease.server = Some(GATEWAY_IP);
    lease.name_servers.push(NAME_SERVER_IP).unwrap();
    lease.lease_time = Some(Duration::from_secs(86_400));
    lease
}

/// Delay that only advances a virtual clock
#[derive(Clone, Default)]
pub struct MockDelay<'a> {
    elapsed_ns: Rc<Cell<u64>>,
    sleeps_ms: Rc<RefCell<Vec<u32>>>,
    on_sleep: Option<Rc<dyn Fn() + 'a>>,
}

impl<'a> MockDelay<'a> {
    pub fn new() -> Self {
        Self {
            elapsed_ns: Rc::new(Cell::new(0)),
            sleeps_ms: Rc::new(RefCell::new(Vec::new())),
            on_sleep: None,
        }
    }

    /// Run `f` every time something sleeps
    pub fn observing(f: impl Fn() + 'a) -> Self {
        Self {
            on_sleep: Some(Rc::new(f)),
            ..Self::new()
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.get())
    }

    pub fn sleeps_ms(&self) -> Vec<u32> {
        self.sleeps_ms.borrow().clone()
    }

    fn advance(&mut self, ns: u64) {
        self.elapsed_ns.set(self.elapsed_ns.get() + ns);
        if let Some(f) = &self.on_sleep {
            f();
        }
    }
}

impl DelayNs for MockDelay<'_> {
    async fn delay_ns(&mut self, ns: u32) {
        self.advance(u64::from(ns));
    }

    async fn delay_us(&mut self, us: u32) {
        self.advance(u64::from(us) * 1_000);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.sleeps_ms.borrow_mut().push(ms);
        self.advance(u64::from(ms) * 1_000_000);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// Observable state of a [`MockRadio`], shared with the test
#[derive(Debug, Default)]
pub struct RadioState {
    pub init_failures: usize,
    pub init_calls: usize,
    pub mac_failures: usize,
    pub join_failures: usize,
    pub join_calls: usize,
    pub joined_ssid: Option<String>,
    pub inbound: VecDeque<Vec<u8>>,
    pub poll_calls: usize,
    /// Remaining sends that fail; `usize::MAX` fails forever
    pub send_failures: usize,
    pub send_attempts: Vec<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct MockRadio {
    pub state: Rc<RefCell<RadioState>>,
}

impl RadioDevice for MockRadio {
    type Error = MockError;

    async fn initialize(&mut self, _config: &RadioConfig) -> Result<(), MockError> {
        let mut state = self.state.borrow_mut();
        state.init_calls += 1;
        take_failure(&mut state.init_failures)
    }

    fn hardware_address(&self) -> Result<MacAddress, MockError> {
        let mut state = self.state.borrow_mut();
        take_failure(&mut state.mac_failures).map(|()| LOCAL_MAC)
    }

    async fn join_network(&mut self, ssid: &str, _password: &str) -> Result<(), MockError> {
        let mut state = self.state.borrow_mut();
        state.join_calls += 1;
        take_failure(&mut state.join_failures)?;
        state.joined_ssid = Some(ssid.to_string());
        Ok(())
    }

    fn mtu(&self) -> usize {
        1514
    }

    fn poll_one_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MockError> {
        let mut state = self.state.borrow_mut();
        state.poll_calls += 1;
        Ok(state.inbound.pop_front().map(|frame| {
            buf[..frame.len()].copy_from_slice(&frame);
            frame.len()
        }))
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), MockError> {
        let mut state = self.state.borrow_mut();
        state.send_attempts.push(frame.to_vec());
        take_failure(&mut state.send_failures)?;
        state.sent.push(frame.to_vec());
        Ok(())
    }
}

fn take_failure(remaining: &mut usize) -> Result<(), MockError> {
    if *remaining == 0 {
        return Ok(());
    }
    if *remaining != usize::MAX {
        *remaining -= 1;
    }
    Err(MockError)
}

pub struct MockRadioFactory {
    pub failures: usize,
    pub calls: usize,
    pub radio: Option<MockRadio>,
}

impl MockRadioFactory {
    pub fn new(radio: MockRadio) -> Self {
        Self {
            failures: 0,
            calls: 0,
            radio: Some(radio),
        }
    }
}

impl RadioFactory for &mut MockRadioFactory {
    type Radio = MockRadio;

    fn create(&mut self) -> Option<MockRadio> {
        self.calls += 1;
        take_failure(&mut self.failures).ok()?;
        self.radio.take()
    }
}

/// Keeps the radio instead of starting a pump
#[derive(Default)]
pub struct CaptureLauncher {
    pub launched: Vec<MockRadio>,
}

impl<'a> PumpLauncher<'a, MockStack, MockRadio> for &mut CaptureLauncher {
    fn launch(&mut self, _ctx: &'a NetworkContext<MockStack>, radio: MockRadio) {
        self.launched.push(radio);
    }
}

pub struct MockStackFactory {
    pub failures: usize,
    pub configs: Vec<StackConfig>,
    pub stack: Option<MockStack>,
}

impl MockStackFactory {
    pub fn new(stack: MockStack) -> Self {
        Self {
            failures: 0,
            configs: Vec::new(),
            stack: Some(stack),
        }
    }
}

impl StackFactory for &mut MockStackFactory {
    type Stack = MockStack;

    fn create(&mut self, config: &StackConfig) -> Option<MockStack> {
        self.configs.push(*config);
        take_failure(&mut self.failures).ok()?;
        self.stack.take()
    }
}

/// Scripted network stack.
///
/// Protocol clients complete after a configurable number of "is done" polls.
#[derive(Debug)]
pub struct MockStack {
    pub received: Vec<Vec<u8>>,
    pub outbound: VecDeque<Result<Vec<u8>, MockError>>,
    pub poll_outbound_calls: usize,
    pub local: Option<Ipv4Addr>,

    pub arp_table: Vec<(Ipv4Addr, MacAddress)>,
    pub arp_done_after: usize,
    pub arp_target: Option<Ipv4Addr>,
    pub arp_polls: usize,
    pub arp_aborts: usize,
    pub arp_begins: Vec<Ipv4Addr>,

    pub lease_create_failures: usize,
    pub lease_begin_failures: usize,
    /// Polls until the lease binds; `usize::MAX` never binds
    pub lease_bound_after: usize,
    pub lease_polls: usize,
    pub lease: Option<LeaseInfo>,
    pub lease_requests: Vec<(u32, Option<String>)>,

    pub dns_port: Option<u16>,
    pub dns_queries: Vec<(String, Ipv4Addr, MacAddress, bool)>,
    /// Polls until the query is answered; `None` never answers
    pub dns_done_after: Option<usize>,
    pub dns_polls: usize,
    pub dns_code: ResponseCode,
    pub dns_records: Vec<DnsRecord>,
    pub closed_udp: Vec<u16>,

    pub tcp_opens: Vec<(u16, MacAddress, SocketAddrV4)>,
    pub tcp_open_fails: bool,
    /// State polls until the handshake completes; `None` never completes
    pub tcp_established_after: Option<usize>,
    pub tcp_state: Cell<TcpState>,
    pub tcp_state_polls: Cell<usize>,
    pub tcp_timeouts: Vec<Option<Duration>>,
    pub tcp_written: Vec<u8>,
    pub tcp_send_window: usize,
    pub tcp_response: VecDeque<u8>,
    pub tcp_recv_chunk: usize,
    /// Empty receives before each chunk is handed out
    pub tcp_recv_gap: usize,
    pub tcp_recv_stalls: usize,
    /// Whether the peer closes its side once the response is drained
    pub tcp_peer_closes: bool,
    pub tcp_close_calls: usize,
    pub tcp_close_polls: Cell<usize>,
    /// State polls after `tcp_close` until fully closed; `usize::MAX` never
    pub tcp_closed_after: usize,
    pub tcp_aborts: usize,
}

impl Default for MockStack {
    fn default() -> Self {
        Self {
            received: Vec::new(),
            outbound: VecDeque::new(),
            poll_outbound_calls: 0,
            local: None,
            arp_table: alloc::vec![(GATEWAY_IP, GATEWAY_MAC)],
            arp_done_after: 1,
            arp_target: None,
            arp_polls: 0,
            arp_aborts: 0,
            arp_begins: Vec::new(),
            lease_create_failures: 0,
            lease_begin_failures: 0,
            lease_bound_after: 2,
            lease_polls: 0,
            lease: Some(test_lease()),
            lease_requests: Vec::new(),
            dns_port: None,
            dns_queries: Vec::new(),
            dns_done_after: Some(2),
            dns_polls: 0,
            dns_code: ResponseCode::Success,
            dns_records: alloc::vec![DnsRecord::new(&[203, 0, 113, 7])],
            closed_udp: Vec::new(),
            tcp_opens: Vec::new(),
            tcp_open_fails: false,
            tcp_established_after: Some(2),
            tcp_state: Cell::new(TcpState::Closed),
            tcp_state_polls: Cell::new(0),
            tcp_timeouts: Vec::new(),
            tcp_written: Vec::new(),
            tcp_send_window: usize::MAX,
            tcp_response: VecDeque::new(),
            tcp_recv_chunk: 64,
            tcp_recv_gap: 0,
            tcp_recv_stalls: 0,
            tcp_peer_closes: true,
            tcp_close_calls: 0,
            tcp_close_polls: Cell::new(0),
            tcp_closed_after: 2,
            tcp_aborts: 0,
        }
    }
}

impl MockStack {
    pub fn with_response(mut self, response: &[u8]) -> Self {
        self.tcp_response = response.iter().copied().collect();
        self
    }
}

impl NetworkStack for MockStack {
    type Error = MockError;

    fn receive_frame(&mut self, frame: &[u8]) -> Result<(), MockError> {
        self.received.push(frame.to_vec());
        Ok(())
    }

    fn poll_outbound(&mut self, buf: &mut [u8]) -> Result<usize, MockError> {
        self.poll_outbound_calls += 1;
        match self.outbound.pop_front() {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(frame)) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
        }
    }

    fn set_local_address(&mut self, ip: Ipv4Addr) {
        self.local = Some(ip);
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.local
    }

    fn arp_abort(&mut self) {
        self.arp_aborts += 1;
        self.arp_target = None;
        self.arp_polls = 0;
    }

    fn arp_begin(&mut self, ip: Ipv4Addr) -> Result<(), MockError> {
        self.arp_begins.push(ip);
        self.arp_target = Some(ip);
        self.arp_polls = 0;
        Ok(())
    }

    fn arp_is_done(&mut self) -> bool {
        self.arp_polls += 1;
        let known = self
            .arp_target
            .is_some_and(|target| self.arp_table.iter().any(|(ip, _)| *ip == target));
        known && self.arp_polls >= self.arp_done_after
    }

    fn arp_result(&mut self) -> Result<MacAddress, MockError> {
        let target = self.arp_target.ok_or(MockError)?;
        self.arp_table
            .iter()
            .find(|(ip, _)| *ip == target)
            .map(|(_, mac)| *mac)
            .ok_or(MockError)
    }

    fn lease_create(&mut self, _port: u16) -> Result<(), MockError> {
        take_failure(&mut self.lease_create_failures)
    }

    fn lease_begin(&mut self, request: &LeaseRequest<'_>) -> Result<(), MockError> {
        take_failure(&mut self.lease_begin_failures)?;
        self.lease_requests.push((
            request.transaction_id,
            request.hostname.map(ToString::to_string),
        ));
        Ok(())
    }

    fn lease_state(&mut self) -> LeaseState {
        self.lease_polls += 1;
        if self.lease_polls >= self.lease_bound_after {
            LeaseState::Bound
        } else {
            LeaseState::Requesting
        }
    }

    fn lease_info(&self) -> Option<LeaseInfo> {
        self.lease.clone()
    }

    fn dns_create(&mut self, port: u16) -> Result<(), MockError> {
        self.dns_port = Some(port);
        Ok(())
    }

    fn dns_start(&mut self, query: &DnsQuery<'_>) -> Result<(), MockError> {
        self.dns_port.ok_or(MockError)?;
        self.dns_queries.push((
            query.name.to_string(),
            query.server,
            query.server_mac,
            query.recursion_desired,
        ));
        self.dns_polls = 0;
        Ok(())
    }

    fn dns_poll(&mut self) -> Option<ResponseCode> {
        self.dns_polls += 1;
        match self.dns_done_after {
            Some(after) if self.dns_polls >= after => Some(self.dns_code),
            _ => None,
        }
    }

    fn dns_answers(&mut self) -> Vec<DnsRecord> {
        self.dns_records.clone()
    }

    fn close_udp(&mut self, port: u16) {
        self.closed_udp.push(port);
    }

    fn tcp_open(
        &mut self,
        local_port: u16,
        next_hop: MacAddress,
        remote: SocketAddrV4,
    ) -> Result<(), MockError> {
        self.tcp_opens.push((local_port, next_hop, remote));
        if self.tcp_open_fails {
            return Err(MockError);
        }
        self.tcp_state.set(TcpState::SynSent);
        self.tcp_state_polls.set(0);
        Ok(())
    }

    fn tcp_state(&self) -> TcpState {
        let polls = self.tcp_state_polls.get() + 1;
        self.tcp_state_polls.set(polls);

        let next = match self.tcp_state.get() {
            TcpState::SynSent => match self.tcp_established_after {
                Some(after) if polls >= after => TcpState::Established,
                _ => TcpState::SynSent,
            },
            TcpState::Established if self.tcp_peer_closes && self.tcp_response.is_empty() => {
                TcpState::CloseWait
            }
            state @ (TcpState::FinWait1 | TcpState::LastAck) => {
                let close_polls = self.tcp_close_polls.get() + 1;
                self.tcp_close_polls.set(close_polls);
                if close_polls >= self.tcp_closed_after {
                    TcpState::Closed
                } else {
                    state
                }
            }
            state => state,
        };
        self.tcp_state.set(next);
        next
    }

    fn tcp_set_timeout(&mut self, timeout: Option<Duration>) {
        self.tcp_timeouts.push(timeout);
    }

    fn tcp_send(&mut self, data: &[u8]) -> Result<usize, MockError> {
        if self.tcp_state.get() != TcpState::Established {
            return Err(MockError);
        }
        let accepted = data.len().min(self.tcp_send_window);
        self.tcp_written.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn tcp_recv(&mut self, buf: &mut [u8]) -> Result<usize, MockError> {
        if self.tcp_recv_stalls < self.tcp_recv_gap {
            self.tcp_recv_stalls += 1;
            return Ok(0);
        }
        self.tcp_recv_stalls = 0;
        let n = buf.len().min(self.tcp_recv_chunk).min(self.tcp_response.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.tcp_response.pop_front().ok_or(MockError)?;
        }
        Ok(n)
    }

    fn tcp_close(&mut self) -> Result<(), MockError> {
        self.tcp_close_calls += 1;
        self.tcp_close_polls.set(0);
        let next = match self.tcp_state.get() {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            state if state.is_closed() => state,
            _ => TcpState::Closed,
        };
        self.tcp_state.set(next);
        Ok(())
    }

    fn tcp_abort(&mut self) {
        self.tcp_aborts += 1;
        self.tcp_state.set(TcpState::Closed);
    }
}
