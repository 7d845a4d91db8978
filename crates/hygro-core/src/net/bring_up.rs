//! Network bring-up state machine
//!
//! Works through [`BringUpStage::SEQUENCE`] one stage at a time. A failed
//! attempt sleeps for the stage backoff and tries the same stage again,
//! forever; there is no way to give up, the device is useless offline anyway.
//! Stages that consist of several calls remember which ones already succeeded
//! so a retry picks up at the call that failed.

use core::net::Ipv4Addr;

use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use super::context::NetworkContext;
use super::device::{RadioConfig, RadioDevice, RadioFactory};
use super::error::NetError;
use super::resolver::Resolver;
use super::stack::{LeaseRequest, LeaseState, NetworkStack, StackConfig, StackFactory};
use super::types::{BringUpStage, LeaseInfo, MacAddress, NetworkInfo};
use super::{DHCP_CLIENT_PORT, DNS_CLIENT_PORT, TCP_PORTS, UDP_PORTS};
use crate::config::{Config, InternetConfig, RetryTiming};

/// Starts the packet pump once the stack exists.
///
/// Called exactly once per bring-up, handing over the radio for good.
pub trait PumpLauncher<'a, S, R> {
    fn launch(&mut self, ctx: &'a NetworkContext<S>, radio: R);
}

pub struct BringUp<'a, RF, SF, L, D>
where
    RF: RadioFactory,
    SF: StackFactory,
{
    ctx: &'a NetworkContext<SF::Stack>,
    internet: InternetConfig<'a>,
    timing: RetryTiming,
    radio_factory: RF,
    stack_factory: SF,
    launcher: L,
    delay: D,

    current: usize,
    attempts: u32,
    stage_started: Instant,

    // Progress kept across attempts
    radio: Option<RF::Radio>,
    radio_initialized: bool,
    local_mac: Option<MacAddress>,
    lease_client_created: bool,
    lease_requested: bool,
    lease: Option<LeaseInfo>,
    name_client_created: bool,
    name_server: Option<Ipv4Addr>,
    gateway_mac: Option<MacAddress>,
}

impl<'a, RF, SF, L, D> BringUp<'a, RF, SF, L, D>
where
    RF: RadioFactory,
    SF: StackFactory,
    L: PumpLauncher<'a, SF::Stack, RF::Radio>,
    D: DelayNs,
{
    pub fn new(
        ctx: &'a NetworkContext<SF::Stack>,
        config: &Config<'a>,
        radio_factory: RF,
        stack_factory: SF,
        launcher: L,
        delay: D,
    ) -> Self {
        Self {
            ctx,
            internet: config.internet.clone(),
            timing: config.timing,
            radio_factory,
            stack_factory,
            launcher,
            delay,
            current: 0,
            attempts: 0,
            stage_started: Instant::now(),
            radio: None,
            radio_initialized: false,
            local_mac: None,
            lease_client_created: false,
            lease_requested: false,
            lease: None,
            name_client_created: false,
            name_server: None,
            gateway_mac: None,
        }
    }

    /// The stage being worked on, `Ready` once all are done
    pub fn stage(&self) -> BringUpStage {
        BringUpStage::SEQUENCE
            .get(self.current)
            .copied()
            .unwrap_or(BringUpStage::Ready)
    }

    /// Drive the bring-up until the network is ready
    pub async fn run(mut self) {
        let started = Instant::now();
        info!("Starting network bring-up");

        while !self.stage().is_ready() {
            // Failures are logged and backed off inside
            let _ = self.advance().await;
        }

        info!("Network ready after {}ms", started.elapsed().as_millis());
    }

    /// Make one attempt at the current stage.
    ///
    /// On failure the stage backoff has already been slept when this returns.
    pub async fn advance(&mut self) -> Result<(), NetError> {
        let stage = self.stage();
        if stage.is_ready() {
            return Ok(());
        }

        if self.attempts == 0 {
            self.ctx.publish_stage(stage);
            self.stage_started = Instant::now();
            info!("{}...", stage);
        }
        self.attempts += 1;

        match self.attempt(stage).await {
            Ok(()) => {
                info!(
                    "{} succeeded after {} attempt(s), took {}ms",
                    stage,
                    self.attempts,
                    self.stage_started.elapsed().as_millis()
                );
                self.current += 1;
                self.attempts = 0;
                Ok(())
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}): {}, retrying in {}ms",
                    stage, self.attempts, e, self.timing.stage_backoff_ms
                );
                self.delay.delay_ms(self.timing.stage_backoff_ms).await;
                Err(e)
            }
        }
    }

    async fn attempt(&mut self, stage: BringUpStage) -> Result<(), NetError> {
        match stage {
            BringUpStage::CreatingDevice => self.create_device().await,
            BringUpStage::ConnectingToWiFi => self.connect_to_wifi().await,
            BringUpStage::CreatingStack => self.create_stack(),
            BringUpStage::ObtainingAddress => self.obtain_address().await,
            BringUpStage::ConfiguringNameResolution => self.configure_name_resolution(),
            BringUpStage::ObtainingGatewayHardwareAddress => {
                self.obtain_gateway_hardware_address().await
            }
            BringUpStage::Uninitialized | BringUpStage::Ready => Ok(()),
        }
    }

    async fn create_device(&mut self) -> Result<(), NetError> {
        if self.radio.is_none() {
            let radio = self.radio_factory.create().ok_or_else(|| {
                error!("WiFi device unavailable");
                NetError::DeviceUnavailable
            })?;
            self.radio = Some(radio);
            self.radio_initialized = false;
        }
        let radio = self.radio.as_mut().ok_or(NetError::DeviceUnavailable)?;

        if !self.radio_initialized {
            radio
                .initialize(&RadioConfig::default())
                .await
                .map_err(|e| {
                    error!("Initializing WiFi device failed: {:?}", e);
                    NetError::DeviceInitFailed
                })?;
            self.radio_initialized = true;
        }

        let mac = radio.hardware_address().map_err(|e| {
            error!("Reading hardware address failed: {:?}", e);
            NetError::DeviceInitFailed
        })?;
        info!("WiFi device hardware address {}", mac);
        self.local_mac = Some(mac);
        Ok(())
    }

    async fn connect_to_wifi(&mut self) -> Result<(), NetError> {
        let radio = self.radio.as_mut().ok_or(NetError::DeviceUnavailable)?;
        info!("Joining WiFi network {:?}", self.internet.ssid);

        radio
            .join_network(self.internet.ssid, self.internet.password)
            .await
            .map_err(|e| {
                error!("Joining {:?} failed: {:?}", self.internet.ssid, e);
                NetError::JoinFailed
            })
    }

    fn create_stack(&mut self) -> Result<(), NetError> {
        let radio = self.radio.as_ref().ok_or(NetError::DeviceUnavailable)?;
        let mac = self.local_mac.ok_or(NetError::DeviceUnavailable)?;

        let config = StackConfig {
            mac,
            max_tcp_ports: TCP_PORTS,
            max_udp_ports: UDP_PORTS,
            mtu: radio.mtu(),
            random_seed: seed(mac),
        };
        let stack = self.stack_factory.create(&config).ok_or_else(|| {
            error!("Creating network stack failed ({:?})", config);
            NetError::StackCreateFailed
        })?;
        self.ctx.install_stack(stack);

        // The radio belongs to the pump from here on
        if let Some(radio) = self.radio.take() {
            debug!("Starting packet pump");
            self.launcher.launch(self.ctx, radio);
        }
        Ok(())
    }

    async fn obtain_address(&mut self) -> Result<(), NetError> {
        if !self.lease_client_created {
            self.ctx
                .with_stack(|stack| stack.lease_create(DHCP_CLIENT_PORT))?
                .map_err(|e| {
                    error!("Creating lease client failed: {:?}", e);
                    NetError::LeaseFailed
                })?;
            self.lease_client_created = true;
        }

        if !self.lease_requested {
            let mac = self.local_mac.unwrap_or_default();
            let request = LeaseRequest {
                transaction_id: seed(mac) as u32,
                hostname: self.internet.hostname,
            };
            self.ctx
                .with_stack(|stack| stack.lease_begin(&request))?
                .map_err(|e| {
                    error!("Starting lease request failed: {:?}", e);
                    NetError::LeaseFailed
                })?;
            debug!("Lease requested, transaction id {:#010x}", request.transaction_id);
            self.lease_requested = true;
        }

        let mut bound = false;
        for _ in 0..self.timing.lease_poll_attempts {
            if self.ctx.with_stack(|stack| stack.lease_state())? == LeaseState::Bound {
                bound = true;
                break;
            }
            self.delay.delay_ms(self.timing.lease_poll_interval_ms).await;
        }
        if !bound {
            warn!("No lease after {} polls", self.timing.lease_poll_attempts);
            return Err(NetError::LeaseFailed);
        }

        let lease = self
            .ctx
            .with_stack(|stack| stack.lease_info())?
            .ok_or_else(|| {
                error!("Lease bound but carries no details");
                NetError::LeaseFailed
            })?;
        self.ctx
            .with_stack(|stack| stack.set_local_address(lease.address))?;
        log_lease(&lease);
        self.lease = Some(lease);
        Ok(())
    }

    fn configure_name_resolution(&mut self) -> Result<(), NetError> {
        let lease = self.lease.as_ref().ok_or(NetError::LeaseFailed)?;
        let server = lease.primary_name_server().ok_or_else(|| {
            error!("Lease carries no usable name server");
            NetError::NoNameServer
        })?;

        if !self.name_client_created {
            self.ctx
                .with_stack(|stack| stack.dns_create(DNS_CLIENT_PORT))?
                .map_err(|e| {
                    error!("Creating name resolution client failed: {:?}", e);
                    NetError::StackCreateFailed
                })?;
            self.name_client_created = true;
        }

        info!("Using name server {}", server);
        self.name_server = Some(server);
        Ok(())
    }

    async fn obtain_gateway_hardware_address(&mut self) -> Result<(), NetError> {
        let lease = self.lease.as_ref().ok_or(NetError::LeaseFailed)?;
        let (local_ip, prefix_len) = (lease.address, lease.prefix_len);
        let gateway = lease.default_route().ok_or_else(|| {
            error!("Lease carries no gateway");
            NetError::InvalidAddress
        })?;
        let name_server = self.name_server.ok_or(NetError::NoNameServer)?;
        let name_server_on_link = lease.is_on_link(name_server) && name_server != gateway;
        let local_mac = self.local_mac.ok_or(NetError::DeviceUnavailable)?;

        let resolver = Resolver::new(self.ctx, self.timing);
        let gateway_mac = match self.gateway_mac {
            Some(mac) => mac,
            None => {
                let mac = resolver.hardware_address(&mut self.delay, gateway).await?;
                info!("Gateway {} is at {}", gateway, mac);
                self.gateway_mac = Some(mac);
                mac
            }
        };

        let name_server_mac = if name_server_on_link {
            match resolver.hardware_address(&mut self.delay, name_server).await {
                Ok(mac) => mac,
                Err(e) => {
                    warn!(
                        "Could not resolve name server {} ({}), querying through the gateway",
                        name_server, e
                    );
                    gateway_mac
                }
            }
        } else {
            gateway_mac
        };

        self.ctx.publish_ready(NetworkInfo {
            local_mac,
            local_ip,
            prefix_len,
            gateway_ip: gateway,
            gateway_mac,
            name_server,
            name_server_mac,
        });
        Ok(())
    }
}

/// Seed for the stack's randomness and the lease transaction id
fn seed(mac: MacAddress) -> u64 {
    let [a, b, c, d, e, f] = mac.octets();
    let mac = u64::from_be_bytes([0, 0, a, b, c, d, e, f]);
    Instant::now().as_ticks().rotate_left(17) ^ mac
}

fn log_lease(lease: &LeaseInfo) {
    info!("Leased address {}/{}", lease.address, lease.prefix_len);
    info!("  broadcast: {}", lease.broadcast());
    if let Some(router) = lease.router {
        info!("  router: {}", router);
    }
    if let Some(gateway) = lease.gateway {
        info!("  gateway: {}", gateway);
    }
    if let Some(server) = lease.server {
        info!("  lease server: {}", server);
    }
    if let Some(hostname) = &lease.hostname {
        info!("  hostname: {}", hostname);
    }
    if lease.name_servers.is_empty() {
        warn!("  no name server");
    }
    for (i, dns) in lease.name_servers.iter().enumerate() {
        info!("  name server {}: {}", i + 1, dns);
    }
    if let Some(lease_time) = lease.lease_time {
        info!("  lease time: {}s", lease_time.as_secs());
    }
    if let Some(renewal) = lease.renewal_time {
        info!("  renewal time: {}s", renewal.as_secs());
    }
    if let Some(rebinding) = lease.rebinding_time {
        info!("  rebinding time: {}s", rebinding.as_secs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::{
        CaptureLauncher, GATEWAY_IP, GATEWAY_MAC, LOCAL_IP, LOCAL_MAC, MockDelay, MockRadio,
        MockRadioFactory, MockStack, MockStackFactory, NAME_SERVER_MAC, init_logger,
        test_network_info,
    };
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use embassy_futures::block_on;

    fn test_config() -> Config<'static> {
        Config {
            internet: InternetConfig {
                ssid: "greenhouse",
                password: "hunter22",
                hostname: Some("hygro"),
            },
            timing: RetryTiming::default(),
        }
    }

    fn backoffs(delay: &MockDelay<'_>) -> usize {
        delay.sleeps_ms().iter().filter(|&&ms| ms == 5_000).count()
    }

    #[test]
    fn test_reaches_ready() {
        init_logger();
        let ctx = NetworkContext::new();
        let config = test_config();
        let radio = MockRadio::default();
        let mut radios = MockRadioFactory::new(radio.clone());
        let mut stacks = MockStackFactory::new(MockStack::default());
        let mut launcher = CaptureLauncher::default();

        let bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            MockDelay::new(),
        );
        block_on(bring_up.run());

        assert!(ctx.is_ready());
        assert_eq!(ctx.network_info(), Some(test_network_info()));
        assert_eq!(launcher.launched.len(), 1);
        assert_eq!(radio.state.borrow().joined_ssid.as_deref(), Some("greenhouse"));

        let stack_config = stacks.configs[0];
        assert_eq!(stack_config.mac, LOCAL_MAC);
        assert_eq!((stack_config.max_tcp_ports, stack_config.max_udp_ports), (1, 2));
        assert_eq!(stack_config.mtu, 1514);

        ctx.with_stack(|s| {
            assert_eq!(s.local, Some(LOCAL_IP));
            assert_eq!(s.lease_requests.len(), 1);
            assert_eq!(s.lease_requests[0].1.as_deref(), Some("hygro"));
            assert_eq!(s.dns_port, Some(DNS_CLIENT_PORT));
            assert_eq!(s.arp_begins, [GATEWAY_IP]);
        })
        .unwrap();
    }

    #[test]
    fn test_transient_failures_are_retried_in_order() {
        init_logger();
        let ctx = NetworkContext::new();
        let config = test_config();
        let radio = MockRadio::default();
        {
            let mut state = radio.state.borrow_mut();
            state.init_failures = 1;
            state.join_failures = 2;
        }
        let mut radios = MockRadioFactory::new(radio.clone());
        radios.failures = 2;
        let mut stack = MockStack::default();
        stack.lease_begin_failures = 1;
        let mut stacks = MockStackFactory::new(stack);
        stacks.failures = 1;
        let mut launcher = CaptureLauncher::default();

        let seen = RefCell::new(Vec::new());
        let delay = MockDelay::observing(|| seen.borrow_mut().push(ctx.stage()));

        let bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            delay.clone(),
        );
        block_on(bring_up.run());

        assert!(ctx.is_ready());
        assert_eq!(backoffs(&delay), 7);
        // The radio is created once, then resumed at the call that failed
        assert_eq!(radios.calls, 3);
        assert_eq!(radio.state.borrow().init_calls, 2);
        assert_eq!(radio.state.borrow().join_calls, 3);
        assert_eq!(launcher.launched.len(), 1);

        let seen = seen.borrow();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "stage went backwards: {seen:?}");
        assert_eq!(seen.first(), Some(&BringUpStage::CreatingDevice));
    }

    #[test]
    fn test_slow_lease_backs_off_and_keeps_polling() {
        let ctx = NetworkContext::new();
        let config = test_config();
        let mut radios = MockRadioFactory::new(MockRadio::default());
        let mut stack = MockStack::default();
        stack.lease_bound_after = 20;
        let mut stacks = MockStackFactory::new(stack);
        let mut launcher = CaptureLauncher::default();
        let delay = MockDelay::new();

        let mut bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            delay.clone(),
        );
        for _ in 0..3 {
            block_on(bring_up.advance()).unwrap();
        }
        assert_eq!(bring_up.stage(), BringUpStage::ObtainingAddress);

        assert_eq!(block_on(bring_up.advance()), Err(NetError::LeaseFailed));
        assert_eq!(backoffs(&delay), 1);
        assert_eq!(ctx.stage(), BringUpStage::ObtainingAddress);

        block_on(bring_up.advance()).unwrap();
        assert_eq!(bring_up.stage(), BringUpStage::ConfiguringNameResolution);
        ctx.with_stack(|s| {
            // The request is not restarted, only the polling
            assert_eq!(s.lease_requests.len(), 1);
            assert_eq!(s.lease_polls, 20);
        })
        .unwrap();
    }

    #[test]
    fn test_missing_name_server_never_gets_ready() {
        let ctx = NetworkContext::new();
        let config = test_config();
        let mut radios = MockRadioFactory::new(MockRadio::default());
        let mut stack = MockStack::default();
        if let Some(lease) = stack.lease.as_mut() {
            lease.name_servers.clear();
        }
        let mut stacks = MockStackFactory::new(stack);
        let mut launcher = CaptureLauncher::default();
        let delay = MockDelay::new();

        let mut bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            delay.clone(),
        );
        for _ in 0..4 {
            block_on(bring_up.advance()).unwrap();
        }
        for _ in 0..5 {
            assert_eq!(block_on(bring_up.advance()), Err(NetError::NoNameServer));
        }

        assert_eq!(ctx.stage(), BringUpStage::ConfiguringNameResolution);
        assert_eq!(ctx.network_info(), None);
        assert_eq!(backoffs(&delay), 5);
    }

    #[test]
    fn test_on_link_name_server_is_resolved_directly() {
        let local_dns = Ipv4Addr::new(192, 168, 1, 53);
        let ctx = NetworkContext::new();
        let config = test_config();
        let mut radios = MockRadioFactory::new(MockRadio::default());
        let mut stack = MockStack::default();
        stack.arp_table.push((local_dns, NAME_SERVER_MAC));
        if let Some(lease) = stack.lease.as_mut() {
            lease.name_servers.clear();
            lease.name_servers.push(local_dns).unwrap();
        }
        let mut stacks = MockStackFactory::new(stack);
        let mut launcher = CaptureLauncher::default();

        let bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            MockDelay::new(),
        );
        block_on(bring_up.run());

        let info = ctx.network_info().unwrap();
        assert_eq!(info.name_server, local_dns);
        assert_eq!(info.name_server_mac, NAME_SERVER_MAC);
        assert_eq!(info.gateway_mac, GATEWAY_MAC);
    }

    #[test]
    fn test_unresolvable_name_server_falls_back_to_gateway() {
        let local_dns = Ipv4Addr::new(192, 168, 1, 53);
        let ctx = NetworkContext::new();
        let config = test_config();
        let mut radios = MockRadioFactory::new(MockRadio::default());
        let mut stack = MockStack::default();
        if let Some(lease) = stack.lease.as_mut() {
            lease.name_servers.clear();
            lease.name_servers.push(local_dns).unwrap();
        }
        let mut stacks = MockStackFactory::new(stack);
        let mut launcher = CaptureLauncher::default();

        let bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            MockDelay::new(),
        );
        block_on(bring_up.run());

        let info = ctx.network_info().unwrap();
        assert_eq!(info.name_server, local_dns);
        assert_eq!(info.name_server_mac, GATEWAY_MAC);
    }

    #[test]
    fn test_captured_radio_drives_pump() {
        let ctx = NetworkContext::new();
        let config = test_config();
        let radio = MockRadio::default();
        let mut radios = MockRadioFactory::new(radio.clone());
        let mut stacks = MockStackFactory::new(MockStack::default());
        let mut launcher = CaptureLauncher::default();

        let bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            MockDelay::new(),
        );
        block_on(bring_up.run());

        radio.state.borrow_mut().inbound.push_back(alloc::vec![0xaa; 14]);
        let pumped = launcher.launched.pop().unwrap();
        let mut pump = crate::net::PacketPump::new(&ctx, pumped, MockDelay::new(), &config.timing);
        block_on(pump.step());

        assert_eq!(ctx.with_stack(|s| s.received.len()).unwrap(), 1);
    }

    #[test]
    fn test_hardware_address_failure_keeps_the_radio() {
        let ctx = NetworkContext::new();
        let config = test_config();
        let radio = MockRadio::default();
        radio.state.borrow_mut().mac_failures = 2;
        let mut radios = MockRadioFactory::new(radio.clone());
        let mut stacks = MockStackFactory::new(MockStack::default());
        let mut launcher = CaptureLauncher::default();
        let delay = MockDelay::new();

        let mut bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            delay.clone(),
        );
        for _ in 0..2 {
            assert_eq!(block_on(bring_up.advance()), Err(NetError::DeviceInitFailed));
            assert_eq!(bring_up.stage(), BringUpStage::CreatingDevice);
        }
        block_on(bring_up.advance()).unwrap();
        assert_eq!(bring_up.stage(), BringUpStage::ConnectingToWiFi);
        assert_eq!(backoffs(&delay), 2);

        drop(bring_up);
        // Neither created nor initialized again
        assert_eq!(radios.calls, 1);
        assert_eq!(radio.state.borrow().init_calls, 1);
    }

    #[test]
    fn test_lease_client_failure_is_retried_before_requesting() {
        let ctx = NetworkContext::new();
        let config = test_config();
        let mut radios = MockRadioFactory::new(MockRadio::default());
        let mut stack = MockStack::default();
        stack.lease_create_failures = 2;
        let mut stacks = MockStackFactory::new(stack);
        let mut launcher = CaptureLauncher::default();
        let delay = MockDelay::new();

        let mut bring_up = BringUp::new(
            &ctx,
            &config,
            &mut radios,
            &mut stacks,
            &mut launcher,
            delay.clone(),
        );
        for _ in 0..3 {
            block_on(bring_up.advance()).unwrap();
        }
        for _ in 0..2 {
            assert_eq!(block_on(bring_up.advance()), Err(NetError::LeaseFailed));
            assert_eq!(ctx.stage(), BringUpStage::ObtainingAddress);
        }
        assert!(ctx.with_stack(|s| s.lease_requests.is_empty()).unwrap());

        block_on(bring_up.advance()).unwrap();
        assert_eq!(bring_up.stage(), BringUpStage::ConfiguringNameResolution);
        assert_eq!(backoffs(&delay), 2);
        ctx.with_stack(|s| {
            assert_eq!(s.lease_requests.len(), 1);
            assert_eq!(s.local, Some(LOCAL_IP));
        })
        .unwrap();
    }
}
