//! One HTTP GET over a freshly dialed TCP connection
//!
//! The stack carries a single TCP connection, so the client dials, writes the
//! request, reads the response and closes again for every call. Whatever the
//! outcome, the connection is closed (or aborted) before `get` returns.

pub mod connection;
pub mod response;
pub mod url;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::Write;
use log::{debug, error, info, warn};

use self::connection::TcpConnection;
use self::url::Url;
use super::context::NetworkContext;
use super::error::NetError;
use super::resolver::Resolver;
use super::stack::{NetworkStack, TcpState};
use super::types::{MacAddress, NetworkInfo};
use crate::config::RetryTiming;

/// Lowest local port handed out for outgoing connections
const EPHEMERAL_PORT_MIN: u16 = 1024;

const USER_AGENT: &str = "hygro/0.1";

/// The result of a GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_line: String,
    /// Protocol version, e.g. `HTTP/1.1`
    pub protocol: String,
    pub status_code: u16,
    /// Reason phrase
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub content_length: usize,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First header named `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub struct HttpClient<'a, S, D> {
    ctx: &'a NetworkContext<S>,
    delay: D,
    timing: RetryTiming,
    port_state: u64,
}

impl<'a, S: NetworkStack, D: DelayNs> HttpClient<'a, S, D> {
    /// `seed` randomizes the local ports; any value works, but it should
    /// differ between boots.
    pub fn new(ctx: &'a NetworkContext<S>, delay: D, timing: RetryTiming, seed: u64) -> Self {
        Self {
            ctx,
            delay,
            timing,
            // xorshift never leaves zero
            port_state: if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed },
        }
    }

    /// Issue a GET for `url` and read the whole response
    pub async fn get(&mut self, url: &str) -> Result<HttpResponse, NetError> {
        let url = Url::parse(url).inspect_err(|e| error!("Rejecting URL {:?}: {}", url, e))?;
        let info = self.ctx.network_info().ok_or_else(|| {
            warn!("GET {} attempted at stage {}", url.host, self.ctx.stage());
            NetError::NotReady
        })?;

        let started = Instant::now();
        let ip = self.remote_address(&url, &info).await?;
        let next_hop = self.next_hop(&info, ip).await;
        let remote = SocketAddrV4::new(ip, url.port);
        let local_port = self.next_local_port();

        info!("Dialing {} from port {} via {}", remote, local_port, next_hop);
        let timeout = Duration::from_millis(u64::from(self.timing.connection_timeout_ms));
        self.ctx
            .with_stack(|stack| -> Result<(), S::Error> {
                stack.tcp_open(local_port, next_hop, remote)?;
                stack.tcp_set_timeout(Some(timeout));
                Ok(())
            })?
            .map_err(|e| {
                error!("Opening connection to {} failed: {:?}", remote, e);
                NetError::ConnectFailed
            })?;

        let result = self.exchange(&url).await;
        self.close().await;

        match &result {
            Ok(response) => info!(
                "GET {} -> {} {} ({} byte body) took {}ms",
                url.host,
                response.status_code,
                response.status,
                response.body.len(),
                started.elapsed().as_millis()
            ),
            Err(e) => error!("GET {} failed: {}", url.host, e),
        }
        result
    }

    async fn remote_address(
        &mut self,
        url: &Url<'_>,
        info: &NetworkInfo,
    ) -> Result<Ipv4Addr, NetError> {
        if let Some(ip) = url.literal_ip() {
            return Ok(ip);
        }

        let addresses = Resolver::new(self.ctx, self.timing)
            .resolve_name(&mut self.delay, url.host, info.name_server, info.name_server_mac)
            .await?;
        // Resolution never succeeds without at least one IPv4 answer
        addresses.first().copied().ok_or(NetError::NoIPv4Answers)
    }

    /// Hosts on the local link are reached directly, everything else through
    /// the gateway.
    async fn next_hop(&mut self, info: &NetworkInfo, ip: Ipv4Addr) -> MacAddress {
        if !info.is_on_link(ip) || ip == info.gateway_ip {
            return info.gateway_mac;
        }

        match Resolver::new(self.ctx, self.timing)
            .hardware_address(&mut self.delay, ip)
            .await
        {
            Ok(mac) => mac,
            Err(e) => {
                warn!("Could not resolve {} on the local link ({}), using the gateway", ip, e);
                info.gateway_mac
            }
        }
    }

    async fn exchange(&mut self, url: &Url<'_>) -> Result<HttpResponse, NetError> {
        self.wait_established().await?;

        // No stack timeout while sending, the connection still bounds the write
        self.ctx.with_stack(|stack| stack.tcp_set_timeout(None))?;

        let mut request = String::with_capacity(128);
        write_request(&mut request, url).map_err(|_| NetError::InvalidUrl)?;

        let mut conn = TcpConnection::new(
            self.ctx,
            &mut self.delay,
            self.timing.read_poll_interval_ms,
            self.timing.connection_timeout_ms,
        );
        conn.write_all(request.as_bytes()).await.map_err(|e| {
            error!("Writing request failed: {:?}", e);
            NetError::WriteFailed
        })?;
        debug!("Sent {} byte request", request.len());

        let timeout = Duration::from_millis(u64::from(self.timing.connection_timeout_ms));
        self.ctx
            .with_stack(|stack| stack.tcp_set_timeout(Some(timeout)))?;
        conn.rearm();

        response::read_response(&mut conn).await
    }

    async fn wait_established(&mut self) -> Result<(), NetError> {
        for _ in 0..self.timing.connect_poll_attempts {
            match self.ctx.with_stack(|stack| stack.tcp_state())? {
                TcpState::Established | TcpState::CloseWait => return Ok(()),
                state if state.is_closed() => {
                    error!("Connection refused ({:?})", state);
                    return Err(NetError::ConnectFailed);
                }
                _ => {}
            }
            self.delay
                .delay_ms(self.timing.connect_poll_interval_ms)
                .await;
        }

        error!(
            "Connection not established after {} polls",
            self.timing.connect_poll_attempts
        );
        Err(NetError::ConnectTimeout)
    }

    /// Close gracefully, aborting if the peer does not finish in time
    async fn close(&mut self) {
        if let Ok(Err(e)) = self.ctx.with_stack(|stack| stack.tcp_close()) {
            warn!("Closing connection failed: {:?}", e);
        }

        for _ in 0..self.timing.close_poll_attempts {
            match self.ctx.with_stack(|stack| stack.tcp_state()) {
                Ok(state) if state.is_closed() => return,
                Ok(state) => debug!("Waiting for connection to close ({:?})", state),
                Err(_) => return,
            }
            self.delay.delay_ms(self.timing.close_poll_interval_ms).await;
        }

        warn!("Connection did not close in time, aborting");
        let _ = self.ctx.with_stack(|stack| stack.tcp_abort());
    }

    /// Random port in `1024..=65535`
    fn next_local_port(&mut self) -> u16 {
        let mut x = self.port_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.port_state = x;

        let span = u64::from(u16::MAX - EPHEMERAL_PORT_MIN) + 1;
        EPHEMERAL_PORT_MIN + (x % span) as u16
    }
}

fn write_request(out: &mut String, url: &Url<'_>) -> core::fmt::Result {
    out.write_str("GET ")?;
    url.write_target(out)?;
    out.write_str(" HTTP/1.1\r\nHost: ")?;
    out.write_str(url.host)?;
    if url.port != 80 {
        write!(out, ":{}", url.port)?;
    }
    write!(
        out,
        "\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\nConnection: close\r\n\r\n"
    )
}
