//! Hardware address and name resolution
//!
//! Both resolutions follow the same pattern: start the operation on the
//! stack, then poll its "is done" flag a bounded number of times with a fixed
//! sleep in between. The pump keeps running meanwhile and carries the request
//! and reply frames.

use core::net::Ipv4Addr;

use embedded_hal_async::delay::DelayNs;
use log::{debug, error, warn};

use super::DNS_CLIENT_PORT;
use super::context::NetworkContext;
use super::error::NetError;
use super::stack::{DnsQuery, NetworkStack, QueryClass, QueryType, ResponseCode};
use super::types::MacAddress;
use crate::config::RetryTiming;

/// Most IPv4 answers kept from one name query
pub const MAX_ANSWERS: usize = 4;

/// Longest name accepted for a query
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

pub type Addresses = heapless::Vec<Ipv4Addr, MAX_ANSWERS>;

/// Releases the query port on every exit path
struct PortGuard<'a, S: NetworkStack> {
    ctx: &'a NetworkContext<S>,
    port: u16,
}

impl<S: NetworkStack> Drop for PortGuard<'_, S> {
    fn drop(&mut self) {
        let port = self.port;
        if self.ctx.with_stack(|stack| stack.close_udp(port)).is_err() {
            warn!("No stack to release UDP port {}", port);
        }
    }
}

pub struct Resolver<'a, S> {
    ctx: &'a NetworkContext<S>,
    timing: RetryTiming,
}

impl<'a, S: NetworkStack> Resolver<'a, S> {
    pub fn new(ctx: &'a NetworkContext<S>, timing: RetryTiming) -> Self {
        Self { ctx, timing }
    }

    /// Resolve the hardware address of a host on the local link
    pub async fn hardware_address(
        &self,
        delay: &mut impl DelayNs,
        ip: Ipv4Addr,
    ) -> Result<MacAddress, NetError> {
        if ip.is_unspecified() {
            return Err(NetError::InvalidAddress);
        }

        self.ctx.with_stack(|stack| {
            stack.arp_abort();
            stack.arp_begin(ip)
        })?
        .map_err(|e| {
            error!("Starting hardware address resolution for {} failed: {:?}", ip, e);
            NetError::InvalidAddress
        })?;

        delay.delay_ms(self.timing.arp_settle_ms).await;

        let interval = self.timing.arp_poll_interval_ms();
        for _ in 0..self.timing.arp_max_retries.max(1) {
            if self.ctx.with_stack(|stack| stack.arp_is_done())? {
                let mac = self.ctx.with_stack(|stack| stack.arp_result())?.map_err(|e| {
                    error!("Hardware address resolution for {} failed: {:?}", ip, e);
                    NetError::ResolutionTimeout
                })?;
                debug!("{} is at {}", ip, mac);
                return Ok(mac);
            }
            delay.delay_ms(interval).await;
        }

        warn!(
            "Hardware address resolution for {} timed out after {}ms",
            ip, self.timing.arp_timeout_ms
        );
        Err(NetError::ResolutionTimeout)
    }

    /// Resolve `name` to its IPv4 addresses.
    ///
    /// The query goes to `server` inside a frame addressed to `server_mac`,
    /// which is the gateway unless the server sits on the local link.
    pub async fn resolve_name(
        &self,
        delay: &mut impl DelayNs,
        name: &str,
        server: Ipv4Addr,
        server_mac: MacAddress,
    ) -> Result<Addresses, NetError> {
        if !is_valid_name(name) {
            error!("Refusing to resolve invalid name {:?}", name);
            return Err(NetError::InvalidAddress);
        }

        let query = DnsQuery {
            name,
            qtype: QueryType::A,
            qclass: QueryClass::Internet,
            server,
            server_mac,
            recursion_desired: true,
        };

        let _port = PortGuard {
            ctx: self.ctx,
            port: DNS_CLIENT_PORT,
        };

        self.ctx
            .with_stack(|stack| stack.dns_start(&query))?
            .map_err(|e| {
                error!("Starting resolution of {} failed: {:?}", name, e);
                NetError::InvalidAddress
            })?;

        delay.delay_ms(self.timing.dns_settle_ms).await;

        let mut code = None;
        for _ in 0..self.timing.dns_poll_attempts {
            code = self.ctx.with_stack(|stack| stack.dns_poll())?;
            if code.is_some() {
                break;
            }
            delay.delay_ms(self.timing.dns_poll_interval_ms).await;
        }

        match code {
            None => {
                warn!("Resolution of {} via {} timed out", name, server);
                return Err(NetError::ResolutionTimeout);
            }
            Some(ResponseCode::Success) => {}
            Some(code) => {
                warn!("Resolution of {} failed: {}", name, code);
                return Err(NetError::ResolutionFailed(code));
            }
        }

        let answers = self.ctx.with_stack(|stack| stack.dns_answers())?;
        if answers.is_empty() {
            return Err(NetError::NoAnswers);
        }

        let mut addresses = Addresses::new();
        for ip in answers.iter().filter_map(|record| record.as_ipv4()) {
            if addresses.push(ip).is_err() {
                break;
            }
        }

        if addresses.is_empty() {
            warn!("{} has {} answers but none are IPv4", name, answers.len());
            return Err(NetError::NoIPv4Answers);
        }

        debug!("{} resolved to {:?}", name, addresses);
        Ok(addresses)
    }
}

fn is_valid_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}
