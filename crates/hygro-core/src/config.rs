use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct Config<'a> {
    pub internet: InternetConfig<'a>,
    #[serde(default)]
    pub timing: RetryTiming,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct InternetConfig<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
    /// Hostname announced in the DHCP request, if any
    #[serde(borrow, default)]
    pub hostname: Option<&'a str>,
}

/// Retry counts and poll intervals used by the bring-up and request paths.
///
/// Every wait in this crate is a bounded number of polls separated by a fixed
/// sleep, so the product of a count and its interval is the effective timeout.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTiming {
    /// Sleep between two attempts of the same bring-up stage
    pub stage_backoff_ms: u32,
    pub lease_poll_attempts: u32,
    pub lease_poll_interval_ms: u32,
    /// Pause between sending an ARP request and the first poll
    pub arp_settle_ms: u32,
    pub arp_timeout_ms: u32,
    pub arp_max_retries: u32,
    /// Pause between starting a DNS query and the first poll
    pub dns_settle_ms: u32,
    pub dns_poll_attempts: u32,
    pub dns_poll_interval_ms: u32,
    pub connect_poll_attempts: u32,
    pub connect_poll_interval_ms: u32,
    /// Deadline handed to the TCP connection while dialing and while reading
    pub connection_timeout_ms: u32,
    pub read_poll_interval_ms: u32,
    pub close_poll_attempts: u32,
    pub close_poll_interval_ms: u32,
    /// Sleep taken by the packet pump when neither direction moved a frame
    pub pump_idle_sleep_ms: u32,
    /// Failed transmissions tolerated before an outbound frame is dropped
    pub pump_max_retries: u8,
}

impl RetryTiming {
    /// Sleep between two ARP "is done" polls
    pub const fn arp_poll_interval_ms(&self) -> u32 {
        if self.arp_max_retries == 0 {
            self.arp_timeout_ms
        } else {
            self.arp_timeout_ms / self.arp_max_retries
        }
    }
}

impl Default for RetryTiming {
    fn default() -> Self {
        Self {
            stage_backoff_ms: 5_000,
            lease_poll_attempts: 15,
            lease_poll_interval_ms: 500,
            arp_settle_ms: 4,
            arp_timeout_ms: 1_000,
            arp_max_retries: 20,
            dns_settle_ms: 5,
            dns_poll_attempts: 100,
            dns_poll_interval_ms: 50,
            connect_poll_attempts: 50,
            connect_poll_interval_ms: 100,
            connection_timeout_ms: 5_000,
            read_poll_interval_ms: 20,
            close_poll_attempts: 10,
            close_poll_interval_ms: 1_000,
            pump_idle_sleep_ms: 51,
            pump_max_retries: 3,
        }
    }
}
