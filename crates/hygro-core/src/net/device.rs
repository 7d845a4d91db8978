//! Radio device seam
//!
//! The radio driver itself (WiFi join, frame polling and sending) lives outside
//! this crate. These traits describe the calls the bring-up and the packet pump
//! make into it.

use core::fmt::Debug;

use super::types::MacAddress;

/// Configuration applied when the radio is initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RadioConfig {
    /// Let the radio doze between beacons. Saves power, costs latency.
    pub power_save: bool,
}

/// Produces the radio device handle.
///
/// Returning `None` means the hardware could not be brought up this time; the
/// bring-up retries after its stage backoff, indefinitely.
pub trait RadioFactory {
    type Radio: RadioDevice;

    fn create(&mut self) -> Option<Self::Radio>;
}

pub trait RadioDevice {
    type Error: Debug;

    /// Start the radio with the given configuration
    fn initialize(
        &mut self,
        config: &RadioConfig,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn hardware_address(&self) -> Result<MacAddress, Self::Error>;

    /// Join a WPA2 (or open, when `password` is empty) network
    fn join_network(
        &mut self,
        ssid: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Largest link-layer frame the radio carries
    fn mtu(&self) -> usize;

    /// Poll for exactly one inbound frame, copying it into `buf`.
    ///
    /// Returns the frame length, or `None` when nothing arrived.
    fn poll_one_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Self::Error>;

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error>;
}
