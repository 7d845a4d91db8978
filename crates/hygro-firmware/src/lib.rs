#![no_std]

extern crate alloc;

pub mod radio;
pub mod smol_stack;
pub mod wifi_secrets;

/// Current time on the smoltcp clock
pub(crate) fn smol_now() -> smoltcp::time::Instant {
    smoltcp::time::Instant::from_micros(embassy_time::Instant::now().as_micros() as i64)
}
