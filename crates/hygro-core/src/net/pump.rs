//! Packet pump
//!
//! Bridges link-layer frames between the radio and the network stack for the
//! rest of the program once the stack exists. Outbound frames are staged in a
//! small ring of slots so a frame the radio refused can be retried without the
//! stack having to produce it again.

use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};

use super::MAX_FRAME_LEN;
use super::context::NetworkContext;
use super::device::RadioDevice;
use super::stack::NetworkStack;
use crate::config::RetryTiming;

/// Number of outbound frame slots
pub const OUTBOUND_SLOTS: usize = 3;

/// One reusable outbound frame buffer.
///
/// A nonzero retry counter means the frame is awaiting retransmission and the
/// slot must not be refilled until it is sent or dropped.
pub struct OutboundSlot {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
    retries: u8,
}

impl OutboundSlot {
    const fn new() -> Self {
        Self {
            buf: [0; MAX_FRAME_LEN],
            len: 0,
            retries: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn awaiting_retry(&self) -> bool {
        self.retries != 0
    }

    fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn clear(&mut self) {
        self.len = 0;
        self.retries = 0;
    }
}

pub struct PacketPump<'a, S, R, D> {
    ctx: &'a NetworkContext<S>,
    radio: R,
    delay: D,
    slots: [OutboundSlot; OUTBOUND_SLOTS],
    inbound: [u8; MAX_FRAME_LEN],
    max_retries: u8,
    idle_sleep_ms: u32,
}

impl<'a, S, R, D> PacketPump<'a, S, R, D>
where
    S: NetworkStack,
    R: RadioDevice,
    D: DelayNs,
{
    pub fn new(ctx: &'a NetworkContext<S>, radio: R, delay: D, timing: &RetryTiming) -> Self {
        Self {
            ctx,
            radio,
            delay,
            slots: [const { OutboundSlot::new() }; OUTBOUND_SLOTS],
            inbound: [0; MAX_FRAME_LEN],
            max_retries: timing.pump_max_retries,
            idle_sleep_ms: timing.pump_idle_sleep_ms,
        }
    }

    pub fn slots(&self) -> &[OutboundSlot] {
        &self.slots
    }

    /// Pump frames forever
    pub async fn run(mut self) -> ! {
        info!("Packet pump started");
        loop {
            self.step().await;
        }
    }

    /// One pump iteration: receive at most one frame, refill idle slots, then
    /// try to transmit every staged frame.
    pub async fn step(&mut self) {
        let receive_stalled = !self.receive_one();
        self.fill_slots();

        let transmit_stalled = self.slots.iter().all(OutboundSlot::is_empty);
        if receive_stalled && transmit_stalled {
            self.delay.delay_ms(self.idle_sleep_ms).await;
        }

        self.transmit();
    }

    /// Returns whether a frame arrived
    fn receive_one(&mut self) -> bool {
        let len = match self.radio.poll_one_frame(&mut self.inbound) {
            Ok(Some(len)) => len,
            Ok(None) => return false,
            Err(e) => {
                warn!("Polling the radio failed: {:?}", e);
                return false;
            }
        };

        let frame = &self.inbound[..len];
        match self.ctx.with_stack(|stack| stack.receive_frame(frame)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Stack rejected inbound frame ({} bytes): {:?}", len, e),
            Err(e) => debug!("Dropping inbound frame: {}", e),
        }
        true
    }

    fn fill_slots(&mut self) {
        for slot in self.slots.iter_mut().filter(|slot| !slot.awaiting_retry()) {
            let buf = &mut slot.buf;
            match self.ctx.with_stack(|stack| stack.poll_outbound(buf)) {
                Ok(Ok(0)) => {
                    slot.len = 0;
                    // Nothing more pending
                    break;
                }
                Ok(Ok(len)) => slot.len = len,
                Ok(Err(e)) => {
                    warn!("Fetching outbound frame failed: {:?}", e);
                    slot.len = 0;
                }
                Err(e) => {
                    debug!("No stack to drain: {}", e);
                    slot.len = 0;
                    break;
                }
            }
        }
    }

    fn transmit(&mut self) {
        for slot in self.slots.iter_mut().filter(|slot| !slot.is_empty()) {
            match self.radio.send_frame(slot.frame()) {
                Ok(()) => slot.clear(),
                Err(e) => {
                    slot.retries += 1;
                    if slot.retries > self.max_retries {
                        warn!(
                            "Dropping {}-byte frame after {} failed sends: {:?}",
                            slot.len, slot.retries, e
                        );
                        slot.clear();
                    } else {
                        debug!("Sending frame failed (attempt {}): {:?}", slot.retries, e);
                    }
                }
            }
        }
    }
}
