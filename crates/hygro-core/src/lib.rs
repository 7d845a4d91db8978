//! Hardware-independent core library for hygro
//!
//! This crate contains the platform-agnostic networking logic of the hygro
//! temperature/humidity device: the bring-up state machine that takes the
//! WiFi radio from power-on to request-ready, the packet pump bridging the
//! radio and the network stack, hardware/name address resolution, and the
//! single-shot HTTP GET client.
//!
//! The radio driver and the network stack are reached only through the traits
//! in [`net::device`] and [`net::stack`], so everything here compiles on both
//! the ESP32-S3 target and the desktop host (for tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod net;
