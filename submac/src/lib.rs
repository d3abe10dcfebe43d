// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! IEEE 802.15.4 sub-MAC link-layer engine.
//!
//! This crate implements the thin layer between an upper MAC (or a raw
//! link-layer user) and a platform radio:
//!
//! - the sub-MAC state machine with software fallbacks for ACK timeout,
//!   CSMA/CA backoff, retransmission, energy scanning and transmit security,
//!   active only for capabilities the radio does not advertise;
//! - the CSL (Coordinated Sampled Listening) receiver, scheduling periodic
//!   microsecond-domain receive windows sized from mutual clock accuracy;
//! - the wake-up end device listener;
//! - the multi-radio link selector fanning a logical transmission out over
//!   IEEE 802.15.4 and TREL with per-link MTUs and aggregated completion;
//! - a raw-link facade for clients that bypass the upper MAC.
//!
//! The engine is cooperatively driven from a single execution context: all
//! platform upcalls (timer expiry, radio completions) and upper-layer calls
//! happen from the same context and every operation returns promptly,
//! expressing long-running work by arming one of the engine-owned timers.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod frame;
pub mod keys;
#[cfg(feature = "link-raw")]
pub mod link_raw;
#[cfg(feature = "multi-radio")]
pub mod links;
pub mod security;
pub mod sub_mac;

pub use sub_mac::{Callbacks, SubMac};
