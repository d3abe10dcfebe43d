// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! CSL (Coordinated Sampled Listening) receiver scheduling.
//!
//! A CSL receiver opens a brief receive window once every CSL period and
//! sleeps in between; a CSL transmitter aligns its frame to the window. The
//! window must absorb the clock drift accumulated since the last moment the
//! two devices were provably synchronized, so its half-width is computed
//! per neighbor from the elapsed time, both clock accuracies and both fixed
//! uncertainties, and the engine takes the worst case across neighbors.
//!
//! ```text
//!    |<---------------------------- Sample ---------------------------->|<---- Sleep ---->|
//!    |<--Ahead-->|<--UnCert-->|<--Drift-->|<--Drift-->|<--UnCert-->|<-->|
//! ---|-----------|------------|-----------|-----------|------------|----|-------//-------|---
//! -timeAhead                          sample time                +timeAfter        -timeAhead
//! ```
//!
//! With a radio that supports timed receive the timer fires once per
//! period: it schedules `receive_at` for the coming window and the radio
//! sleeps on its own outside it. Without timed receive the timer fires
//! twice per period, once to open the window (`receive`) and once to close
//! it (`sleep`); the `is_csl_sampling` flag is the edge that tells the two
//! half-periods apart and keeps spurious ticks idempotent.

use core::cell::Cell;

use wpan_hal::radio::{Radio, RxFrame, TxFrame, US_PER_TEN_SYMBOLS};
use wpan_hal::time::{Time, Timer};
use wpan_hal::ErrorCode;

use super::{State, SubMac, RECEIVE_TIME_AHEAD_US};
use crate::frame::{Address, FrameRead, FrameWrite, SHORT_ADDR_INVALID};

/// Upper bound on tracked CSL neighbors, whatever the radio reports.
pub const CSL_MAX_NEIGHBORS: usize = 8;

/// Minimum receive-on time ahead of the expected frame, microseconds.
const MIN_RECEIVE_ON_AHEAD_US: u32 = 192;
/// Minimum receive-on time past the expected frame, microseconds.
const MIN_RECEIVE_ON_AFTER_US: u32 = 0;

/// Seconds without a fresh synchronization after which CSL sync is
/// considered stale by the upper layer.
pub(crate) const DEFAULT_CSL_TIMEOUT_SEC: u32 = 100;

/// A CSL peer's clock quality: accuracy in units of 0.1 ppm and fixed
/// scheduling uncertainty in microseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CslAccuracy {
    pub clock_accuracy: u16,
    pub uncertainty: u16,
}

/// A tracked CSL peer. Addresses are kept as they appear in frames.
pub(crate) struct CslNeighbor {
    pub(crate) valid: Cell<bool>,
    pub(crate) short_addr: Cell<u16>,
    pub(crate) ext_addr: Cell<[u8; 8]>,
    pub(crate) last_sync: Cell<Time>,
    pub(crate) accuracy: Cell<CslAccuracy>,
}

impl CslNeighbor {
    pub(crate) fn new() -> CslNeighbor {
        CslNeighbor {
            valid: Cell::new(false),
            short_addr: Cell::new(SHORT_ADDR_INVALID),
            ext_addr: Cell::new([0; 8]),
            last_sync: Cell::new(Time(0)),
            accuracy: Cell::new(CslAccuracy::default()),
        }
    }

    pub(crate) fn init(&self) {
        self.valid.set(false);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.get()
    }

    /// Half-width of the receive window this neighbor needs at `now`:
    /// drift accumulated since the last sync plus both uncertainties.
    fn semi_window(&self, now: Time, our_accuracy: u32, our_uncertainty: u32) -> u32 {
        if !self.is_valid() {
            return 0;
        }
        let accuracy = self.accuracy.get();
        let elapsed = now - self.last_sync.get();
        let drift = (elapsed as u64 * (our_accuracy + accuracy.clock_accuracy as u32) as u64
            / 10_000_000) as u32;
        drift + our_uncertainty + accuracy.uncertainty as u32
    }
}

impl<'a, R: Radio, T: Timer> SubMac<'a, R, T> {
    pub(crate) fn csl_init(&self) {
        let radio_max = self.radio.max_multi_csl_peers().min(CSL_MAX_NEIGHBORS as u8);
        self.multi_csl.set(radio_max > 0);
        self.max_csl_neighbors
            .set(if radio_max == 0 { 1 } else { radio_max });
        for neighbor in self.csl_neighbors.iter() {
            neighbor.init();
        }
    }

    pub fn get_csl_period(&self) -> u16 {
        self.csl_period.get()
    }

    pub fn get_csl_channel(&self) -> u8 {
        self.csl_channel.get()
    }

    pub fn set_csl_timeout(&self, timeout_sec: u32) {
        self.csl_timeout_sec.set(timeout_sec);
    }

    pub fn get_csl_timeout(&self) -> u32 {
        self.csl_timeout_sec.get()
    }

    /// Reconfigures the CSL period (in ten-symbol units) and channel.
    /// A period of zero disables CSL sampling. Returns whether anything
    /// changed.
    pub fn update_csl(&self, period: u16, channel: u8) -> bool {
        let changed = period != self.csl_period.get() || channel != self.csl_channel.get();
        if !changed {
            return false;
        }

        self.csl_channel.set(channel);
        self.csl_period.set(period);

        if self.multi_csl.get() {
            let _ = self.radio.enable_multi_csl(period);
        }
        self.update_csl_neighbors();

        self.csl_timer.stop();
        self.is_csl_sampling.set(false);

        if period > 0 {
            self.csl_sample_time.set(self.get_local_time());
            self.handle_csl_timer();
        } else if self.state.get() == State::CslSample {
            if self.rx_on_when_idle.get() {
                let _ = self.radio.receive(channel);
                self.set_state(State::Receive);
            } else {
                let _ = self.radio.sleep();
                self.set_state(State::Sleep);
            }
        }

        log_debg!("CSL Period: {=u16}", period);
        true
    }

    /// Enters the CSL sample state: the radio samples or sleeps depending
    /// on which half of the period the engine is in.
    pub fn csl_sample(&self) {
        self.set_state(State::CslSample);

        if self.is_csl_sampling.get() && !self.radio_supports_receive_timing() {
            let _ = self.radio.receive(self.csl_channel.get());
            return;
        }

        let _ = self.radio.sleep();
    }

    /// Creates or updates the CSL neighbor at `index`. Addresses are in
    /// frame (wire) byte order.
    pub fn configure_csl_neighbor(
        &self,
        index: usize,
        short_addr: u16,
        ext_addr: [u8; 8],
        accuracy: CslAccuracy,
    ) -> Result<(), ErrorCode> {
        if index >= self.max_csl_neighbors.get() as usize {
            return Err(ErrorCode::InvalidArgs);
        }

        let neighbor = &self.csl_neighbors[index];

        if self.multi_csl.get() && neighbor.is_valid() {
            let _ = self
                .radio
                .clear_csl_entry(neighbor.short_addr.get(), neighbor.ext_addr.get());
        }

        if !neighbor.is_valid() {
            // Freshly tracked peers count as synchronized now; the window
            // grows from here until a real sync arrives.
            neighbor.last_sync.set(self.get_local_time());
        }

        neighbor.accuracy.set(accuracy);
        neighbor.short_addr.set(short_addr);
        neighbor.ext_addr.set(ext_addr);
        neighbor.valid.set(true);

        if self.multi_csl.get() {
            let _ = self.radio.add_csl_entry(short_addr, ext_addr);
        } else {
            self.update_csl_neighbors();
        }

        Ok(())
    }

    pub fn clear_csl_neighbor(&self, index: usize) -> Result<(), ErrorCode> {
        if index >= self.max_csl_neighbors.get() as usize {
            return Err(ErrorCode::InvalidArgs);
        }

        let neighbor = &self.csl_neighbors[index];
        if self.multi_csl.get() && neighbor.is_valid() {
            let _ = self
                .radio
                .clear_csl_entry(neighbor.short_addr.get(), neighbor.ext_addr.get());
        }
        neighbor.init();

        if !self.multi_csl.get() {
            self.update_csl_neighbors();
        }

        Ok(())
    }

    fn update_csl_neighbors(&self) {
        if self.multi_csl.get() {
            let _ = self.radio.clear_csl_entries();
            for neighbor in self.valid_neighbors() {
                let _ = self
                    .radio
                    .add_csl_entry(neighbor.short_addr.get(), neighbor.ext_addr.get());
            }
        } else if self.csl_neighbors[0].is_valid() {
            let ext_addr = self.csl_neighbors[0].ext_addr.get();
            let _ = self.radio.enable_csl(
                self.csl_period.get(),
                self.csl_neighbors[0].short_addr.get(),
                Some(&ext_addr),
            );
        } else {
            let _ = self
                .radio
                .enable_csl(self.csl_period.get(), SHORT_ADDR_INVALID, None);
        }
    }

    fn valid_neighbors(&self) -> impl Iterator<Item = &CslNeighbor> {
        self.csl_neighbors[..self.max_csl_neighbors.get() as usize]
            .iter()
            .filter(|neighbor| neighbor.is_valid())
    }

    /// After an acknowledged transmission carrying a CSL IE, the peer has
    /// fresh phase knowledge: our transmit time is a sync point.
    ///
    /// The true sync instant is when the frame left the air; using the
    /// current time overestimates slightly, which only widens the window.
    pub(crate) fn update_csl_last_sync_on_tx(&self, ack: Option<&RxFrame>) {
        if ack.is_none() {
            return;
        }
        let last_sync = self.get_local_time();
        self.tx_frame.map(|frame| {
            if !frame.info.csl_ie_present {
                return;
            }
            let Ok(dst) = frame.dst_addr() else {
                return;
            };
            if let Some(neighbor) = self.find_csl_neighbor(&dst) {
                neighbor.last_sync.set(last_sync);
            }
        });
    }

    /// A frame the peer acknowledged with a secured Enh-ACK re-synchronizes
    /// that peer at the frame's receive timestamp.
    pub(crate) fn update_csl_last_sync_on_rx(
        &self,
        frame: Option<&RxFrame>,
        result: Result<(), ErrorCode>,
    ) {
        let Some(frame) = frame else { return };
        if result.is_err() || self.csl_period.get() == 0 || !frame.info.acked_with_sec_enh_ack {
            return;
        }
        let Ok(dst) = frame.dst_addr() else { return };
        if let Some(neighbor) = self.find_csl_neighbor(&dst) {
            let last_sync = if cfg!(feature = "csl-receiver-local-time-sync") {
                self.csl_timer.now()
            } else {
                Time(frame.info.timestamp_us as u32)
            };
            neighbor.last_sync.set(last_sync);
        }
    }

    fn find_csl_neighbor(&self, address: &Address) -> Option<&CslNeighbor> {
        match address {
            Address::None => None,
            Address::Short(short) => {
                if *short == SHORT_ADDR_INVALID {
                    return None;
                }
                self.valid_neighbors()
                    .find(|neighbor| neighbor.short_addr.get() == *short)
            }
            Address::Extended(ext) => self
                .valid_neighbors()
                .find(|neighbor| neighbor.ext_addr.get() == *ext),
        }
    }

    /// Platform upcall: the CSL timer fired. Runs the per-period automaton
    /// described in the module docs.
    pub fn handle_csl_timer(&self) {
        let period_us = self.csl_period.get() as u32 * US_PER_TEN_SYMBOLS;
        if period_us == 0 {
            return;
        }

        let (ahead, after) = self.get_csl_window_edges();

        if self.is_csl_sampling.get() {
            // Window closes: sleep until it is time to open the next one.
            self.is_csl_sampling.set(false);
            self.csl_timer.fire_at(self.csl_sample_time.get() - ahead);
            if self.state.get() == State::CslSample {
                let _ = self.radio.sleep();
                log_debg!("CSL sleep {=u32}", self.csl_timer.now().value());
            }
            return;
        }

        let mut time_ahead = ahead;
        let window_start;

        if self.radio_supports_receive_timing() {
            self.csl_timer
                .fire_at(self.csl_sample_time.get() - time_ahead + period_us);
            // The scheduling margin is part of `ahead` but not of the
            // window itself.
            time_ahead = time_ahead.saturating_sub(RECEIVE_TIME_AHEAD_US);
            window_start = self.csl_sample_time.get() - time_ahead;
        } else {
            self.csl_timer.fire_at(self.csl_sample_time.get() + after);
            self.is_csl_sampling.set(true);
            window_start = self.csl_timer.now();
        }

        let window_duration = time_ahead + after;

        self.csl_sample_time
            .set(self.csl_sample_time.get() + period_us);
        self.radio
            .update_csl_sample_time(self.csl_sample_time.get().value());

        // The scheduled window yields to an active receive: scanning and
        // post-data-poll reception outrank CSL sampling.
        if self.radio_supports_receive_timing()
            && self.state.get() != State::Disabled
            && self.state.get() != State::Receive
        {
            let _ = self.radio.receive_at(
                self.csl_channel.get(),
                window_start.value(),
                window_duration,
            );
        } else if self.state.get() == State::CslSample {
            let _ = self.radio.receive(self.csl_channel.get());
        }

        log_debg!(
            "CSL window start {=u32}, duration {=u32}",
            window_start.value(),
            window_duration
        );
    }

    /// Worst-case window half-widths over all tracked neighbors, clamped
    /// to the half period so consecutive windows never overlap.
    fn get_csl_window_edges(&self) -> (u32, u32) {
        let semi_period = self.csl_period.get() as u32 * US_PER_TEN_SYMBOLS / 2;
        let our_accuracy = self.radio.csl_accuracy() as u32 * 10;
        let our_uncertainty = self.radio.csl_uncertainty() as u32;
        let now = self.get_local_time();

        let mut semi_window = 0;
        for neighbor in self.valid_neighbors() {
            semi_window = semi_window.max(neighbor.semi_window(now, our_accuracy, our_uncertainty));
        }

        let ahead =
            semi_period.min(semi_window + MIN_RECEIVE_ON_AHEAD_US + RECEIVE_TIME_AHEAD_US);
        let after = semi_period.min(semi_window + MIN_RECEIVE_ON_AFTER_US);
        (ahead, after)
    }

    fn get_local_time(&self) -> Time {
        if cfg!(feature = "csl-receiver-local-time-sync") {
            self.csl_timer.now()
        } else {
            Time(self.radio.now_us() as u32)
        }
    }

    /// Writes period and phase into the frame's CSL IE. Runs as late as
    /// possible so the phase reflects the actual transmit time.
    pub(crate) fn fill_csl(&self, frame: &mut TxFrame) {
        if self.csl_period.get() == 0 {
            return;
        }
        if frame
            .header_ie(crate::frame::HEADER_IE_CSL)
            .ok()
            .flatten()
            .is_some()
        {
            let phase = self.get_csl_phase();
            let _ = frame.set_csl_ie(self.csl_period.get(), phase);
            log_debg!("FillCsl() phase={=u16}", phase);
        }
    }

    /// Time from now until the next CSL sample instant, in ten-symbol
    /// units modulo the period.
    fn get_csl_phase(&self) -> u16 {
        let period_us = self.csl_period.get() as u32 * US_PER_TEN_SYMBOLS;
        let now = self.get_local_time();
        let sample_time = self.csl_sample_time.get();

        let delta = if sample_time.is_before(now) {
            (sample_time + period_us) - now
        } else {
            sample_time - now
        };

        (delta / US_PER_TEN_SYMBOLS) as u16
    }
}
