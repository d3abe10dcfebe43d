// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! Wake-up End Device listening.
//!
//! A WED periodically opens a short scheduled receive window to catch
//! wake-up frames while spending essentially no energy in between. This
//! depends on the radio's timed-receive capability; the engine keeps the
//! schedule on two parallel clocks, the local timer that drives the ticks
//! and the radio clock that `receive_at` is expressed in.

use wpan_hal::radio::Radio;
use wpan_hal::time::Timer;
use wpan_hal::ErrorCode;

use super::{State, SubMac, RECEIVE_TIME_AHEAD_US};

/// Slack after a listen window before the next timer tick, to ride out
/// window overrun.
const WED_RECEIVE_TIME_AFTER_US: u32 = 200;

impl<'a, R: Radio, T: Timer> SubMac<'a, R, T> {
    /// Starts or stops wake-up frame listening: a window of `duration_us`
    /// every `interval_us` on `channel`.
    pub fn update_wakeup_listening(
        &self,
        enable: bool,
        interval_us: u32,
        duration_us: u32,
        channel: u8,
    ) -> Result<(), ErrorCode> {
        if !self.radio_supports_receive_timing() {
            return Err(ErrorCode::NotImplemented);
        }

        self.wakeup_listen_interval.set(interval_us);
        self.wakeup_listen_duration.set(duration_us);
        self.wakeup_channel.set(channel);
        self.wed_timer.stop();

        if enable {
            // Backdated by one interval so the first tick lands the first
            // window just far enough out to schedule it.
            self.wed_sample_time.set(
                (self.wed_timer.now() + RECEIVE_TIME_AHEAD_US) - interval_us,
            );
            self.wed_sample_time_radio.set(
                self.radio
                    .now_us()
                    .wrapping_add(RECEIVE_TIME_AHEAD_US as u64)
                    .wrapping_sub(interval_us as u64),
            );
            self.handle_wed_timer();
        }

        Ok(())
    }

    /// Platform upcall: the wake-up listen timer fired. Advances the
    /// schedule by one interval and arms the next window.
    pub fn handle_wed_timer(&self) {
        let interval_us = self.wakeup_listen_interval.get();
        if interval_us == 0 {
            return;
        }

        self.wed_sample_time
            .set(self.wed_sample_time.get() + interval_us);
        self.wed_sample_time_radio
            .set(self.wed_sample_time_radio.get().wrapping_add(interval_us as u64));

        self.wed_timer.fire_at(
            self.wed_sample_time.get()
                + self.wakeup_listen_duration.get()
                + WED_RECEIVE_TIME_AFTER_US,
        );

        if self.state.get() != State::Disabled {
            let _ = self.radio.receive_at(
                self.wakeup_channel.get(),
                self.wed_sample_time_radio.get() as u32,
                self.wakeup_listen_duration.get(),
            );
        }
    }
}
