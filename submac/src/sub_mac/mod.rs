// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! The IEEE 802.15.4 sub-MAC.
//!
//! The sub-MAC implements the subset of MAC primitives shared by the full
//! MAC layer and the raw link-layer: radio state ownership, and software
//! fallbacks for ACK timeout, CSMA/CA backoff, frame retransmission, energy
//! scanning and transmit security, each active only when the platform radio
//! does not advertise the corresponding capability.
//!
//! The engine owns the transmit frame buffer and a single timer. It is
//! driven by upper-layer calls (`send`, `receive`, `energy_scan`, ...) and
//! by platform upcalls (`handle_transmit_done`, `handle_receive_done`,
//! `handle_timer`, ...), all arriving in one cooperative execution context.
//! Completion events flow back up through the [`Callbacks`] object; between
//! an accepted `send` and its terminal `transmit_done` no other transmission
//! or energy scan is accepted.

#[cfg(feature = "csl-receiver")]
mod csl;
#[cfg(feature = "wakeup-end-device")]
mod wed;

#[cfg(feature = "csl-receiver")]
pub use csl::{CslAccuracy, CSL_MAX_NEIGHBORS};

use core::cell::Cell;

use wpan_hal::cells::{MapCell, OptionalCell};
use wpan_hal::radio::{
    Caps, KeyMaterial, Radio, RadioType, RxFrame, TxFrame, INVALID_RSSI, MAX_PSDU_LEN,
    SYMBOL_TIME_US,
};
#[cfg(feature = "csl-transmitter")]
use wpan_hal::radio::US_PER_TEN_SYMBOLS;
use wpan_hal::rng::Rng;
use wpan_hal::time::{Time, Timer};
use wpan_hal::ErrorCode;

use crate::frame::{FrameRead, FrameWrite, KeyIdMode};
use crate::keys::MacKeySet;

/// macMinBE (IEEE 802.15.4-2006).
const MIN_BE: u8 = 3;
/// macMaxBE (IEEE 802.15.4-2006).
const MAX_BE: u8 = 5;
/// Unit backoff period in symbols (IEEE 802.15.4-2006).
const UNIT_BACKOFF_PERIOD: u32 = 20;
/// Timeout waiting on an ACK, in microseconds.
const ACK_TIMEOUT_US: u32 = 16_000;
/// How far ahead of a scheduled receive window the radio needs the
/// `receive_at` request (ramp-up and scheduling latency).
#[cfg(any(feature = "csl-receiver", feature = "wakeup-end-device"))]
pub(crate) const RECEIVE_TIME_AHEAD_US: u32 = 600;

/// Events and completions the sub-MAC reports to its user.
///
/// The implementor must not synchronously re-enter `send` or `energy_scan`
/// from inside a callback; it should defer follow-up operations to its next
/// scheduled event.
pub trait Callbacks {
    /// A frame was received (`Ok`), or reception failed (`Abort`, `NoBufs`).
    /// The frame borrow ends with the call.
    fn receive_done(&self, frame: Option<&RxFrame>, result: Result<(), ErrorCode>);

    /// CCA outcome of one transmission attempt, for counters and statistics.
    fn record_cca_status(&self, cca_success: bool, channel: u8);

    /// Status of every transmission attempt, including attempts that will
    /// be retried. `will_retx` says whether another attempt follows.
    fn record_frame_transmit_status(
        &self,
        frame: &TxFrame,
        ack: Option<&RxFrame>,
        result: Result<(), ErrorCode>,
        retry_count: u8,
        will_retx: bool,
    );

    /// Terminal outcome of a `send`, after the retry budget is spent.
    fn transmit_done(&self, frame: &TxFrame, ack: Option<&RxFrame>, result: Result<(), ErrorCode>);

    /// An energy scan finished; `max_rssi` is `INVALID_RSSI` on failure.
    fn energy_scan_done(&self, max_rssi: i8);

    /// The stored outgoing frame counter moved forward.
    fn frame_counter_updated(&self, frame_counter: u32);

    /// The radio rewrote header IEs of the transmit frame and transmit
    /// security needs to be reprocessed by the upper layer (only invoked
    /// when the sub-MAC does not own transmit security).
    fn frame_updated(&self, frame: &mut TxFrame) {
        let _ = frame;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    Disabled,
    Sleep,
    Receive,
    CsmaBackoff,
    Transmit,
    EnergyScan,
    #[cfg(feature = "csl-receiver")]
    CslSample,
    #[cfg(feature = "csl-transmitter")]
    CslTransmit,
}

/// The sub-MAC engine. One instance per IEEE 802.15.4 radio.
pub struct SubMac<'a, R: Radio, T: Timer> {
    radio: &'a R,
    rng: &'a dyn Rng,
    timer: &'a T,
    callbacks: OptionalCell<&'a dyn Callbacks>,

    radio_caps: Cell<Caps>,
    state: Cell<State>,
    csma_backoffs: Cell<u8>,
    transmit_retries: Cell<u8>,

    pan_id: Cell<u16>,
    short_address: Cell<u16>,
    /// Extended address in canonical (big endian) byte order.
    ext_address: Cell<[u8; 8]>,
    rx_on_when_backoff: Cell<bool>,
    rx_on_when_idle: Cell<bool>,

    energy_scan_max_rssi: Cell<i8>,
    energy_scan_end_time: Cell<Time>,

    tx_frame: MapCell<TxFrame>,
    keys: MacKeySet,

    #[cfg(feature = "csl-receiver")]
    csl_timer: &'a T,
    #[cfg(feature = "csl-receiver")]
    csl_period: Cell<u16>,
    #[cfg(feature = "csl-receiver")]
    csl_channel: Cell<u8>,
    #[cfg(feature = "csl-receiver")]
    csl_timeout_sec: Cell<u32>,
    #[cfg(feature = "csl-receiver")]
    csl_sample_time: Cell<Time>,
    #[cfg(feature = "csl-receiver")]
    is_csl_sampling: Cell<bool>,
    #[cfg(feature = "csl-receiver")]
    multi_csl: Cell<bool>,
    #[cfg(feature = "csl-receiver")]
    max_csl_neighbors: Cell<u8>,
    #[cfg(feature = "csl-receiver")]
    csl_neighbors: [csl::CslNeighbor; CSL_MAX_NEIGHBORS],

    #[cfg(feature = "wakeup-end-device")]
    wed_timer: &'a T,
    #[cfg(feature = "wakeup-end-device")]
    wakeup_listen_interval: Cell<u32>,
    #[cfg(feature = "wakeup-end-device")]
    wakeup_listen_duration: Cell<u32>,
    #[cfg(feature = "wakeup-end-device")]
    wakeup_channel: Cell<u8>,
    #[cfg(feature = "wakeup-end-device")]
    wed_sample_time: Cell<Time>,
    #[cfg(feature = "wakeup-end-device")]
    wed_sample_time_radio: Cell<u64>,
}

impl<'a, R: Radio, T: Timer> SubMac<'a, R, T> {
    pub fn new(
        radio: &'a R,
        rng: &'a dyn Rng,
        timer: &'a T,
        #[cfg(feature = "csl-receiver")] csl_timer: &'a T,
        #[cfg(feature = "wakeup-end-device")] wed_timer: &'a T,
    ) -> SubMac<'a, R, T> {
        let sub_mac = SubMac {
            radio,
            rng,
            timer,
            callbacks: OptionalCell::empty(),
            radio_caps: Cell::new(radio.caps()),
            state: Cell::new(State::Disabled),
            csma_backoffs: Cell::new(0),
            transmit_retries: Cell::new(0),
            pan_id: Cell::new(0xffff),
            short_address: Cell::new(crate::frame::SHORT_ADDR_INVALID),
            ext_address: Cell::new([0; 8]),
            rx_on_when_backoff: Cell::new(true),
            rx_on_when_idle: Cell::new(true),
            energy_scan_max_rssi: Cell::new(INVALID_RSSI),
            energy_scan_end_time: Cell::new(Time(0)),
            tx_frame: MapCell::new(TxFrame::new(RadioType::Ieee802154, MAX_PSDU_LEN)),
            keys: MacKeySet::new(),
            #[cfg(feature = "csl-receiver")]
            csl_timer,
            #[cfg(feature = "csl-receiver")]
            csl_period: Cell::new(0),
            #[cfg(feature = "csl-receiver")]
            csl_channel: Cell::new(0),
            #[cfg(feature = "csl-receiver")]
            csl_timeout_sec: Cell::new(csl::DEFAULT_CSL_TIMEOUT_SEC),
            #[cfg(feature = "csl-receiver")]
            csl_sample_time: Cell::new(Time(0)),
            #[cfg(feature = "csl-receiver")]
            is_csl_sampling: Cell::new(false),
            #[cfg(feature = "csl-receiver")]
            multi_csl: Cell::new(false),
            #[cfg(feature = "csl-receiver")]
            max_csl_neighbors: Cell::new(1),
            #[cfg(feature = "csl-receiver")]
            csl_neighbors: core::array::from_fn(|_| csl::CslNeighbor::new()),
            #[cfg(feature = "wakeup-end-device")]
            wed_timer,
            #[cfg(feature = "wakeup-end-device")]
            wakeup_listen_interval: Cell::new(0),
            #[cfg(feature = "wakeup-end-device")]
            wakeup_listen_duration: Cell::new(0),
            #[cfg(feature = "wakeup-end-device")]
            wakeup_channel: Cell::new(0),
            #[cfg(feature = "wakeup-end-device")]
            wed_sample_time: Cell::new(Time(0)),
            #[cfg(feature = "wakeup-end-device")]
            wed_sample_time_radio: Cell::new(0),
        };
        #[cfg(feature = "csl-receiver")]
        sub_mac.csl_init();
        sub_mac
    }

    pub fn set_callbacks(&self, callbacks: &'a dyn Callbacks) {
        self.callbacks.set(callbacks);
    }

    /// Capabilities advertised by the platform radio.
    pub fn radio_caps(&self) -> Caps {
        self.radio_caps.get()
    }

    /// Capabilities of the sub-MAC as a whole: the radio's, plus every
    /// software fallback compiled into this build.
    pub fn get_caps(&self) -> Caps {
        let mut caps = self.radio_caps.get();
        if cfg!(feature = "software-ack-timeout") {
            caps |= Caps::ACK_TIMEOUT;
        }
        if cfg!(feature = "software-csma-backoff") {
            caps |= Caps::CSMA_BACKOFF;
        }
        if cfg!(feature = "software-retransmit") {
            caps |= Caps::TRANSMIT_RETRIES;
        }
        if cfg!(feature = "software-energy-scan") {
            caps |= Caps::ENERGY_SCAN;
        }
        if cfg!(feature = "software-tx-security") {
            caps |= Caps::TRANSMIT_SEC;
        }
        if cfg!(feature = "software-tx-timing") {
            caps |= Caps::TRANSMIT_TIMING;
        }
        caps
    }

    // Capability gates: a software feature is active iff the radio does not
    // provide it and the fallback is compiled in.

    fn radio_supports_csma_backoff(&self) -> bool {
        self.radio_caps
            .get()
            .contains(Caps::CSMA_BACKOFF.union(Caps::TRANSMIT_RETRIES))
    }

    fn should_handle_csma_backoff(&self) -> bool {
        cfg!(feature = "software-csma-backoff") && !self.radio_supports_csma_backoff()
    }

    fn should_handle_ack_timeout(&self) -> bool {
        cfg!(feature = "software-ack-timeout")
            && !self.radio_caps.get().contains(Caps::ACK_TIMEOUT)
    }

    fn should_handle_retries(&self) -> bool {
        cfg!(feature = "software-retransmit")
            && !self.radio_caps.get().contains(Caps::TRANSMIT_RETRIES)
    }

    fn should_handle_energy_scan(&self) -> bool {
        cfg!(feature = "software-energy-scan")
            && !self.radio_caps.get().contains(Caps::ENERGY_SCAN)
    }

    pub(crate) fn should_handle_transmit_security(&self) -> bool {
        cfg!(feature = "software-tx-security")
            && !self.radio_caps.get().contains(Caps::TRANSMIT_SEC)
    }

    #[cfg(feature = "csl-transmitter")]
    fn should_handle_transmit_target_time(&self) -> bool {
        cfg!(feature = "software-tx-timing")
            && !self.radio_caps.get().contains(Caps::TRANSMIT_TIMING)
    }

    #[cfg(any(feature = "csl-receiver", feature = "wakeup-end-device"))]
    fn radio_supports_receive_timing(&self) -> bool {
        self.radio_caps.get().contains(Caps::RECEIVE_TIMING)
    }

    /// Microsecond durations are scaled to whatever unit the platform timer
    /// runs at.
    fn timer_ticks_from_us(us: u32) -> u32 {
        if cfg!(feature = "usec-timer") {
            us
        } else {
            us / 1000
        }
    }

    // Configuration.

    pub fn set_pan_id(&self, pan_id: u16) {
        self.pan_id.set(pan_id);
        self.radio.set_pan_id(pan_id);
        log_debg!("RadioPanId: {=u16:#x}", pan_id);
    }

    pub fn get_pan_id(&self) -> u16 {
        self.pan_id.get()
    }

    pub fn set_short_address(&self, short_address: u16) {
        self.short_address.set(short_address);
        self.radio.set_short_address(short_address);
        log_debg!("RadioShortAddress: {=u16:#x}", short_address);
    }

    pub fn get_short_address(&self) -> u16 {
        self.short_address.get()
    }

    /// `ext_address` is in canonical (big endian) byte order; the radio
    /// receives it reversed, as it appears on the air.
    pub fn set_ext_address(&self, ext_address: [u8; 8]) {
        self.ext_address.set(ext_address);
        let mut reversed = ext_address;
        reversed.reverse();
        self.radio.set_extended_address(reversed);
    }

    pub fn get_ext_address(&self) -> [u8; 8] {
        self.ext_address.get()
    }

    /// Whether the radio stays in receive (rather than sleep) while waiting
    /// out a CSMA backoff.
    pub fn set_rx_on_when_backoff(&self, rx_on_when_backoff: bool) {
        self.rx_on_when_backoff.set(rx_on_when_backoff);
    }

    pub fn set_rx_on_when_idle(&self, rx_on_when_idle: bool) {
        self.rx_on_when_idle.set(rx_on_when_idle);
    }

    pub fn rx_on_when_idle(&self) -> bool {
        self.rx_on_when_idle.get()
    }

    // Radio state ownership.

    pub fn enable(&self) -> Result<(), ErrorCode> {
        if self.state.get() != State::Disabled {
            return Ok(());
        }
        self.radio.enable()?;
        self.radio.sleep()?;
        self.set_state(State::Sleep);
        Ok(())
    }

    /// Unconditionally stops every engine timer, abandons any in-flight
    /// operation without a completion callback and puts the radio away.
    pub fn disable(&self) -> Result<(), ErrorCode> {
        self.timer.stop();
        #[cfg(feature = "csl-receiver")]
        {
            self.csl_timer.stop();
            self.is_csl_sampling.set(false);
        }
        #[cfg(feature = "wakeup-end-device")]
        self.wed_timer.stop();
        self.radio.sleep()?;
        self.radio.disable()?;
        self.set_state(State::Disabled);
        Ok(())
    }

    pub fn sleep(&self) -> Result<(), ErrorCode> {
        match self.state.get() {
            State::Disabled | State::CsmaBackoff | State::Transmit | State::EnergyScan => {
                return Err(ErrorCode::InvalidState);
            }
            #[cfg(feature = "csl-transmitter")]
            State::CslTransmit => return Err(ErrorCode::InvalidState),
            _ => {}
        }

        #[cfg(feature = "csl-receiver")]
        if self.csl_period.get() > 0 {
            self.csl_sample();
            return Ok(());
        }

        match self.radio.sleep() {
            Err(error) => {
                log_warn!("RadioSleep() failed");
                Err(error)
            }
            Ok(()) => {
                self.set_state(State::Sleep);
                Ok(())
            }
        }
    }

    pub fn receive(&self, channel: u8) -> Result<(), ErrorCode> {
        if self.state.get() == State::Disabled {
            return Err(ErrorCode::InvalidState);
        }
        match self.radio.receive(channel) {
            Err(error) => {
                log_warn!("RadioReceive() failed");
                Err(error)
            }
            Ok(()) => {
                self.set_state(State::Receive);
                Ok(())
            }
        }
    }

    /// Grants access to the transmit frame buffer owned by the sub-MAC.
    /// The upper layer frames its transmission here, then calls [`send`].
    ///
    /// [`send`]: SubMac::send
    pub fn transmit_frame<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut TxFrame) -> Ret,
    {
        self.tx_frame
            .map(f)
            .unwrap_or_else(|| panic!("transmit frame in use"))
    }

    /// Sends the frame prepared in [`transmit_frame`]. The sub-MAC handles
    /// ACK timeout, CSMA backoff and retransmission as needed.
    ///
    /// [`transmit_frame`]: SubMac::transmit_frame
    pub fn send(&self) -> Result<(), ErrorCode> {
        match self.state.get() {
            State::Disabled | State::CsmaBackoff | State::Transmit | State::EnergyScan => {
                return Err(ErrorCode::InvalidState);
            }
            #[cfg(feature = "csl-transmitter")]
            State::CslTransmit => return Err(ErrorCode::InvalidState),
            State::Sleep | State::Receive => {}
            #[cfg(feature = "csl-receiver")]
            State::CslSample => {}
        }

        self.process_transmit_security();
        self.csma_backoffs.set(0);
        self.transmit_retries.set(0);
        self.start_csma_backoff();
        Ok(())
    }

    fn process_transmit_security(&self) {
        if !self.should_handle_transmit_security() {
            return;
        }
        self.tx_frame.map(|frame| {
            if !frame.security_enabled() || frame.info.is_security_processed {
                return;
            }
            let Ok(key_id_mode) = frame.key_id_mode() else {
                return;
            };
            if key_id_mode != KeyIdMode::Index {
                return;
            }

            frame.info.aes_key = Some(self.keys.current_key());

            if !frame.info.is_a_retransmission {
                let frame_counter = self.keys.frame_counter();
                let _ = frame.set_key_id(self.keys.key_id());
                let _ = frame.set_frame_counter(frame_counter);
                self.update_frame_counter(frame_counter.wrapping_add(1));
            }

            // A pending CSL IE means the header changes again right before
            // the frame goes on air; AES-CCM runs then.
            if frame.info.csl_ie_present {
                return;
            }

            let ext_address = self.ext_address.get();
            if frame.process_transmit_aes_ccm(&ext_address).is_err() {
                log_warn!("transmit security processing failed");
            }
        });
    }

    fn start_csma_backoff(&self) {
        #[cfg(feature = "csl-transmitter")]
        {
            let csl_period = self.tx_frame.map_or(0, |frame| frame.info.csl_period);
            if csl_period != 0 {
                self.set_state(State::CslTransmit);
                if self.should_handle_transmit_target_time() {
                    let period = csl_period as u32;
                    let phase_now = ((self.radio.now_us() / US_PER_TEN_SYMBOLS as u64)
                        % period as u64) as u32;
                    let phase_desired =
                        self.tx_frame.map_or(0, |frame| frame.info.csl_phase) as u32;
                    if phase_now != phase_desired {
                        let delta = if phase_now < phase_desired {
                            phase_desired - phase_now
                        } else {
                            phase_desired + period - phase_now
                        };
                        self.timer
                            .start(Self::timer_ticks_from_us(delta * US_PER_TEN_SYMBOLS));
                    } else {
                        self.begin_transmit();
                    }
                } else {
                    self.begin_transmit();
                }
                return;
            }
        }

        self.set_state(State::CsmaBackoff);

        if !self.should_handle_csma_backoff() {
            self.begin_transmit();
            return;
        }

        let exponent = (MIN_BE + self.transmit_retries.get() + self.csma_backoffs.get()).min(MAX_BE);
        let backoff_us =
            self.rng.next_bounded(1u32 << exponent) * UNIT_BACKOFF_PERIOD * SYMBOL_TIME_US;

        let channel = self.tx_frame.map_or(0, |frame| frame.channel);
        if self.rx_on_when_backoff.get() {
            let _ = self.radio.receive(channel);
        } else {
            let _ = self.radio.sleep();
        }

        self.timer.start(Self::timer_ticks_from_us(backoff_us));
    }

    fn begin_transmit(&self) {
        match self.state.get() {
            State::CsmaBackoff => {}
            #[cfg(feature = "csl-transmitter")]
            State::CslTransmit => {}
            _ => return,
        }

        self.tx_frame.map(|frame| {
            frame.info.csma_ca_enabled = frame.info.csl_period == 0;

            #[cfg(feature = "csl-receiver")]
            if frame.info.csl_ie_present {
                self.fill_csl(frame);
                if self.should_handle_transmit_security()
                    && frame.security_enabled()
                    && !frame.info.is_security_processed
                {
                    let ext_address = self.ext_address.get();
                    if frame.process_transmit_aes_ccm(&ext_address).is_err() {
                        log_warn!("transmit security processing failed");
                    }
                }
            }

            if !self.radio_caps.get().contains(Caps::SLEEP_TO_TX) {
                let _ = self.radio.receive(frame.channel);
            }
        });

        self.set_state(State::Transmit);

        if let Some(Err(_)) = self.tx_frame.map(|frame| self.radio.transmit(frame)) {
            log_warn!("RadioTransmit() failed");
        }
    }

    /// Platform upcall: the frame's first symbol went on air. Arms the
    /// software ACK timeout when the frame requests an acknowledgment.
    pub fn handle_transmit_started(&self) {
        let ack_request = self.tx_frame.map_or(false, |frame| frame.ack_request());
        if self.should_handle_ack_timeout() && ack_request {
            self.timer.start(Self::timer_ticks_from_us(ACK_TIMEOUT_US));
        }
    }

    /// Platform upcall: the transmission attempt completed.
    pub fn handle_transmit_done(&self, ack: Option<&RxFrame>, result: Result<(), ErrorCode>) {
        self.timer.stop();

        let mut cca_success = true;
        let (csma_enabled, channel) = self
            .tx_frame
            .map_or((false, 0), |frame| (frame.info.csma_ca_enabled, frame.channel));

        match result {
            // No CCA may have been performed on an aborted attempt.
            Err(ErrorCode::Abort) => {}
            Ok(()) | Err(ErrorCode::NoAck) | Err(ErrorCode::ChannelAccessFailure) => {
                if result == Err(ErrorCode::ChannelAccessFailure) {
                    cca_success = false;
                }
                if csma_enabled {
                    self.callbacks
                        .map(|callbacks| callbacks.record_cca_status(cca_success, channel));
                }
            }
            Err(_) => {
                log_warn!("unexpected transmit error");
            }
        }

        self.update_frame_counter_on_tx_done();

        #[cfg(feature = "csl-receiver")]
        self.update_csl_last_sync_on_tx(ack);

        let (max_csma_backoffs, max_frame_retries) = self
            .tx_frame
            .map_or((0, 0), |frame| {
                (frame.info.max_csma_backoffs, frame.info.max_frame_retries)
            });

        let will_csma_retx = !cca_success
            && self.should_handle_csma_backoff()
            && self.csma_backoffs.get() < max_csma_backoffs;
        let will_frame_retx = !will_csma_retx
            && result.is_err()
            && self.should_handle_retries()
            && self.transmit_retries.get() < max_frame_retries;
        let will_retx = will_csma_retx || will_frame_retx;

        self.tx_frame.map(|frame| {
            self.callbacks.map(|callbacks| {
                callbacks.record_frame_transmit_status(
                    frame,
                    ack,
                    result,
                    self.transmit_retries.get(),
                    will_retx,
                )
            });
        });

        if will_csma_retx {
            self.csma_backoffs.set(self.csma_backoffs.get() + 1);
            self.start_csma_backoff();
            return;
        }

        self.csma_backoffs.set(0);

        if will_frame_retx {
            self.transmit_retries.set(self.transmit_retries.get() + 1);
            self.tx_frame.map(|frame| frame.info.is_a_retransmission = true);
            self.start_csma_backoff();
            return;
        }

        self.set_state(State::Receive);

        self.tx_frame.map(|frame| {
            self.callbacks
                .map(|callbacks| callbacks.transmit_done(frame, ack, result));
        });
    }

    /// Number of retransmissions performed for the most recent frame.
    pub fn get_transmit_retries(&self) -> u8 {
        self.transmit_retries.get()
    }

    fn update_frame_counter_on_tx_done(&self) {
        if self.should_handle_transmit_security() {
            return;
        }
        self.tx_frame.map(|frame| {
            if !frame.security_enabled() {
                return;
            }
            // A raw-link user may hand us a vendor-specific frame; parsing
            // is allowed to fail here.
            let Ok(key_id_mode) = frame.key_id_mode() else {
                return;
            };
            if key_id_mode != KeyIdMode::Index {
                return;
            }
            if let Ok(frame_counter) = frame.frame_counter() {
                self.update_frame_counter(frame_counter);
            }
        });
    }

    /// Platform upcall: a frame arrived (or reception failed).
    pub fn handle_receive_done(&self, frame: Option<&RxFrame>, result: Result<(), ErrorCode>) {
        if let Some(frame) = frame {
            if result.is_ok() && frame.validate_psdu().is_err() {
                log_debg!("dropping malformed received frame");
                return;
            }
            if !self.should_handle_transmit_security() && frame.info.acked_with_sec_enh_ack {
                self.update_frame_counter(frame.info.ack_frame_counter);
            }
        }

        #[cfg(feature = "csl-receiver")]
        self.update_csl_last_sync_on_rx(frame, result);

        self.callbacks
            .map(|callbacks| callbacks.receive_done(frame, result));
    }

    /// Platform upcall: the radio rewrote header IEs of the pending
    /// transmit frame (e.g. hardware-updated CSL phase) and security must
    /// be (re)processed.
    pub fn handle_frame_updated(&self) {
        self.tx_frame.map(|frame| {
            if self.should_handle_transmit_security() {
                if frame.security_enabled() && !frame.info.is_security_processed {
                    let ext_address = self.ext_address.get();
                    if frame.process_transmit_aes_ccm(&ext_address).is_err() {
                        log_warn!("transmit security processing failed");
                    }
                }
            } else {
                self.callbacks.map(|callbacks| callbacks.frame_updated(frame));
            }
        });
    }

    // Energy scan.

    pub fn energy_scan(&self, scan_channel: u8, scan_duration_ms: u16) -> Result<(), ErrorCode> {
        match self.state.get() {
            State::Disabled | State::CsmaBackoff | State::Transmit | State::EnergyScan => {
                return Err(ErrorCode::InvalidState);
            }
            #[cfg(feature = "csl-transmitter")]
            State::CslTransmit => return Err(ErrorCode::InvalidState),
            State::Sleep | State::Receive => {}
            #[cfg(feature = "csl-receiver")]
            State::CslSample => {}
        }

        if self.radio_caps.get().contains(Caps::ENERGY_SCAN) {
            self.radio.energy_scan(scan_channel, scan_duration_ms)?;
            self.set_state(State::EnergyScan);
            Ok(())
        } else if self.should_handle_energy_scan() {
            self.radio.receive(scan_channel)?;
            self.set_state(State::EnergyScan);
            self.energy_scan_max_rssi.set(INVALID_RSSI);
            self.energy_scan_end_time.set(
                self.timer.now()
                    + Self::timer_ticks_from_us(scan_duration_ms as u32 * 1000),
            );
            self.timer.start(0);
            Ok(())
        } else {
            Err(ErrorCode::NotImplemented)
        }
    }

    fn sample_rssi(&self) {
        let rssi = self.radio.rssi();

        if rssi != INVALID_RSSI {
            let max = self.energy_scan_max_rssi.get();
            if max == INVALID_RSSI || rssi > max {
                self.energy_scan_max_rssi.set(rssi);
            }
        }

        if self.timer.now().is_before(self.energy_scan_end_time.get()) {
            let interval = if cfg!(feature = "usec-timer") { 128 } else { 1 };
            self.timer.start_at(self.timer.fire_time(), interval);
        } else {
            self.handle_energy_scan_done(self.energy_scan_max_rssi.get());
        }
    }

    /// Reports the scan result; also the platform upcall for radios with a
    /// hardware energy scan.
    pub fn handle_energy_scan_done(&self, max_rssi: i8) {
        if self.state.get() == State::Disabled {
            return;
        }
        self.set_state(State::Receive);
        self.callbacks
            .map(|callbacks| callbacks.energy_scan_done(max_rssi));
    }

    /// Platform upcall: one of the engine timers fired.
    pub fn handle_timer(&self) {
        match self.state.get() {
            #[cfg(feature = "csl-transmitter")]
            State::CslTransmit => self.begin_transmit(),
            State::CsmaBackoff => self.begin_transmit(),
            State::Transmit => {
                // ACK timeout: bring the radio out of any hardware
                // ack-wait before reporting the attempt.
                log_debg!("ack timer timed out");
                let channel = self.tx_frame.map_or(0, |frame| frame.channel);
                let _ = self.radio.receive(channel);
                self.handle_transmit_done(None, Err(ErrorCode::NoAck));
            }
            State::EnergyScan => self.sample_rssi(),
            _ => {}
        }
    }

    // Key material and frame counter.

    pub fn set_mac_key(
        &self,
        key_id_mode: KeyIdMode,
        key_id: u8,
        prev_key: KeyMaterial,
        curr_key: KeyMaterial,
        next_key: KeyMaterial,
    ) {
        self.keys
            .set_keys(key_id_mode, key_id, prev_key, curr_key, next_key);

        if !self.should_handle_transmit_security() {
            self.radio
                .set_mac_key(key_id_mode.raw(), key_id, &prev_key, &curr_key, &next_key);
        }
    }

    pub fn current_mac_key(&self) -> KeyMaterial {
        self.keys.current_key()
    }

    pub fn previous_mac_key(&self) -> KeyMaterial {
        self.keys.previous_key()
    }

    pub fn next_mac_key(&self) -> KeyMaterial {
        self.keys.next_key()
    }

    pub fn get_frame_counter(&self) -> u32 {
        self.keys.frame_counter()
    }

    pub fn set_frame_counter(&self, frame_counter: u32) {
        self.keys.set_frame_counter(frame_counter);
        if !self.should_handle_transmit_security() {
            self.radio.set_mac_frame_counter(frame_counter);
        }
    }

    /// Raises the counter only if `frame_counter` is ahead of the stored
    /// value (used when restoring from persisted settings).
    pub fn set_frame_counter_if_larger(&self, frame_counter: u32) {
        if self.keys.update_frame_counter(frame_counter) && !self.should_handle_transmit_security()
        {
            self.radio.set_mac_frame_counter(frame_counter);
        }
    }

    fn update_frame_counter(&self, frame_counter: u32) {
        if self.keys.update_frame_counter(frame_counter) {
            self.callbacks
                .map(|callbacks| callbacks.frame_counter_updated(self.keys.frame_counter()));
        }
    }

    // Measurements.

    pub fn get_rssi(&self) -> i8 {
        self.radio.rssi()
    }

    pub fn get_noise_floor(&self) -> i8 {
        self.radio.receive_sensitivity()
    }

    fn set_state(&self, state: State) {
        if self.state.get() != state {
            log_debg!("RadioState: {} -> {}", self.state.get(), state);
            self.state.set(state);
        }
    }
}
