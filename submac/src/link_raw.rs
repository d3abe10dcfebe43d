// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! Raw link-layer access.
//!
//! Hosts that own the upper MAC themselves (radio co-processor setups, test
//! harnesses) drive the sub-MAC through this facade instead of the Thread
//! MAC. It may only be enabled while the Thread network interface is down;
//! while active, completions are delivered to the raw client rather than to
//! the upper MAC.
//!
//! Transmit and energy-scan callbacks are one-shot: each is dropped after
//! its single invocation, and a follow-up operation started without a new
//! callback still executes, it just completes silently. The receive
//! callback stays registered until replaced.

use core::cell::Cell;

use wpan_hal::cells::OptionalCell;
use wpan_hal::radio::{Caps, Radio, RxFrame, TxFrame};
use wpan_hal::time::Timer;
use wpan_hal::ErrorCode;

use crate::sub_mac::{Callbacks, SubMac};

/// Client notified of received frames while the raw link is active.
pub trait RawReceiveDone {
    fn receive_done(&self, frame: &RxFrame, result: Result<(), ErrorCode>);
}

/// Client notified when a raw transmission completes.
pub trait RawTransmitDone {
    fn transmit_done(
        &self,
        frame: &TxFrame,
        ack: Option<&RxFrame>,
        result: Result<(), ErrorCode>,
    );
}

/// Client notified when a raw energy scan completes.
pub trait RawEnergyScanDone {
    fn energy_scan_done(&self, max_rssi: i8);
}

/// The raw link-layer facade over a [`SubMac`].
pub struct LinkRaw<'a, R: Radio, T: Timer> {
    sub_mac: &'a SubMac<'a, R, T>,
    enabled: Cell<bool>,
    thread_netif_up: Cell<bool>,
    receive_channel: Cell<u8>,
    pan_id: Cell<u16>,
    receive_done: OptionalCell<&'a dyn RawReceiveDone>,
    transmit_done: OptionalCell<&'a dyn RawTransmitDone>,
    energy_scan_done: OptionalCell<&'a dyn RawEnergyScanDone>,
}

impl<'a, R: Radio, T: Timer> LinkRaw<'a, R, T> {
    pub fn new(sub_mac: &'a SubMac<'a, R, T>, default_channel: u8) -> LinkRaw<'a, R, T> {
        LinkRaw {
            sub_mac,
            enabled: Cell::new(false),
            thread_netif_up: Cell::new(false),
            receive_channel: Cell::new(default_channel),
            pan_id: Cell::new(0xffff),
            receive_done: OptionalCell::empty(),
            transmit_done: OptionalCell::empty(),
            energy_scan_done: OptionalCell::empty(),
        }
    }

    /// Tracks the Thread network interface state; the raw link refuses to
    /// enable while the netif is up.
    pub fn set_thread_netif_up(&self, up: bool) {
        self.thread_netif_up.set(up);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), ErrorCode> {
        log_debg!("LinkRaw::Enabled({})", enabled);

        if self.thread_netif_up.get() {
            return Err(ErrorCode::InvalidState);
        }

        if enabled {
            self.sub_mac.enable()?;
        } else {
            let _ = self.sub_mac.disable();
        }
        self.enabled.set(enabled);
        Ok(())
    }

    pub fn get_caps(&self) -> Caps {
        self.sub_mac.get_caps()
    }

    pub fn set_pan_id(&self, pan_id: u16) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.sub_mac.set_pan_id(pan_id);
        self.pan_id.set(pan_id);
        Ok(())
    }

    pub fn set_channel(&self, channel: u8) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.receive_channel.set(channel);
        Ok(())
    }

    pub fn get_channel(&self) -> u8 {
        self.receive_channel.get()
    }

    pub fn set_short_address(&self, short_address: u16) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.sub_mac.set_short_address(short_address);
        Ok(())
    }

    pub fn set_ext_address(&self, ext_address: [u8; 8]) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.sub_mac.set_ext_address(ext_address);
        Ok(())
    }

    /// Starts receiving on the configured channel; received frames go to
    /// `callback` until it is replaced.
    pub fn receive(&self, callback: Option<&'a dyn RawReceiveDone>) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.sub_mac.receive(self.receive_channel.get())?;
        match callback {
            Some(callback) => self.receive_done.set(callback),
            None => self.receive_done.clear(),
        }
        Ok(())
    }

    pub fn sleep(&self) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.sub_mac.sleep()
    }

    /// Sends the frame prepared through the sub-MAC's transmit buffer.
    /// `callback` fires once for this transmission only.
    pub fn transmit(&self, callback: Option<&'a dyn RawTransmitDone>) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.sub_mac.send()?;
        match callback {
            Some(callback) => self.transmit_done.set(callback),
            None => self.transmit_done.clear(),
        }
        Ok(())
    }

    /// Starts an energy scan. `callback` fires once for this scan only.
    pub fn energy_scan(
        &self,
        scan_channel: u8,
        scan_duration_ms: u16,
        callback: Option<&'a dyn RawEnergyScanDone>,
    ) -> Result<(), ErrorCode> {
        if !self.enabled.get() {
            return Err(ErrorCode::InvalidState);
        }
        self.sub_mac.energy_scan(scan_channel, scan_duration_ms)?;
        match callback {
            Some(callback) => self.energy_scan_done.set(callback),
            None => self.energy_scan_done.clear(),
        }
        Ok(())
    }

    /// Delivers a received frame to the raw client. Failed receptions are
    /// not forwarded.
    pub fn invoke_receive_done(&self, frame: Option<&RxFrame>, result: Result<(), ErrorCode>) {
        if let (Some(frame), Ok(())) = (frame, result) {
            self.receive_done.map(|callback| callback.receive_done(frame, result));
        }
    }

    /// Delivers the transmit completion and drops the one-shot callback.
    pub fn invoke_transmit_done(
        &self,
        frame: &TxFrame,
        ack: Option<&RxFrame>,
        result: Result<(), ErrorCode>,
    ) {
        if let Some(callback) = self.transmit_done.take() {
            callback.transmit_done(frame, ack, result);
        }
    }

    /// Delivers the scan result and drops the one-shot callback.
    pub fn invoke_energy_scan_done(&self, max_rssi: i8) {
        if let Some(callback) = self.energy_scan_done.take() {
            callback.energy_scan_done(max_rssi);
        }
    }
}

/// A `LinkRaw` can serve directly as the sub-MAC callback object in
/// radio-only builds, where there is no upper MAC to dispatch to.
impl<'a, R: Radio, T: Timer> Callbacks for LinkRaw<'a, R, T> {
    fn receive_done(&self, frame: Option<&RxFrame>, result: Result<(), ErrorCode>) {
        self.invoke_receive_done(frame, result);
    }

    fn record_cca_status(&self, _cca_success: bool, _channel: u8) {}

    fn record_frame_transmit_status(
        &self,
        frame: &TxFrame,
        _ack: Option<&RxFrame>,
        result: Result<(), ErrorCode>,
        retry_count: u8,
        _will_retx: bool,
    ) {
        if result.is_err() {
            log_debg!(
                "frame tx attempt failed, retries {=u8}/{=u8}",
                retry_count,
                frame.info.max_frame_retries
            );
        }
    }

    fn transmit_done(&self, frame: &TxFrame, ack: Option<&RxFrame>, result: Result<(), ErrorCode>) {
        self.invoke_transmit_done(frame, ack, result);
    }

    fn energy_scan_done(&self, max_rssi: i8) {
        self.invoke_energy_scan_done(max_rssi);
    }

    fn frame_counter_updated(&self, _frame_counter: u32) {}
}
