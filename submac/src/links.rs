// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! Multi-radio link selection.
//!
//! A device may carry Thread frames over more than one link layer at once:
//! the IEEE 802.15.4 radio (MTU 127) and TREL, a UDP-encapsulated link with
//! a much larger MTU. One logical transmission fans out over a *selected*
//! set of links; a *required* subset must succeed for the overall
//! transmission to count as successful (an empty required set means any one
//! suffices). Because the same payload goes out on every selected link, the
//! frame is prepared in the buffer of the smallest-MTU link among them.
//!
//! Key material is split by link: the sub-MAC holds the 802.15.4 rotating
//! key set, while the TREL keys and the TREL outgoing frame counter live
//! here.

use core::cell::Cell;

use wpan_hal::cells::{MapCell, OptionalCell};
use wpan_hal::radio::{KeyMaterial, Radio, RadioType, TxFrame, MAX_MTU};
use wpan_hal::time::Timer;
use wpan_hal::ErrorCode;

use crate::frame::{FrameRead, FrameWrite, KeyIdMode};
use crate::keys::MacKeySet;
use crate::sub_mac::{Callbacks, SubMac};

const ALL_RADIO_TYPES: [RadioType; 2] = [RadioType::Ieee802154, RadioType::Trel];

/// A set of radio link types.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RadioTypes(u8);

impl RadioTypes {
    const fn bit(radio_type: RadioType) -> u8 {
        match radio_type {
            RadioType::Ieee802154 => 1 << 0,
            RadioType::Trel => 1 << 1,
        }
    }

    pub const fn new() -> RadioTypes {
        RadioTypes(0)
    }

    pub const fn single(radio_type: RadioType) -> RadioTypes {
        RadioTypes(Self::bit(radio_type))
    }

    pub fn add(&mut self, radio_type: RadioType) {
        self.0 |= Self::bit(radio_type);
    }

    pub fn add_all(&mut self) {
        for radio_type in ALL_RADIO_TYPES {
            self.add(radio_type);
        }
    }

    pub fn add_types(&mut self, types: RadioTypes) {
        self.0 |= types.0;
    }

    pub fn remove(&mut self, radio_type: RadioType) {
        self.0 &= !Self::bit(radio_type);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn contains(&self, radio_type: RadioType) -> bool {
        self.0 & Self::bit(radio_type) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = RadioType> + '_ {
        ALL_RADIO_TYPES
            .into_iter()
            .filter(move |radio_type| self.contains(*radio_type))
    }
}

/// Aggregates per-link completions of one fanned-out transmission into the
/// overall outcome.
pub struct MultiRadioTx {
    selected: RadioTypes,
    required: RadioTypes,
    results: [Option<Result<(), ErrorCode>>; ALL_RADIO_TYPES.len()],
}

impl MultiRadioTx {
    pub fn new(selected: RadioTypes, required: RadioTypes) -> MultiRadioTx {
        MultiRadioTx {
            selected,
            required,
            results: [None; ALL_RADIO_TYPES.len()],
        }
    }

    fn index(radio_type: RadioType) -> usize {
        match radio_type {
            RadioType::Ieee802154 => 0,
            RadioType::Trel => 1,
        }
    }

    fn result(&self, radio_type: RadioType) -> Option<Result<(), ErrorCode>> {
        self.results[Self::index(radio_type)]
    }

    /// Records one link's outcome. Returns the overall outcome once it is
    /// decided:
    ///
    /// - success when every required link reported success (or, with no
    ///   required links, when any link did);
    /// - failure when all selected links have reported and success can no
    ///   longer be met.
    pub fn record(
        &mut self,
        radio_type: RadioType,
        result: Result<(), ErrorCode>,
    ) -> Option<Result<(), ErrorCode>> {
        self.results[Self::index(radio_type)] = Some(result);

        let success = if self.required.is_empty() {
            self.selected
                .iter()
                .any(|link| self.result(link) == Some(Ok(())))
        } else {
            self.required
                .iter()
                .all(|link| self.result(link) == Some(Ok(())))
        };
        if success {
            return Some(Ok(()));
        }

        let all_reported = self
            .selected
            .iter()
            .all(|link| self.result(link).is_some());
        if !all_reported {
            return None;
        }

        // Prefer the error of a required link as the overall error.
        let error = self
            .required
            .iter()
            .chain(self.selected.iter())
            .filter_map(|link| self.result(link))
            .find_map(|result| result.err())
            .unwrap_or(ErrorCode::Failed);
        Some(Err(error))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TrelState {
    Disabled,
    Sleep,
    Receive,
    Transmit,
}

/// The TREL link: Thread frames over UDP, presented through the same radio
/// contract as 802.15.4. The UDP plumbing itself lives in the platform.
pub struct TrelLink<'a, L: Radio> {
    radio: &'a L,
    state: Cell<TrelState>,
    tx_frame: MapCell<TxFrame>,
}

impl<'a, L: Radio> TrelLink<'a, L> {
    pub fn new(radio: &'a L) -> TrelLink<'a, L> {
        TrelLink {
            radio,
            state: Cell::new(TrelState::Disabled),
            tx_frame: MapCell::new(TxFrame::new(RadioType::Trel, MAX_MTU)),
        }
    }

    pub fn enable(&self) {
        if self.state.get() == TrelState::Disabled {
            let _ = self.radio.enable();
            let _ = self.radio.sleep();
            self.state.set(TrelState::Sleep);
        }
    }

    pub fn disable(&self) {
        if self.state.get() != TrelState::Disabled {
            let _ = self.radio.sleep();
            let _ = self.radio.disable();
            self.state.set(TrelState::Disabled);
        }
    }

    pub fn sleep(&self) {
        if self.state.get() != TrelState::Disabled {
            let _ = self.radio.sleep();
            self.state.set(TrelState::Sleep);
        }
    }

    pub fn receive(&self, channel: u8) {
        if self.state.get() != TrelState::Disabled {
            let _ = self.radio.receive(channel);
            self.state.set(TrelState::Receive);
        }
    }

    pub fn transmit_frame<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut TxFrame) -> Ret,
    {
        self.tx_frame
            .map(f)
            .unwrap_or_else(|| panic!("trel transmit frame in use"))
    }

    pub fn send(&self) {
        if self.state.get() == TrelState::Disabled {
            return;
        }
        self.state.set(TrelState::Transmit);
        if let Some(Err(_)) = self.tx_frame.map(|frame| self.radio.transmit(frame)) {
            log_warn!("trel transmit failed");
        }
    }

    fn handle_transmit_done(&self, result: Result<(), ErrorCode>, callbacks: &dyn Callbacks) {
        self.state.set(TrelState::Receive);
        self.tx_frame.map(|frame| {
            callbacks.transmit_done(frame, None, result);
        });
    }
}

/// All radio links of the device plus the per-link transmit frames and the
/// selected/required sets of the transmission being prepared.
pub struct Links<'a, R: Radio, L: Radio, T: Timer> {
    sub_mac: SubMac<'a, R, T>,
    trel: TrelLink<'a, L>,
    callbacks: OptionalCell<&'a dyn Callbacks>,

    selected_radio_types: Cell<RadioTypes>,
    required_radio_types: Cell<RadioTypes>,

    trel_keys: MacKeySet,
    key_sequence: Cell<u32>,
}

impl<'a, R: Radio, L: Radio, T: Timer> Links<'a, R, L, T> {
    pub fn new(sub_mac: SubMac<'a, R, T>, trel_radio: &'a L) -> Links<'a, R, L, T> {
        Links {
            sub_mac,
            trel: TrelLink::new(trel_radio),
            callbacks: OptionalCell::empty(),
            selected_radio_types: Cell::new(RadioTypes::new()),
            required_radio_types: Cell::new(RadioTypes::new()),
            trel_keys: MacKeySet::new(),
            key_sequence: Cell::new(0),
        }
    }

    pub fn set_callbacks(&self, callbacks: &'a dyn Callbacks) {
        self.callbacks.set(callbacks);
        self.sub_mac.set_callbacks(callbacks);
    }

    pub fn sub_mac(&self) -> &SubMac<'a, R, T> {
        &self.sub_mac
    }

    pub fn trel(&self) -> &TrelLink<'a, L> {
        &self.trel
    }

    // Link lifecycle, fanned out to every radio.

    pub fn enable(&self) {
        let _ = self.sub_mac.enable();
        self.trel.enable();
    }

    pub fn disable(&self) {
        let _ = self.sub_mac.disable();
        self.trel.disable();
    }

    pub fn sleep(&self) {
        let _ = self.sub_mac.sleep();
        self.trel.sleep();
    }

    pub fn receive(&self, channel: u8) {
        let _ = self.sub_mac.receive(channel);
        self.trel.receive(channel);
    }

    /// CSL sampling applies to the 802.15.4 link only; other links sleep.
    #[cfg(feature = "csl-receiver")]
    pub fn csl_sample(&self) {
        self.sub_mac.csl_sample();
        self.trel.sleep();
    }

    pub fn set_pan_id(&self, pan_id: u16) {
        self.sub_mac.set_pan_id(pan_id);
        self.trel.radio.set_pan_id(pan_id);
    }

    pub fn set_short_address(&self, short_address: u16) {
        self.sub_mac.set_short_address(short_address);
        self.trel.radio.set_short_address(short_address);
    }

    pub fn set_ext_address(&self, ext_address: [u8; 8]) {
        self.sub_mac.set_ext_address(ext_address);
        let mut reversed = ext_address;
        reversed.reverse();
        self.trel.radio.set_extended_address(reversed);
    }

    // Transmit frame selection.

    /// Grants access to the transmit frame of one link and marks that link
    /// selected.
    pub fn with_tx_frame<F, Ret>(&self, radio_type: RadioType, f: F) -> Ret
    where
        F: FnOnce(&mut TxFrame) -> Ret,
    {
        let mut selected = self.selected_radio_types.get();
        selected.add(radio_type);
        self.selected_radio_types.set(selected);

        match radio_type {
            RadioType::Ieee802154 => self.sub_mac.transmit_frame(f),
            RadioType::Trel => self.trel.transmit_frame(f),
        }
    }

    /// Grants access to the transmit frame with the smallest MTU among
    /// `radio_types`, so the prepared payload fits on every selected link,
    /// and unions `radio_types` into the selected set.
    pub fn with_tx_frame_for<F, Ret>(&self, radio_types: RadioTypes, f: F) -> Ret
    where
        F: FnOnce(&mut TxFrame) -> Ret,
    {
        let mut selected = self.selected_radio_types.get();
        selected.add_types(radio_types);
        self.selected_radio_types.set(selected);

        // The 802.15.4 PSDU is the most restrictive of the supported links.
        if radio_types.contains(RadioType::Ieee802154) {
            self.sub_mac.transmit_frame(f)
        } else {
            self.trel.transmit_frame(f)
        }
    }

    /// The frame used for broadcast: smallest MTU across all radios.
    pub fn with_broadcast_tx_frame<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut TxFrame) -> Ret,
    {
        let mut all = RadioTypes::new();
        all.add_all();
        self.with_tx_frame_for(all, f)
    }

    pub fn get_selected_radio_types(&self) -> RadioTypes {
        self.selected_radio_types.get()
    }

    pub fn get_required_radio_types(&self) -> RadioTypes {
        self.required_radio_types.get()
    }

    /// Links whose success is necessary for the overall transmission to
    /// succeed. Must be a subset of the selected links.
    pub fn set_required_radio_types(&self, radio_types: RadioTypes) {
        self.required_radio_types.set(radio_types);
    }

    /// Resets both per-link frames and the selection sets ahead of framing
    /// a new transmission.
    pub fn clear_tx_frames(&self) {
        self.sub_mac.transmit_frame(|frame| frame.reset());
        self.trel.transmit_frame(|frame| frame.reset());
        self.selected_radio_types.set(RadioTypes::new());
        self.required_radio_types.set(RadioTypes::new());
    }

    /// Sends the prepared frame over every selected link: links whose
    /// buffer is still empty get a copy of the prepared frame first.
    /// Completions arrive per link through `Callbacks::transmit_done`,
    /// distinguished by the frame's radio type; [`MultiRadioTx`] combines
    /// them.
    pub fn send(&self) -> Result<(), ErrorCode> {
        let selected = self.selected_radio_types.get();
        if selected.is_empty() {
            return Err(ErrorCode::InvalidState);
        }

        if selected.contains(RadioType::Ieee802154) && selected.contains(RadioType::Trel) {
            let trel_empty = self.trel.transmit_frame(|frame| frame.is_empty());
            let ieee_empty = self.sub_mac.transmit_frame(|frame| frame.is_empty());
            if trel_empty && !ieee_empty {
                self.trel.transmit_frame(|dst| {
                    self.sub_mac.transmit_frame(|src| dst.copy_from(src))
                });
            } else if ieee_empty && !trel_empty {
                self.sub_mac.transmit_frame(|dst| {
                    self.trel.transmit_frame(|src| dst.copy_from(src))
                });
            }
        }

        if selected.contains(RadioType::Trel) {
            self.trel.transmit_frame(|frame| self.set_mac_frame_counter(frame));
        }

        let mut result = Ok(());
        if selected.contains(RadioType::Ieee802154) {
            result = self.sub_mac.send();
        }
        if selected.contains(RadioType::Trel) {
            self.trel.send();
        }
        result
    }

    /// Platform upcall: the TREL link finished its transmission attempt.
    pub fn handle_trel_transmit_done(&self, result: Result<(), ErrorCode>) {
        self.callbacks
            .map(|callbacks| self.trel.handle_transmit_done(result, *callbacks));
    }

    // Key material by radio link.

    /// Installs the 802.15.4 rotating key set and records the key sequence
    /// the set was derived from.
    pub fn set_mac_key(
        &self,
        key_id_mode: KeyIdMode,
        key_id: u8,
        prev_key: KeyMaterial,
        curr_key: KeyMaterial,
        next_key: KeyMaterial,
        key_sequence: u32,
    ) {
        self.key_sequence.set(key_sequence);
        self.sub_mac
            .set_mac_key(key_id_mode, key_id, prev_key, curr_key, next_key);
    }

    /// Installs the TREL rotating key set (held here, not in the sub-MAC).
    pub fn set_trel_mac_key(
        &self,
        key_id: u8,
        prev_key: KeyMaterial,
        curr_key: KeyMaterial,
        next_key: KeyMaterial,
    ) {
        self.trel_keys
            .set_keys(KeyIdMode::Index, key_id, prev_key, curr_key, next_key);
    }

    /// The current MAC key for a frame, chosen by the frame's radio link.
    pub fn get_current_mac_key(&self, frame: &TxFrame) -> KeyMaterial {
        match frame.radio_type {
            RadioType::Ieee802154 => self.sub_mac.current_mac_key(),
            RadioType::Trel => self.trel_keys.current_key(),
        }
    }

    /// The MAC key for a frame secured under a neighboring key sequence;
    /// `key_sequence` must be exactly one off the current sequence.
    pub fn get_temporary_mac_key(
        &self,
        frame: &TxFrame,
        key_sequence: u32,
    ) -> Option<KeyMaterial> {
        let current = self.key_sequence.get();
        let (prev_key, next_key) = match frame.radio_type {
            RadioType::Ieee802154 => (
                self.sub_mac.previous_mac_key(),
                self.sub_mac.next_mac_key(),
            ),
            RadioType::Trel => (
                self.trel_keys.previous_key(),
                self.trel_keys.next_key(),
            ),
        };
        if key_sequence == current.wrapping_sub(1) {
            Some(prev_key)
        } else if key_sequence == current.wrapping_add(1) {
            Some(next_key)
        } else {
            None
        }
    }

    /// Stamps a TREL frame with the TREL outgoing frame counter and
    /// advances the stored counter.
    pub fn set_mac_frame_counter(&self, frame: &mut TxFrame) {
        if frame.radio_type != RadioType::Trel {
            return;
        }
        if !frame.security_enabled() {
            return;
        }
        let frame_counter = self.trel_keys.frame_counter();
        if frame.set_frame_counter(frame_counter).is_ok() {
            self.trel_keys
                .set_frame_counter(frame_counter.wrapping_add(1));
        }
    }

    pub fn get_trel_mac_frame_counter(&self) -> u32 {
        self.trel_keys.frame_counter()
    }
}
