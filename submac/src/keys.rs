// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! MAC key material and outgoing frame counter storage.
//!
//! Key rotation keeps three keys live at once: the key identified by the
//! active key index, its predecessor at `index - 1` (mod 128) and its
//! successor at `index + 1` (mod 128), so frames secured just before or
//! after a rotation still verify. Only KeyIdMode 1 key sets are stored;
//! other modes are accepted and ignored, as their keys are located through
//! the key source carried in the frame.

use core::cell::Cell;

use wpan_hal::radio::KeyMaterial;

use crate::frame::KeyIdMode;

/// The rotating KeyIdMode-1 key set plus the outgoing frame counter.
pub struct MacKeySet {
    key_id: Cell<u8>,
    prev_key: Cell<KeyMaterial>,
    curr_key: Cell<KeyMaterial>,
    next_key: Cell<KeyMaterial>,
    frame_counter: Cell<u32>,
}

impl MacKeySet {
    pub const fn new() -> MacKeySet {
        MacKeySet {
            key_id: Cell::new(0),
            prev_key: Cell::new(KeyMaterial::clear()),
            curr_key: Cell::new(KeyMaterial::clear()),
            next_key: Cell::new(KeyMaterial::clear()),
            frame_counter: Cell::new(0),
        }
    }

    /// Stores a new key set. Returns whether the set was stored (KeyIdMode 1
    /// only).
    pub fn set_keys(
        &self,
        key_id_mode: KeyIdMode,
        key_id: u8,
        prev_key: KeyMaterial,
        curr_key: KeyMaterial,
        next_key: KeyMaterial,
    ) -> bool {
        match key_id_mode {
            KeyIdMode::Index => {
                self.key_id.set(key_id);
                self.prev_key.set(prev_key);
                self.curr_key.set(curr_key);
                self.next_key.set(next_key);
                true
            }
            KeyIdMode::Implicit | KeyIdMode::Source4Index | KeyIdMode::Source8Index => false,
        }
    }

    pub fn key_id(&self) -> u8 {
        self.key_id.get()
    }

    pub fn previous_key(&self) -> KeyMaterial {
        self.prev_key.get()
    }

    pub fn current_key(&self) -> KeyMaterial {
        self.curr_key.get()
    }

    pub fn next_key(&self) -> KeyMaterial {
        self.next_key.get()
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter.get()
    }

    /// Overwrites the counter unconditionally (initial seeding, or restore
    /// from persisted settings).
    pub fn set_frame_counter(&self, frame_counter: u32) {
        self.frame_counter.set(frame_counter);
    }

    /// Raises the counter to `frame_counter` if that is a forward move in
    /// serial-number arithmetic; the counter never regresses. Returns
    /// whether the stored value changed.
    pub fn update_frame_counter(&self, frame_counter: u32) -> bool {
        let current = self.frame_counter.get();
        let forward = frame_counter.wrapping_sub(current);
        if forward != 0 && forward < (1 << 31) {
            self.frame_counter.set(frame_counter);
            true
        } else {
            false
        }
    }
}

impl Default for MacKeySet {
    fn default() -> Self {
        MacKeySet::new()
    }
}
