// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! The platform radio contract.
//!
//! A platform radio advertises a set of capabilities; for every capability it
//! does not advertise, the Sub-MAC engine layers a software fallback on top
//! of this interface. All calls return synchronously. Long-running
//! operations (a transmission, a receive window, an energy scan) complete
//! through the engine's `handle_*` upcalls, which the platform glue drives
//! from the single shared execution context: exactly one `tx done` per
//! accepted `transmit`, and one `rx done` per received frame whose borrowed
//! buffer is valid only for the duration of the upcall.

use crate::error::ErrorCode;

/// aMaxPhyPacketSize: largest PSDU an IEEE 802.15.4 PHY will transmit.
pub const MAX_PSDU_LEN: usize = 127;

/// MAC footer (FCS) size in octets. The FCS is owned by the PHY.
pub const FCS_SIZE: usize = 2;

/// Largest PSDU among the supported link types. UDP-encapsulated links
/// carry full 6LoWPAN-sized frames.
pub const MAX_MTU: usize = 1280;

/// O-QPSK 2.4 GHz symbol duration.
pub const SYMBOL_TIME_US: u32 = 16;

/// Ten symbol periods, the CSL time base.
pub const US_PER_TEN_SYMBOLS: u32 = 10 * SYMBOL_TIME_US;

/// RSSI value meaning "no valid measurement".
pub const INVALID_RSSI: i8 = 127;

/// Transmit power value meaning "use the radio default".
pub const INVALID_POWER: i8 = 127;

/// Capabilities a platform radio may advertise.
///
/// The Sub-MAC provides a software fallback for any capability that is both
/// absent here and enabled in the engine configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Caps(u16);

impl Caps {
    pub const NONE: Caps = Caps(0);
    /// Radio times out waiting for an ACK by itself.
    pub const ACK_TIMEOUT: Caps = Caps(1 << 0);
    /// Radio performs CSMA/CA backoff before transmitting.
    pub const CSMA_BACKOFF: Caps = Caps(1 << 1);
    /// Radio retransmits on failure up to the frame's retry budget.
    pub const TRANSMIT_RETRIES: Caps = Caps(1 << 2);
    /// Radio performs energy scans in hardware.
    pub const ENERGY_SCAN: Caps = Caps(1 << 3);
    /// Radio applies transmit security (CCM*) itself.
    pub const TRANSMIT_SEC: Caps = Caps(1 << 4);
    /// Radio honors a target transmit time in the frame metadata.
    pub const TRANSMIT_TIMING: Caps = Caps(1 << 5);
    /// Radio supports scheduled receive windows (`receive_at`).
    pub const RECEIVE_TIMING: Caps = Caps(1 << 6);
    /// Radio can transmit directly out of sleep without being armed in
    /// receive first.
    pub const SLEEP_TO_TX: Caps = Caps(1 << 7);

    pub const fn contains(self, other: Caps) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Caps) -> Caps {
        Caps(self.0 | other.0)
    }
}

impl core::ops::BitOr for Caps {
    type Output = Caps;

    fn bitor(self, other: Caps) -> Caps {
        self.union(other)
    }
}

impl core::ops::BitOrAssign for Caps {
    fn bitor_assign(&mut self, other: Caps) {
        *self = self.union(other);
    }
}

/// The link a frame travels over.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioType {
    Ieee802154,
    Trel,
}

/// A MAC key, either by value or as an opaque reference into a platform
/// key store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyMaterial {
    Raw([u8; 16]),
    /// Reference to a key held by the platform crypto engine.
    KeyRef(u32),
}

impl KeyMaterial {
    pub const fn clear() -> KeyMaterial {
        KeyMaterial::Raw([0; 16])
    }

    /// The key bytes, when held by value.
    pub fn as_raw(&self) -> Option<&[u8; 16]> {
        match self {
            KeyMaterial::Raw(bytes) => Some(bytes),
            KeyMaterial::KeyRef(_) => None,
        }
    }
}

impl Default for KeyMaterial {
    fn default() -> KeyMaterial {
        KeyMaterial::clear()
    }
}

/// Out-of-band metadata for an outgoing frame.
#[derive(Copy, Clone, Debug)]
pub struct TxInfo {
    /// Key used by the radio when it owns transmit security.
    pub aes_key: Option<KeyMaterial>,
    /// Transmit power in dBm, or `INVALID_POWER` for the radio default.
    pub tx_power: i8,
    pub max_csma_backoffs: u8,
    pub max_frame_retries: u8,
    /// CSL period in ten-symbol units; non-zero requests a phase-aligned
    /// transmission.
    pub csl_period: u16,
    /// CSL phase in ten-symbol units, relative to the peer's sample time.
    pub csl_phase: u16,
    /// Absolute radio time at which the frame should go on air.
    pub target_time_us: Option<u32>,
    pub is_a_retransmission: bool,
    pub csma_ca_enabled: bool,
    pub is_security_processed: bool,
    pub is_header_updated: bool,
    pub csl_ie_present: bool,
}

impl Default for TxInfo {
    fn default() -> TxInfo {
        TxInfo {
            aes_key: None,
            tx_power: INVALID_POWER,
            max_csma_backoffs: 0,
            max_frame_retries: 0,
            csl_period: 0,
            csl_phase: 0,
            target_time_us: None,
            is_a_retransmission: false,
            csma_ca_enabled: true,
            is_security_processed: false,
            is_header_updated: false,
            csl_ie_present: false,
        }
    }
}

/// Out-of-band metadata delivered with a received frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct RxInfo {
    /// Radio timestamp of frame reception (start of MHR), microseconds.
    pub timestamp_us: u64,
    pub rssi: i8,
    pub lqi: u8,
    /// The ACK we sent for this frame had the frame-pending bit set.
    pub acked_with_frame_pending: bool,
    /// The radio acknowledged this frame with a secured Enh-ACK; the
    /// counter and key index it used are reported alongside.
    pub acked_with_sec_enh_ack: bool,
    pub ack_frame_counter: u32,
    pub ack_key_id: u8,
}

/// An outgoing frame buffer plus its metadata.
///
/// The buffer is owned by the engine for the whole life of a transmission;
/// the radio borrows it only for the duration of the `transmit` call.
pub struct TxFrame {
    psdu: [u8; MAX_MTU],
    len: usize,
    mtu: usize,
    pub channel: u8,
    pub radio_type: RadioType,
    pub info: TxInfo,
}

impl TxFrame {
    pub fn new(radio_type: RadioType, mtu: usize) -> TxFrame {
        debug_assert!(mtu <= MAX_MTU);
        TxFrame {
            psdu: [0; MAX_MTU],
            len: 0,
            mtu,
            channel: 0,
            radio_type,
            info: TxInfo::default(),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// The PSDU written so far.
    pub fn psdu(&self) -> &[u8] {
        &self.psdu[..self.len]
    }

    /// The whole buffer up to the link MTU. Callers grow the frame by
    /// writing here and then calling `set_len`.
    pub fn psdu_mut(&mut self) -> &mut [u8] {
        &mut self.psdu[..self.mtu]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.mtu);
        self.len = len;
    }

    /// A frame is empty until a header has been written into it.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies PSDU, channel and metadata from another frame, truncating to
    /// this frame's MTU if needed (the source is expected to fit).
    pub fn copy_from(&mut self, other: &TxFrame) {
        let len = other.len.min(self.mtu);
        self.psdu[..len].copy_from_slice(&other.psdu[..len]);
        self.len = len;
        self.channel = other.channel;
        self.info = other.info;
    }

    /// Resets length and per-transmission metadata ahead of framing a new
    /// transmission.
    pub fn reset(&mut self) {
        self.len = 0;
        self.info = TxInfo {
            tx_power: INVALID_POWER,
            ..TxInfo::default()
        };
    }
}

/// A received frame, borrowed from the platform for the duration of the
/// receive-done upcall.
pub struct RxFrame<'a> {
    pub psdu: &'a [u8],
    pub channel: u8,
    pub info: RxInfo,
}

/// The contract a platform radio implements.
///
/// Methods covering optional hardware (scheduled receive, hardware energy
/// scan, CSL offload) have defaults that report `NotImplemented` or benign
/// values, so simple radios only implement the core set.
pub trait Radio {
    /// The capability set of this radio. Stable for the life of the radio.
    fn caps(&self) -> Caps;

    fn enable(&self) -> Result<(), ErrorCode>;

    fn disable(&self) -> Result<(), ErrorCode>;

    /// `InvalidState` when a transmission is in flight.
    fn sleep(&self) -> Result<(), ErrorCode>;

    fn receive(&self, channel: u8) -> Result<(), ErrorCode>;

    /// Schedules a receive window of `duration_us` starting at `start_us`
    /// (radio clock). The radio sleeps outside the window.
    fn receive_at(&self, _channel: u8, _start_us: u32, _duration_us: u32) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    /// Begins transmitting the given frame. The frame is borrowed only for
    /// this call; completion is reported through the engine's
    /// `handle_transmit_done`.
    fn transmit(&self, frame: &mut TxFrame) -> Result<(), ErrorCode>;

    fn energy_scan(&self, _channel: u8, _duration_ms: u16) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    fn set_pan_id(&self, pan_id: u16);

    fn set_short_address(&self, short_address: u16);

    /// `ext_address` is in radio byte order (little endian).
    fn set_extended_address(&self, ext_address: [u8; 8]);

    /// Installs the rotating MAC key set for radios that own transmit
    /// security or Enh-ACK generation.
    fn set_mac_key(
        &self,
        _key_id_mode: u8,
        _key_id: u8,
        _prev_key: &KeyMaterial,
        _curr_key: &KeyMaterial,
        _next_key: &KeyMaterial,
    ) {
    }

    /// Seeds the outgoing frame counter for radios that own transmit
    /// security.
    fn set_mac_frame_counter(&self, _frame_counter: u32) {}

    /// Current radio clock in microseconds.
    fn now_us(&self) -> u64;

    /// Most recent RSSI measurement, `INVALID_RSSI` when unavailable.
    fn rssi(&self) -> i8 {
        INVALID_RSSI
    }

    /// Receive sensitivity in dBm; doubles as the noise-floor estimate.
    fn receive_sensitivity(&self) -> i8 {
        -100
    }

    // CSL offload. Only consulted when the radio advertises the matching
    // capabilities; `max_multi_csl_peers` of zero means the radio tracks at
    // most one CSL peer through `enable_csl`.

    fn enable_csl(
        &self,
        _period: u16,
        _short_address: u16,
        _ext_address: Option<&[u8; 8]>,
    ) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    fn enable_multi_csl(&self, _period: u16) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    fn add_csl_entry(&self, _short_address: u16, _ext_address: [u8; 8]) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    fn clear_csl_entry(&self, _short_address: u16, _ext_address: [u8; 8]) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    fn clear_csl_entries(&self) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    /// Tells the radio the next CSL sample instant so it can fill the CSL IE
    /// phase in Enh-ACKs it generates.
    fn update_csl_sample_time(&self, _sample_time_us: u32) {}

    /// This radio's clock accuracy in ppm (a 40 ppm crystal reports 40).
    fn csl_accuracy(&self) -> u8 {
        255
    }

    /// Fixed scheduling uncertainty of this radio in microseconds.
    fn csl_uncertainty(&self) -> u8 {
        255
    }

    fn max_multi_csl_peers(&self) -> u8 {
        0
    }
}
