// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! IEEE 802.15.4 MAC frame parsing and construction.
//!
//! Frames are viewed as a PSDU: the octets handed to the PHY, up to 127 for
//! an 802.15.4 link. The stored length accounts for the 2-octet FCS even
//! though its bytes are owned by the PHY and never written here. All
//! multi-octet wire fields are little-endian.
//!
//! Parsing is strictly validated: every derived index checks that the
//! claimed frame length can hold the header, the auxiliary security header
//! and the footer, and reports `ErrorCode::Parse` otherwise.

use wpan_hal::radio::{RxFrame, TxFrame, FCS_SIZE};
use wpan_hal::ErrorCode;

// Frame Control Field, octets 0-1.
const FCF_SIZE: usize = 2;
const FCF_FRAME_TYPE_MASK: u16 = 7 << 0;
const FCF_SECURITY_ENABLED: u16 = 1 << 3;
const FCF_FRAME_PENDING: u16 = 1 << 4;
const FCF_ACK_REQUEST: u16 = 1 << 5;
const FCF_PANID_COMPRESSION: u16 = 1 << 6;
const FCF_SEQ_SUPPRESSION: u16 = 1 << 8;
const FCF_IE_PRESENT: u16 = 1 << 9;
const FCF_DST_ADDR_SHIFT: u16 = 10;
const FCF_VERSION_SHIFT: u16 = 12;
const FCF_SRC_ADDR_SHIFT: u16 = 14;
const FCF_ADDR_MODE_MASK: u16 = 0x3;

const SEQ_SIZE: usize = 1;
const PAN_ID_SIZE: usize = 2;

// Auxiliary security header.
const SECURITY_CONTROL_SIZE: usize = 1;
const FRAME_COUNTER_SIZE: usize = 4;
const SEC_LEVEL_MASK: u8 = 7 << 0;
const KEY_ID_MODE_SHIFT: u8 = 3;
const KEY_ID_MODE_MASK: u8 = 3 << KEY_ID_MODE_SHIFT;

// Header IEs (802.15.4-2015, 7.4.2).
const HEADER_IE_HEADER_SIZE: usize = 2;
const HEADER_IE_LEN_MASK: u16 = 0x7f;
const HEADER_IE_ID_SHIFT: u16 = 7;
const HEADER_IE_ID_MASK: u16 = 0xff << HEADER_IE_ID_SHIFT;

/// Element ID of the CSL Information Element.
pub const HEADER_IE_CSL: u8 = 0x1a;
/// Element ID of the Header Termination 2 IE (header IEs followed by
/// payload).
pub const HEADER_IE_TERMINATION_2: u8 = 0x7f;
/// CSL IE content: phase and period, both in ten-symbol units.
pub const CSL_IE_CONTENT_SIZE: usize = 4;

/// Broadcast short address.
pub const SHORT_ADDR_BROADCAST: u16 = 0xffff;
/// Short address value meaning "no short address assigned".
pub const SHORT_ADDR_INVALID: u16 = 0xfffe;

pub type PanId = u16;

/// MAC frame types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    Beacon,
    Data,
    Ack,
    MacCommand,
}

impl FrameType {
    fn from_fcf(fcf: u16) -> Result<FrameType, ErrorCode> {
        match fcf & FCF_FRAME_TYPE_MASK {
            0 => Ok(FrameType::Beacon),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Ack),
            3 => Ok(FrameType::MacCommand),
            _ => Err(ErrorCode::Parse),
        }
    }

    fn bits(self) -> u16 {
        match self {
            FrameType::Beacon => 0,
            FrameType::Data => 1,
            FrameType::Ack => 2,
            FrameType::MacCommand => 3,
        }
    }
}

/// Frame version (FCF bits 12-13).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameVersion {
    V2003,
    V2006,
    V2015,
}

impl FrameVersion {
    fn from_fcf(fcf: u16) -> Result<FrameVersion, ErrorCode> {
        match (fcf >> FCF_VERSION_SHIFT) & 0x3 {
            0 => Ok(FrameVersion::V2003),
            1 => Ok(FrameVersion::V2006),
            2 => Ok(FrameVersion::V2015),
            _ => Err(ErrorCode::Parse),
        }
    }

    fn bits(self) -> u16 {
        match self {
            FrameVersion::V2003 => 0,
            FrameVersion::V2006 => 1 << FCF_VERSION_SHIFT,
            FrameVersion::V2015 => 2 << FCF_VERSION_SHIFT,
        }
    }
}

/// Addressing mode of the destination or source field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressMode {
    None,
    Short,
    Extended,
}

impl AddressMode {
    fn from_bits(bits: u16) -> Result<AddressMode, ErrorCode> {
        match bits & FCF_ADDR_MODE_MASK {
            0 => Ok(AddressMode::None),
            2 => Ok(AddressMode::Short),
            3 => Ok(AddressMode::Extended),
            _ => Err(ErrorCode::Parse),
        }
    }

    fn bits(self) -> u16 {
        match self {
            AddressMode::None => 0,
            AddressMode::Short => 2,
            AddressMode::Extended => 3,
        }
    }

    fn size(self) -> usize {
        match self {
            AddressMode::None => 0,
            AddressMode::Short => 2,
            AddressMode::Extended => 8,
        }
    }
}

/// A MAC address of either flavor, or its absence.
///
/// Extended addresses are kept in wire order (little-endian on the air).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Address {
    None,
    Short(u16),
    Extended([u8; 8]),
}

impl Address {
    pub fn mode(&self) -> AddressMode {
        match self {
            Address::None => AddressMode::None,
            Address::Short(_) => AddressMode::Short,
            Address::Extended(_) => AddressMode::Extended,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Address::Short(SHORT_ADDR_BROADCAST))
    }

    /// Group (I/G) bit of an extended address; bit 0 of the first octet.
    pub fn is_group(&self) -> bool {
        match self {
            Address::Extended(ext) => ext[0] & 0x01 != 0,
            _ => false,
        }
    }

    /// Locally-administered (U/L) bit of an extended address; bit 1 of the
    /// first octet.
    pub fn is_locally_administered(&self) -> bool {
        match self {
            Address::Extended(ext) => ext[0] & 0x02 != 0,
            _ => false,
        }
    }
}

/// Security level (bits 0-2 of the Security Control octet).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityLevel {
    None,
    Mic32,
    Mic64,
    Mic128,
    Enc,
    EncMic32,
    EncMic64,
    EncMic128,
}

impl SecurityLevel {
    pub fn from_bits(bits: u8) -> SecurityLevel {
        match bits & SEC_LEVEL_MASK {
            0 => SecurityLevel::None,
            1 => SecurityLevel::Mic32,
            2 => SecurityLevel::Mic64,
            3 => SecurityLevel::Mic128,
            4 => SecurityLevel::Enc,
            5 => SecurityLevel::EncMic32,
            6 => SecurityLevel::EncMic64,
            _ => SecurityLevel::EncMic128,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            SecurityLevel::None => 0,
            SecurityLevel::Mic32 => 1,
            SecurityLevel::Mic64 => 2,
            SecurityLevel::Mic128 => 3,
            SecurityLevel::Enc => 4,
            SecurityLevel::EncMic32 => 5,
            SecurityLevel::EncMic64 => 6,
            SecurityLevel::EncMic128 => 7,
        }
    }

    /// MIC size in octets for this level.
    pub fn mic_len(self) -> usize {
        match self {
            SecurityLevel::None | SecurityLevel::Enc => 0,
            SecurityLevel::Mic32 | SecurityLevel::EncMic32 => 4,
            SecurityLevel::Mic64 | SecurityLevel::EncMic64 => 8,
            SecurityLevel::Mic128 | SecurityLevel::EncMic128 => 16,
        }
    }

    pub fn encryption_needed(self) -> bool {
        self.bits() >= 4
    }
}

/// Key identifier mode (bits 3-4 of the Security Control octet).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyIdMode {
    /// Key determined implicitly from the originator.
    Implicit,
    /// Key determined from a one-octet key index.
    Index,
    /// Four-octet key source plus key index.
    Source4Index,
    /// Eight-octet key source plus key index.
    Source8Index,
}

impl KeyIdMode {
    pub fn from_bits(bits: u8) -> KeyIdMode {
        match (bits & KEY_ID_MODE_MASK) >> KEY_ID_MODE_SHIFT {
            0 => KeyIdMode::Implicit,
            1 => KeyIdMode::Index,
            2 => KeyIdMode::Source4Index,
            _ => KeyIdMode::Source8Index,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            KeyIdMode::Implicit => 0,
            KeyIdMode::Index => 1 << KEY_ID_MODE_SHIFT,
            KeyIdMode::Source4Index => 2 << KEY_ID_MODE_SHIFT,
            KeyIdMode::Source8Index => 3 << KEY_ID_MODE_SHIFT,
        }
    }

    /// The mode as the plain 0..3 value used across the radio contract.
    pub fn raw(self) -> u8 {
        match self {
            KeyIdMode::Implicit => 0,
            KeyIdMode::Index => 1,
            KeyIdMode::Source4Index => 2,
            KeyIdMode::Source8Index => 3,
        }
    }

    /// Key source size in octets for this mode.
    pub fn key_source_len(self) -> usize {
        match self {
            KeyIdMode::Implicit | KeyIdMode::Index => 0,
            KeyIdMode::Source4Index => 4,
            KeyIdMode::Source8Index => 8,
        }
    }

    /// Whether a key index octet follows the key source.
    pub fn has_key_index(self) -> bool {
        !matches!(self, KeyIdMode::Implicit)
    }
}

/// Destination and source addressing of an outgoing frame.
#[derive(Copy, Clone, Debug)]
pub struct MacAddrs {
    pub dst_pan: Option<PanId>,
    pub dst: Address,
    pub src_pan: Option<PanId>,
    pub src: Address,
}

fn read_u16_le(psdu: &[u8], index: usize) -> Result<u16, ErrorCode> {
    let bytes = psdu
        .get(index..index + 2)
        .ok_or(ErrorCode::Parse)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32_le(psdu: &[u8], index: usize) -> Result<u32, ErrorCode> {
    let bytes = psdu
        .get(index..index + 4)
        .ok_or(ErrorCode::Parse)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read-only accessors over a PSDU.
///
/// Implemented for both transmit and receive frames; all index derivations
/// validate against the claimed frame length.
pub trait FrameRead {
    /// The PSDU octets, including the (unwritten) FCS slots at the end.
    fn psdu(&self) -> &[u8];

    fn fcf(&self) -> Result<u16, ErrorCode> {
        read_u16_le(self.psdu(), 0)
    }

    fn frame_type(&self) -> Result<FrameType, ErrorCode> {
        FrameType::from_fcf(self.fcf()?)
    }

    fn frame_version(&self) -> Result<FrameVersion, ErrorCode> {
        FrameVersion::from_fcf(self.fcf()?)
    }

    fn security_enabled(&self) -> bool {
        self.fcf().map_or(false, |fcf| fcf & FCF_SECURITY_ENABLED != 0)
    }

    fn frame_pending(&self) -> bool {
        self.fcf().map_or(false, |fcf| fcf & FCF_FRAME_PENDING != 0)
    }

    fn ack_request(&self) -> bool {
        self.fcf().map_or(false, |fcf| fcf & FCF_ACK_REQUEST != 0)
    }

    fn pan_id_compression(&self) -> bool {
        self.fcf()
            .map_or(false, |fcf| fcf & FCF_PANID_COMPRESSION != 0)
    }

    fn ie_present(&self) -> bool {
        self.fcf().map_or(false, |fcf| fcf & FCF_IE_PRESENT != 0)
    }

    /// Whether a sequence number octet is present. Only 2015 frames may
    /// suppress it.
    fn sequence_present(&self) -> bool {
        match (self.fcf(), self.frame_version()) {
            (Ok(fcf), Ok(FrameVersion::V2015)) => fcf & FCF_SEQ_SUPPRESSION == 0,
            (Ok(_), _) => true,
            _ => false,
        }
    }

    fn sequence(&self) -> Result<u8, ErrorCode> {
        if !self.sequence_present() {
            return Err(ErrorCode::Parse);
        }
        self.psdu().get(FCF_SIZE).copied().ok_or(ErrorCode::Parse)
    }

    fn dst_addr_mode(&self) -> Result<AddressMode, ErrorCode> {
        AddressMode::from_bits(self.fcf()? >> FCF_DST_ADDR_SHIFT)
    }

    fn src_addr_mode(&self) -> Result<AddressMode, ErrorCode> {
        AddressMode::from_bits(self.fcf()? >> FCF_SRC_ADDR_SHIFT)
    }

    fn dst_pan_id_index(&self) -> Result<Option<usize>, ErrorCode> {
        let index = FCF_SIZE + if self.sequence_present() { SEQ_SIZE } else { 0 };
        Ok(match self.dst_addr_mode()? {
            AddressMode::None => None,
            _ => Some(index),
        })
    }

    fn dst_addr_index(&self) -> Result<Option<usize>, ErrorCode> {
        let base = FCF_SIZE + if self.sequence_present() { SEQ_SIZE } else { 0 };
        Ok(match self.dst_addr_mode()? {
            AddressMode::None => None,
            _ => Some(base + PAN_ID_SIZE),
        })
    }

    fn src_pan_id_index(&self) -> Result<Option<usize>, ErrorCode> {
        let dst_mode = self.dst_addr_mode()?;
        let src_mode = self.src_addr_mode()?;
        if src_mode == AddressMode::None || self.pan_id_compression() {
            return Ok(None);
        }
        let mut index = FCF_SIZE + if self.sequence_present() { SEQ_SIZE } else { 0 };
        if dst_mode != AddressMode::None {
            index += PAN_ID_SIZE + dst_mode.size();
        }
        Ok(Some(index))
    }

    fn src_addr_index(&self) -> Result<Option<usize>, ErrorCode> {
        let dst_mode = self.dst_addr_mode()?;
        let src_mode = self.src_addr_mode()?;
        if src_mode == AddressMode::None {
            return Ok(None);
        }
        let mut index = FCF_SIZE + if self.sequence_present() { SEQ_SIZE } else { 0 };
        if dst_mode != AddressMode::None {
            index += PAN_ID_SIZE + dst_mode.size();
        }
        if !self.pan_id_compression() {
            index += PAN_ID_SIZE;
        }
        Ok(Some(index))
    }

    /// Index of the auxiliary security header, when security is enabled.
    fn security_header_index(&self) -> Result<Option<usize>, ErrorCode> {
        if !self.security_enabled() {
            return Ok(None);
        }
        let dst_mode = self.dst_addr_mode()?;
        let src_mode = self.src_addr_mode()?;
        let mut index = FCF_SIZE + if self.sequence_present() { SEQ_SIZE } else { 0 };
        if dst_mode != AddressMode::None {
            index += PAN_ID_SIZE + dst_mode.size();
        }
        if src_mode != AddressMode::None {
            if !self.pan_id_compression() {
                index += PAN_ID_SIZE;
            }
            index += src_mode.size();
        }
        Ok(Some(index))
    }

    fn security_level(&self) -> Result<SecurityLevel, ErrorCode> {
        let index = self.security_header_index()?.ok_or(ErrorCode::Parse)?;
        let control = *self.psdu().get(index).ok_or(ErrorCode::Parse)?;
        Ok(SecurityLevel::from_bits(control))
    }

    fn key_id_mode(&self) -> Result<KeyIdMode, ErrorCode> {
        let index = self.security_header_index()?.ok_or(ErrorCode::Parse)?;
        let control = *self.psdu().get(index).ok_or(ErrorCode::Parse)?;
        Ok(KeyIdMode::from_bits(control))
    }

    fn frame_counter(&self) -> Result<u32, ErrorCode> {
        let index = self.security_header_index()?.ok_or(ErrorCode::Parse)?;
        read_u32_le(self.psdu(), index + SECURITY_CONTROL_SIZE)
    }

    /// The key source octets, empty for modes without one.
    fn key_source(&self) -> Result<&[u8], ErrorCode> {
        let index = self.security_header_index()?.ok_or(ErrorCode::Parse)?;
        let len = self.key_id_mode()?.key_source_len();
        let start = index + SECURITY_CONTROL_SIZE + FRAME_COUNTER_SIZE;
        self.psdu().get(start..start + len).ok_or(ErrorCode::Parse)
    }

    fn key_id(&self) -> Result<u8, ErrorCode> {
        let mode = self.key_id_mode()?;
        if !mode.has_key_index() {
            return Err(ErrorCode::Parse);
        }
        let index = self.security_header_index()?.ok_or(ErrorCode::Parse)?;
        let key_index =
            index + SECURITY_CONTROL_SIZE + FRAME_COUNTER_SIZE + mode.key_source_len();
        self.psdu().get(key_index).copied().ok_or(ErrorCode::Parse)
    }

    /// Total auxiliary security header size, zero when security is off.
    fn security_header_len(&self) -> Result<usize, ErrorCode> {
        if !self.security_enabled() {
            return Ok(0);
        }
        let mode = self.key_id_mode()?;
        Ok(SECURITY_CONTROL_SIZE
            + FRAME_COUNTER_SIZE
            + mode.key_source_len()
            + usize::from(mode.has_key_index()))
    }

    fn mic_len(&self) -> Result<usize, ErrorCode> {
        if !self.security_enabled() {
            return Ok(0);
        }
        Ok(self.security_level()?.mic_len())
    }

    /// MIC plus FCS.
    fn footer_len(&self) -> Result<usize, ErrorCode> {
        Ok(self.mic_len()? + FCS_SIZE)
    }

    /// Index of the first header IE descriptor, when the IE bit is set.
    fn header_ie_start(&self) -> Result<Option<usize>, ErrorCode> {
        if !self.ie_present() {
            return Ok(None);
        }
        let mut index = FCF_SIZE + if self.sequence_present() { SEQ_SIZE } else { 0 };
        let dst_mode = self.dst_addr_mode()?;
        let src_mode = self.src_addr_mode()?;
        if dst_mode != AddressMode::None {
            index += PAN_ID_SIZE + dst_mode.size();
        }
        if src_mode != AddressMode::None {
            if !self.pan_id_compression() {
                index += PAN_ID_SIZE;
            }
            index += src_mode.size();
        }
        index += self.security_header_len()?;
        Ok(Some(index))
    }

    /// Offset of the descriptor of the header IE with `element_id`.
    fn header_ie(&self, element_id: u8) -> Result<Option<usize>, ErrorCode> {
        let Some(mut index) = self.header_ie_start()? else {
            return Ok(None);
        };
        let end = self.psdu().len().saturating_sub(self.footer_len()?);
        while index + HEADER_IE_HEADER_SIZE <= end {
            let descriptor = read_u16_le(self.psdu(), index)?;
            let id = ((descriptor & HEADER_IE_ID_MASK) >> HEADER_IE_ID_SHIFT) as u8;
            let content_len = (descriptor & HEADER_IE_LEN_MASK) as usize;
            if id == element_id {
                return Ok(Some(index));
            }
            if id == HEADER_IE_TERMINATION_2 {
                break;
            }
            index += HEADER_IE_HEADER_SIZE + content_len;
        }
        Ok(None)
    }

    /// Index of the MAC payload.
    fn payload_index(&self) -> Result<usize, ErrorCode> {
        let mut index = FCF_SIZE + if self.sequence_present() { SEQ_SIZE } else { 0 };
        let dst_mode = self.dst_addr_mode()?;
        let src_mode = self.src_addr_mode()?;
        if dst_mode != AddressMode::None {
            index += PAN_ID_SIZE + dst_mode.size();
        }
        if src_mode != AddressMode::None {
            if !self.pan_id_compression() {
                index += PAN_ID_SIZE;
            }
            index += src_mode.size();
        }
        index += self.security_header_len()?;

        if self.ie_present() {
            let end = self.psdu().len().saturating_sub(self.footer_len()?);
            while index + HEADER_IE_HEADER_SIZE <= end {
                let descriptor = read_u16_le(self.psdu(), index)?;
                let id = ((descriptor & HEADER_IE_ID_MASK) >> HEADER_IE_ID_SHIFT) as u8;
                let content_len = (descriptor & HEADER_IE_LEN_MASK) as usize;
                index += HEADER_IE_HEADER_SIZE + content_len;
                if id == HEADER_IE_TERMINATION_2 {
                    break;
                }
            }
        }

        Ok(index)
    }

    fn header_len(&self) -> Result<usize, ErrorCode> {
        self.payload_index()
    }

    fn payload_len(&self) -> Result<usize, ErrorCode> {
        let header = self.payload_index()?;
        let footer = self.footer_len()?;
        self.psdu()
            .len()
            .checked_sub(header + footer)
            .ok_or(ErrorCode::Parse)
    }

    fn payload(&self) -> Result<&[u8], ErrorCode> {
        let start = self.payload_index()?;
        let len = self.payload_len()?;
        self.psdu().get(start..start + len).ok_or(ErrorCode::Parse)
    }

    fn dst_pan_id(&self) -> Result<Option<PanId>, ErrorCode> {
        match self.dst_pan_id_index()? {
            None => Ok(None),
            Some(index) => read_u16_le(self.psdu(), index).map(Some),
        }
    }

    fn src_pan_id(&self) -> Result<Option<PanId>, ErrorCode> {
        match self.src_pan_id_index()? {
            None => Ok(None),
            Some(index) => read_u16_le(self.psdu(), index).map(Some),
        }
    }

    fn dst_addr(&self) -> Result<Address, ErrorCode> {
        self.read_addr(self.dst_addr_mode()?, self.dst_addr_index()?)
    }

    fn src_addr(&self) -> Result<Address, ErrorCode> {
        self.read_addr(self.src_addr_mode()?, self.src_addr_index()?)
    }

    #[doc(hidden)]
    fn read_addr(
        &self,
        mode: AddressMode,
        index: Option<usize>,
    ) -> Result<Address, ErrorCode> {
        match (mode, index) {
            (AddressMode::None, _) | (_, None) => Ok(Address::None),
            (AddressMode::Short, Some(index)) => {
                Ok(Address::Short(read_u16_le(self.psdu(), index)?))
            }
            (AddressMode::Extended, Some(index)) => {
                let bytes = self
                    .psdu()
                    .get(index..index + 8)
                    .ok_or(ErrorCode::Parse)?;
                let mut ext = [0; 8];
                ext.copy_from_slice(bytes);
                Ok(Address::Extended(ext))
            }
        }
    }

    /// Checks that every claimed field fits inside the PSDU.
    fn validate_psdu(&self) -> Result<(), ErrorCode> {
        let len = self.psdu().len();
        if len < FCF_SIZE + FCS_SIZE {
            return Err(ErrorCode::Parse);
        }
        self.frame_type()?;
        self.frame_version()?;
        self.dst_addr()?;
        self.src_addr()?;
        if self.security_enabled() {
            self.security_level()?;
            self.frame_counter()?;
            self.key_source()?;
            if self.key_id_mode()?.has_key_index() {
                self.key_id()?;
            }
        }
        let header = self.payload_index()?;
        let footer = self.footer_len()?;
        if header + footer > len {
            return Err(ErrorCode::Parse);
        }
        Ok(())
    }
}

impl FrameRead for TxFrame {
    fn psdu(&self) -> &[u8] {
        TxFrame::psdu(self)
    }
}

impl FrameRead for RxFrame<'_> {
    fn psdu(&self) -> &[u8] {
        self.psdu
    }
}

/// Mutating accessors over an outgoing frame.
pub trait FrameWrite: FrameRead {
    fn frame_mut(&mut self) -> &mut TxFrame;

    /// Writes the MAC header and auxiliary security header skeleton. The
    /// sequence number, frame counter and key index start at zero and are
    /// stamped later; the resulting frame length accounts for the MIC and
    /// the FCS.
    fn init_mac_header(
        &mut self,
        frame_type: FrameType,
        version: FrameVersion,
        addrs: &MacAddrs,
        security_level: SecurityLevel,
        key_id_mode: KeyIdMode,
    ) -> Result<(), ErrorCode> {
        let mut fcf = frame_type.bits() | version.bits();
        fcf |= addrs.dst.mode().bits() << FCF_DST_ADDR_SHIFT;
        fcf |= addrs.src.mode().bits() << FCF_SRC_ADDR_SHIFT;

        let compress = match (addrs.dst_pan, addrs.src_pan) {
            (Some(dst), Some(src)) => dst == src,
            // A source address with no PAN of its own rides on the
            // destination PAN.
            (Some(_), None) => addrs.src.mode() != AddressMode::None,
            _ => false,
        };
        if compress {
            fcf |= FCF_PANID_COMPRESSION;
        }
        if security_level != SecurityLevel::None {
            fcf |= FCF_SECURITY_ENABLED;
        }

        let mic_len = security_level.mic_len();

        {
            let frame = self.frame_mut();
            let mut index = 0;
            let psdu = frame.psdu_mut();

            if psdu.len() < FCF_SIZE + SEQ_SIZE {
                return Err(ErrorCode::NoBufs);
            }
            psdu[0..2].copy_from_slice(&fcf.to_le_bytes());
            index += FCF_SIZE;
            psdu[index] = 0; // sequence
            index += SEQ_SIZE;

            let mut write = |bytes: &[u8], index: &mut usize| -> Result<(), ErrorCode> {
                let end = *index + bytes.len();
                if end > psdu.len() {
                    return Err(ErrorCode::NoBufs);
                }
                psdu[*index..end].copy_from_slice(bytes);
                *index = end;
                Ok(())
            };

            if addrs.dst.mode() != AddressMode::None {
                let pan = addrs.dst_pan.ok_or(ErrorCode::InvalidArgs)?;
                write(&pan.to_le_bytes(), &mut index)?;
                match addrs.dst {
                    Address::Short(short) => write(&short.to_le_bytes(), &mut index)?,
                    Address::Extended(ext) => write(&ext, &mut index)?,
                    Address::None => {}
                }
            }

            if addrs.src.mode() != AddressMode::None {
                if !compress {
                    let pan = addrs.src_pan.or(addrs.dst_pan).ok_or(ErrorCode::InvalidArgs)?;
                    write(&pan.to_le_bytes(), &mut index)?;
                }
                match addrs.src {
                    Address::Short(short) => write(&short.to_le_bytes(), &mut index)?,
                    Address::Extended(ext) => write(&ext, &mut index)?,
                    Address::None => {}
                }
            }

            if security_level != SecurityLevel::None {
                write(&[security_level.bits() | key_id_mode.bits()], &mut index)?;
                write(&0u32.to_le_bytes(), &mut index)?;
                write(&[0u8; 8][..key_id_mode.key_source_len()], &mut index)?;
                if key_id_mode.has_key_index() {
                    write(&[0], &mut index)?;
                }
            }

            if index + mic_len + FCS_SIZE > psdu.len() {
                return Err(ErrorCode::NoBufs);
            }
            frame.set_len(index + mic_len + FCS_SIZE);
            frame.info.is_security_processed = false;
            frame.info.is_header_updated = false;
        }
        Ok(())
    }

    fn set_sequence(&mut self, sequence: u8) {
        if self.sequence_present() {
            self.frame_mut().psdu_mut()[FCF_SIZE] = sequence;
        }
    }

    fn set_fcf_bit(&mut self, bit: u16, value: bool) {
        let Ok(mut fcf) = self.fcf() else { return };
        if value {
            fcf |= bit;
        } else {
            fcf &= !bit;
        }
        self.frame_mut().psdu_mut()[0..2].copy_from_slice(&fcf.to_le_bytes());
    }

    fn set_ack_request(&mut self, ack_request: bool) {
        self.set_fcf_bit(FCF_ACK_REQUEST, ack_request);
    }

    fn set_frame_pending(&mut self, frame_pending: bool) {
        self.set_fcf_bit(FCF_FRAME_PENDING, frame_pending);
    }

    fn set_frame_counter(&mut self, frame_counter: u32) -> Result<(), ErrorCode> {
        let index = self.security_header_index()?.ok_or(ErrorCode::Parse)?;
        let start = index + SECURITY_CONTROL_SIZE;
        if start + FRAME_COUNTER_SIZE > self.psdu().len() {
            return Err(ErrorCode::Parse);
        }
        self.frame_mut().psdu_mut()[start..start + FRAME_COUNTER_SIZE]
            .copy_from_slice(&frame_counter.to_le_bytes());
        Ok(())
    }

    fn set_key_id(&mut self, key_id: u8) -> Result<(), ErrorCode> {
        let mode = self.key_id_mode()?;
        if !mode.has_key_index() {
            return Err(ErrorCode::Parse);
        }
        let index = self.security_header_index()?.ok_or(ErrorCode::Parse)?
            + SECURITY_CONTROL_SIZE
            + FRAME_COUNTER_SIZE
            + mode.key_source_len();
        if index >= self.psdu().len() {
            return Err(ErrorCode::Parse);
        }
        self.frame_mut().psdu_mut()[index] = key_id;
        Ok(())
    }

    fn set_key_source(&mut self, key_source: &[u8]) -> Result<(), ErrorCode> {
        let mode = self.key_id_mode()?;
        if key_source.len() != mode.key_source_len() {
            return Err(ErrorCode::InvalidArgs);
        }
        let start = self.security_header_index()?.ok_or(ErrorCode::Parse)?
            + SECURITY_CONTROL_SIZE
            + FRAME_COUNTER_SIZE;
        self.frame_mut().psdu_mut()[start..start + key_source.len()]
            .copy_from_slice(key_source);
        Ok(())
    }

    /// Appends a header IE with zeroed content at the current end of the
    /// header. Must run before any payload is appended.
    fn append_header_ie(&mut self, element_id: u8, content_len: usize) -> Result<(), ErrorCode> {
        let insert_at = self.psdu().len() - self.footer_len()?;
        let descriptor: u16 =
            (content_len as u16 & HEADER_IE_LEN_MASK) | ((element_id as u16) << HEADER_IE_ID_SHIFT);
        let total = HEADER_IE_HEADER_SIZE + content_len;
        {
            let frame = self.frame_mut();
            let len = frame.len();
            if len + total > frame.mtu() {
                return Err(ErrorCode::NoBufs);
            }
            let psdu = frame.psdu_mut();
            psdu[insert_at..insert_at + 2].copy_from_slice(&descriptor.to_le_bytes());
            psdu[insert_at + 2..insert_at + total].fill(0);
            frame.set_len(len + total);
        }
        self.set_fcf_bit(FCF_IE_PRESENT, true);
        Ok(())
    }

    /// Appends an empty CSL IE followed by a Header Termination 2 IE and
    /// flags the frame so the phase gets filled in right before the frame
    /// goes on air.
    fn append_csl_header_ie(&mut self) -> Result<(), ErrorCode> {
        self.append_header_ie(HEADER_IE_CSL, CSL_IE_CONTENT_SIZE)?;
        self.append_header_ie(HEADER_IE_TERMINATION_2, 0)?;
        self.frame_mut().info.csl_ie_present = true;
        Ok(())
    }

    /// Rewrites the CSL IE content. Legal after the header has been fixed;
    /// this is the late-phase update used on CSL transmissions.
    fn set_csl_ie(&mut self, period: u16, phase: u16) -> Result<(), ErrorCode> {
        let Some(descriptor) = self.header_ie(HEADER_IE_CSL)? else {
            return Err(ErrorCode::Parse);
        };
        let content = descriptor + HEADER_IE_HEADER_SIZE;
        if content + CSL_IE_CONTENT_SIZE > self.psdu().len() {
            return Err(ErrorCode::Parse);
        }
        let psdu = self.frame_mut().psdu_mut();
        psdu[content..content + 2].copy_from_slice(&phase.to_le_bytes());
        psdu[content + 2..content + 4].copy_from_slice(&period.to_le_bytes());
        Ok(())
    }

    fn append_payload(&mut self, payload: &[u8]) -> Result<(), ErrorCode> {
        let insert_at = self.psdu().len() - self.footer_len()?;
        let frame = self.frame_mut();
        let len = frame.len();
        if len + payload.len() > frame.mtu() {
            return Err(ErrorCode::NoBufs);
        }
        let psdu = frame.psdu_mut();
        // Shift the MIC/FCS slots out of the way conceptually: they carry no
        // data yet, so the payload simply lands where the footer began.
        psdu[insert_at..insert_at + payload.len()].copy_from_slice(payload);
        frame.set_len(len + payload.len());
        Ok(())
    }

    /// Applies CCM* transmit security in place: the header is
    /// authenticated, the payload is encrypted for levels >= 4, and the MIC
    /// lands between payload and FCS. `ext_src` is the canonical (big
    /// endian) extended source address used in the nonce.
    fn process_transmit_aes_ccm(&mut self, ext_src: &[u8; 8]) -> Result<(), ErrorCode> {
        use crate::security;

        if !self.security_enabled() {
            return Ok(());
        }
        let level = self.security_level()?;
        if level == SecurityLevel::None {
            return Ok(());
        }

        let frame_counter = self.frame_counter()?;
        let mic_len = level.mic_len();
        let header_len = self.payload_index()?;
        let payload_len = self.payload_len()?;

        let nonce = security::ccm_nonce(ext_src, frame_counter, level);
        let frame = self.frame_mut();
        let key = frame
            .info
            .aes_key
            .as_ref()
            .and_then(|key| key.as_raw())
            .copied()
            .ok_or(ErrorCode::InvalidState)?;

        let secured_end = header_len + payload_len + mic_len;
        security::ccm_star_transmit(
            &key,
            &nonce,
            &mut frame.psdu_mut()[..secured_end],
            header_len,
            payload_len,
            mic_len,
            level.encryption_needed(),
        )?;
        frame.info.is_security_processed = true;
        Ok(())
    }
}

impl FrameWrite for TxFrame {
    fn frame_mut(&mut self) -> &mut TxFrame {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpan_hal::radio::{RadioType, MAX_PSDU_LEN};

    fn data_frame(security: bool) -> TxFrame {
        let mut frame = TxFrame::new(RadioType::Ieee802154, MAX_PSDU_LEN);
        let addrs = MacAddrs {
            dst_pan: Some(0xface),
            dst: Address::Short(0x1234),
            src_pan: Some(0xface),
            src: Address::Extended([0x10, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]),
        };
        let (level, mode) = if security {
            (SecurityLevel::EncMic32, KeyIdMode::Index)
        } else {
            (SecurityLevel::None, KeyIdMode::Implicit)
        };
        frame
            .init_mac_header(FrameType::Data, FrameVersion::V2006, &addrs, level, mode)
            .unwrap();
        frame
    }

    #[test]
    fn header_round_trip() {
        let mut frame = data_frame(false);
        frame.set_sequence(0x5a);
        frame.set_ack_request(true);
        frame.append_payload(&[1, 2, 3]).unwrap();

        assert_eq!(frame.frame_type().unwrap(), FrameType::Data);
        assert_eq!(frame.frame_version().unwrap(), FrameVersion::V2006);
        assert_eq!(frame.sequence().unwrap(), 0x5a);
        assert!(frame.ack_request());
        assert!(frame.pan_id_compression());
        assert_eq!(frame.dst_pan_id().unwrap(), Some(0xface));
        assert_eq!(frame.dst_addr().unwrap(), Address::Short(0x1234));
        assert_eq!(
            frame.src_addr().unwrap(),
            Address::Extended([0x10, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
        );
        assert_eq!(frame.payload().unwrap(), &[1, 2, 3]);
        frame.validate_psdu().unwrap();

        // Length invariant: header + payload + footer is the whole PSDU.
        assert_eq!(
            frame.header_len().unwrap() + frame.payload_len().unwrap()
                + frame.footer_len().unwrap(),
            frame.psdu().len()
        );
    }

    #[test]
    fn rebuild_from_accessors_matches() {
        let mut frame = data_frame(true);
        frame.set_sequence(7);
        frame.set_frame_counter(0xdead_beef).unwrap();
        frame.set_key_id(3).unwrap();
        frame.append_payload(b"payload").unwrap();

        let mut rebuilt = TxFrame::new(RadioType::Ieee802154, MAX_PSDU_LEN);
        let addrs = MacAddrs {
            dst_pan: frame.dst_pan_id().unwrap(),
            dst: frame.dst_addr().unwrap(),
            src_pan: frame.src_pan_id().unwrap(),
            src: frame.src_addr().unwrap(),
        };
        rebuilt
            .init_mac_header(
                frame.frame_type().unwrap(),
                frame.frame_version().unwrap(),
                &addrs,
                frame.security_level().unwrap(),
                frame.key_id_mode().unwrap(),
            )
            .unwrap();
        rebuilt.set_sequence(frame.sequence().unwrap());
        rebuilt
            .set_frame_counter(frame.frame_counter().unwrap())
            .unwrap();
        rebuilt.set_key_id(frame.key_id().unwrap()).unwrap();
        rebuilt.append_payload(frame.payload().unwrap()).unwrap();

        assert_eq!(rebuilt.psdu(), frame.psdu());
    }

    #[test]
    fn security_header_sizes_follow_key_id_mode() {
        for (mode, key_source_len, has_index) in [
            (KeyIdMode::Implicit, 0, false),
            (KeyIdMode::Index, 0, true),
            (KeyIdMode::Source4Index, 4, true),
            (KeyIdMode::Source8Index, 8, true),
        ] {
            assert_eq!(mode.key_source_len(), key_source_len);
            assert_eq!(mode.has_key_index(), has_index);
        }

        let mut frame = TxFrame::new(RadioType::Ieee802154, MAX_PSDU_LEN);
        let addrs = MacAddrs {
            dst_pan: Some(1),
            dst: Address::Short(2),
            src_pan: Some(1),
            src: Address::Short(3),
        };
        frame
            .init_mac_header(
                FrameType::Data,
                FrameVersion::V2006,
                &addrs,
                SecurityLevel::EncMic64,
                KeyIdMode::Source4Index,
            )
            .unwrap();
        frame.set_key_source(&[9, 8, 7, 6]).unwrap();
        assert_eq!(frame.key_source().unwrap(), &[9, 8, 7, 6]);
        assert_eq!(frame.mic_len().unwrap(), 8);
        // control + counter + source + index
        assert_eq!(frame.security_header_len().unwrap(), 1 + 4 + 4 + 1);
    }

    #[test]
    fn mic_sizes_follow_security_level() {
        let sizes: [(SecurityLevel, usize); 8] = [
            (SecurityLevel::None, 0),
            (SecurityLevel::Mic32, 4),
            (SecurityLevel::Mic64, 8),
            (SecurityLevel::Mic128, 16),
            (SecurityLevel::Enc, 0),
            (SecurityLevel::EncMic32, 4),
            (SecurityLevel::EncMic64, 8),
            (SecurityLevel::EncMic128, 16),
        ];
        for (level, size) in sizes {
            assert_eq!(level.mic_len(), size);
        }
    }

    #[test]
    fn truncated_psdu_is_a_parse_error() {
        let frame = data_frame(true);
        let short = &frame.psdu()[..frame.psdu().len() - 8];
        let rx = RxFrame {
            psdu: short,
            channel: 11,
            info: Default::default(),
        };
        assert_eq!(rx.validate_psdu(), Err(ErrorCode::Parse));
    }

    #[test]
    fn minimum_ack_parses() {
        // FCF (type ack, v2006) + seq + FCS slots: five octets.
        let psdu = [0x02, 0x10, 0x7b, 0x00, 0x00];
        let rx = RxFrame {
            psdu: &psdu,
            channel: 11,
            info: Default::default(),
        };
        rx.validate_psdu().unwrap();
        assert_eq!(rx.frame_type().unwrap(), FrameType::Ack);
        assert_eq!(rx.sequence().unwrap(), 0x7b);
        assert_eq!(rx.payload_len().unwrap(), 0);
    }

    #[test]
    fn empty_psdu_is_rejected() {
        let rx = RxFrame {
            psdu: &[],
            channel: 11,
            info: Default::default(),
        };
        assert_eq!(rx.validate_psdu(), Err(ErrorCode::Parse));
    }

    #[test]
    fn csl_ie_rewrite_after_header_fixed() {
        let mut frame = TxFrame::new(RadioType::Ieee802154, MAX_PSDU_LEN);
        let addrs = MacAddrs {
            dst_pan: Some(0xface),
            dst: Address::Short(0x0001),
            src_pan: Some(0xface),
            src: Address::Short(0x0002),
        };
        frame
            .init_mac_header(
                FrameType::Data,
                FrameVersion::V2015,
                &addrs,
                SecurityLevel::None,
                KeyIdMode::Implicit,
            )
            .unwrap();
        frame.append_csl_header_ie().unwrap();
        frame.append_payload(&[0xaa; 5]).unwrap();
        assert!(frame.info.csl_ie_present);

        frame.set_csl_ie(3125, 642).unwrap();
        let descriptor = frame.header_ie(HEADER_IE_CSL).unwrap().unwrap();
        let content = &frame.psdu()[descriptor + 2..descriptor + 6];
        assert_eq!(content, &[0x82, 0x02, 0x35, 0x0c]);

        // The payload sits after the termination IE and is undisturbed.
        assert_eq!(frame.payload().unwrap(), &[0xaa; 5]);
        frame.validate_psdu().unwrap();
    }

    #[test]
    fn broadcast_and_invalid_short_addresses() {
        assert!(Address::Short(SHORT_ADDR_BROADCAST).is_broadcast());
        assert!(!Address::Short(SHORT_ADDR_INVALID).is_broadcast());
        let group = Address::Extended([0x01, 0, 0, 0, 0, 0, 0, 0]);
        let local = Address::Extended([0x02, 0, 0, 0, 0, 0, 0, 0]);
        assert!(group.is_group());
        assert!(!group.is_locally_administered());
        assert!(local.is_locally_administered());
    }
}
