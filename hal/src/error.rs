// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! Error codes shared by every layer of the link-layer engine.
//!
//! Synchronous preconditions surface `InvalidState`/`InvalidArgs` to the
//! caller with no side effect. Asynchronous outcomes are delivered through
//! completion callbacks as `Result<(), ErrorCode>`, exactly once per accepted
//! request, and are never converted to panics.

/// Errors returned by link-layer operations and completion callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    /// Operation failed for an unspecified hardware reason.
    Failed,
    /// Operation is not legal in the current state.
    InvalidState,
    /// A numeric argument is out of range.
    InvalidArgs,
    /// A PSDU claims inconsistent lengths or an unknown field encoding.
    Parse,
    /// Receive buffer exhaustion at the PHY layer.
    NoBufs,
    /// Frame was transmitted but no ACK arrived within the ACK timeout.
    NoAck,
    /// CCA declared the channel busy on all attempts.
    ChannelAccessFailure,
    /// The radio aborted the operation; the reason is opaque.
    Abort,
    /// The requested feature is not available on this radio.
    NotImplemented,
}
