// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright WPAN Contributors 2024.

//! Non-cryptographic randomness for protocol timing decisions.

/// A synchronous source of non-cryptographic random words.
///
/// Takes `&self`; implementations use interior mutability for their state,
/// matching the single-context model of the rest of the contract. This is
/// only used for CSMA backoff jitter and must not be used for key material.
pub trait Rng {
    fn next_u32(&self) -> u32;

    /// A uniform value in `[0, bound)`. `bound` must be non-zero.
    fn next_bounded(&self, bound: u32) -> u32 {
        self.next_u32() % bound
    }
}
