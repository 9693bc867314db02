// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common types for the SoC clock and voltage-scaling driver.
//!
//! This crate works on both the host and embedded system, so it can be used in
//! host-side tests. It carries everything a caller or an embedding platform
//! needs to talk to `drv-clk-dvfs` without pulling in the driver itself: the
//! error codes, identifier types, register locations and the
//! [`RegisterPort`] through which every hardware access is made.

#![cfg_attr(not(test), no_std)]

use core::num::NonZeroUsize;

use num_derive::FromPrimitive;

mod secure;
pub use secure::{SecureOp, SecureRequest, SecureResponse, SECURE_CLK_GROUP};

/// Errors returned by clock, vote and channel operations.
///
/// These are encoded as non-zero `u32`s so they can be carried in a status
/// word (0 is success on the wire) and decoded again with
/// `num_traits::FromPrimitive`.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u32)]
pub enum ClkError {
    /// A bounded hardware-acknowledgment poll (mux switch, divider switch,
    /// voltage-channel ack, PLL lock, supply power-good) never observed the
    /// expected value.
    AckTimeout = 1,
    /// A voltage-channel write found the hardware timeout interrupt already
    /// raised before or during the handshake.
    InterruptedTimeout,
    /// A requested frequency exceeds the ceiling that applies while the
    /// low-temperature condition is signaled.
    LowTemperatureExceeded,
    /// A requested voltage tier exceeds the active maintenance override.
    FixedVoltageCeilingExceeded,
    /// A channel id, vote id or tier index is out of the configured range.
    InvalidChannelOrVote,
    /// The secure monitor returned a non-zero status.
    SecureChannelFailure,
    /// A node was asked for a rate it structurally cannot produce.
    InvalidRateRequest,
    /// A vote or clock with the same id or name is already registered.
    DuplicateRegistration,
    /// A clock name or id could not be resolved.
    NoSuchClock,
    /// `enable` was called on a node that has not been prepared.
    NotPrepared,
    /// A fixed-capacity table is full.
    TableFull,
    /// The operation has no meaning for this node variant.
    Unsupported,
}

/// Index of a node in the clock tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClockId(pub u16);

/// Consumer id of a voltage vote.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VoteId(pub u32);

/// Hardware voltage-arbitration channel number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub u8);

/// Shared-bus ("mediabus") domain number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DomainId(pub u8);

/// A register bank. The embedding platform maps each bank onto a base
/// address; the driver only ever deals in bank-relative offsets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bank(pub u8);

/// A single bit in a register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegBit {
    pub bank: Bank,
    pub offset: u32,
    pub bit: u8,
}

impl RegBit {
    pub const fn new(bank: Bank, offset: u32, bit: u8) -> Self {
        Self { bank, offset, bit }
    }

    pub const fn mask(&self) -> u32 {
        1 << self.bit
    }

    pub const fn is_set(&self, word: u32) -> bool {
        word & self.mask() != 0
    }
}

/// A contiguous field of `width` bits starting at bit `shift` of a register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegField {
    pub bank: Bank,
    pub offset: u32,
    pub shift: u8,
    pub width: u8,
}

impl RegField {
    pub const fn new(bank: Bank, offset: u32, shift: u8, width: u8) -> Self {
        Self {
            bank,
            offset,
            shift,
            width,
        }
    }

    /// Mask of the field, unshifted.
    pub const fn max(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1 << self.width) - 1
        }
    }

    /// Mask of the field in register position.
    pub const fn mask(&self) -> u32 {
        self.max() << self.shift
    }

    pub const fn extract(&self, word: u32) -> u32 {
        (word >> self.shift) & self.max()
    }

    pub const fn insert(&self, word: u32, value: u32) -> u32 {
        (word & !self.mask()) | ((value & self.max()) << self.shift)
    }

    /// Builds a write for a register that carries a write-enable mask in its
    /// upper 16 bits: only bits whose mask bit is set are updated, so no
    /// read-modify-write is needed.
    pub const fn masked_write(&self, value: u32) -> u32 {
        ((value & self.max()) << self.shift) | (self.mask() << 16)
    }
}

/// The I/O boundary of the driver, supplied by the embedding system.
///
/// Every register access, every secure-monitor round trip and every delay
/// goes through this trait, which is what makes the whole driver testable on
/// the host against a simulated register file.
pub trait RegisterPort {
    fn read32(&self, bank: Bank, offset: u32) -> u32;

    fn write32(&self, bank: Bank, offset: u32, value: u32);

    /// Performs a synchronous round trip to the secure monitor. The request
    /// and response layouts are an external contract; see [`SecureRequest`].
    fn secure_call(&self, request: &SecureRequest) -> SecureResponse;

    /// Busy-waits for roughly `us` microseconds.
    fn delay_us(&self, us: u32);

    /// Identity of the calling execution context (thread, CPU, task). Two
    /// calls from the same context must return the same value; calls from
    /// contexts that can run concurrently must not.
    fn context_id(&self) -> NonZeroUsize;

    /// Whether the surrounding power mode currently allows entering a
    /// low-power idle state. Voltage lowering only waits for completion when
    /// this is true.
    fn idle_allowed(&self) -> bool {
        true
    }
}
