// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format for clock requests to the secure monitor.
//!
//! The secure-side firmware decodes these words directly, so the layout here
//! must not change: a function id followed by four argument words on the way
//! in, a status word followed by four payload words on the way out, all
//! native-endian `u32`s with no padding.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::ClkError;

/// Operation group for clock services, carried in the upper half of the
/// function id.
pub const SECURE_CLK_GROUP: u32 = 0xc500;

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u16)]
pub enum SecureOp {
    /// args: `[clock, 0, 0, 0]`
    GateEnable = 1,
    /// args: `[clock, 0, 0, 0]`
    GateDisable = 2,
    /// args: `[clock, divisor, 0, 0]`
    DividerWrite = 3,
    /// args: `[clock, 0, 0, 0]`; payload\[0\] is the divisor.
    DividerRead = 4,
    /// args: `[pll, 0, 0, 0]`
    PllEnable = 5,
    /// args: `[pll, 0, 0, 0]`
    PllDisable = 6,
    /// args: `[pll, rate_khz, 0, 0]`
    PllSetRate = 7,
    /// args: `[pll, 0, 0, 0]`; payload\[0\] is the rate in kHz.
    PllGetRate = 8,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct SecureRequest {
    pub function_id: u32,
    pub args: [u32; 4],
}

impl SecureRequest {
    pub const fn new(op: SecureOp, args: [u32; 4]) -> Self {
        Self {
            function_id: (SECURE_CLK_GROUP << 16) | op as u32,
            args,
        }
    }

    /// Decodes the operation, returning `None` for a foreign group or an
    /// unknown operation.
    pub fn op(&self) -> Option<SecureOp> {
        if self.function_id >> 16 != SECURE_CLK_GROUP {
            return None;
        }
        SecureOp::from_u32(self.function_id & 0xffff)
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct SecureResponse {
    pub status: u32,
    pub payload: [u32; 4],
}

impl SecureResponse {
    pub const fn ok(payload: [u32; 4]) -> Self {
        Self { status: 0, payload }
    }

    /// Any non-zero status is a failure, whatever its value.
    pub fn check(self) -> Result<[u32; 4], ClkError> {
        if self.status == 0 {
            Ok(self.payload)
        } else {
            Err(ClkError::SecureChannelFailure)
        }
    }
}
