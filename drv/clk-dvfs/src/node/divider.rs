// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integer dividers.
//!
//! A divisor `d` is stored in its field as `d - 1`, so a field of width `w`
//! covers divisors `1..=2^w`. Rates are always reported as
//! `parent_rate / d`, rounded down, and divisor selection is defined against
//! that same rounding so that asking for the rate a divider already produces
//! selects the divisor it already has.

use drv_clk_dvfs_api::{ClkError, ClockId, RegBit, RegField, RegisterPort};

use crate::hw::Hw;
use crate::trace::{trace, Trace};

/// Attempts at 1 µs each for a divider's done bit to clear.
pub const DIVIDER_DONE_POLL: u32 = 100;

#[derive(Copy, Clone, Debug)]
pub struct DividerDesc {
    pub field: RegField,
    /// Set by hardware while a new divisor is being applied.
    pub done: Option<RegBit>,
}

impl DividerDesc {
    pub const fn new(field: RegField) -> Self {
        Self { field, done: None }
    }

    pub const fn with_done(self, done: RegBit) -> Self {
        Self {
            done: Some(done),
            ..self
        }
    }

    pub const fn max_div(&self) -> u32 {
        self.field.max().saturating_add(1)
    }

    pub(crate) fn read<P: RegisterPort>(&self, hw: &Hw<'_, P>) -> u32 {
        hw.read_field(&self.field) + 1
    }

    pub(crate) fn write<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        clock: ClockId,
        div: u32,
        hiword: bool,
    ) -> Result<(), ClkError> {
        let div = div.clamp(1, self.max_div());
        hw.write_field(&self.field, div - 1, hiword);
        trace!(hw.trace, Trace::Divider { clock, div });

        if let Some(done) = &self.done {
            if !hw.poll(DIVIDER_DONE_POLL, 1, || !hw.bit(done)) {
                trace!(hw.trace, Trace::DividerAckTimeout(clock));
                return Err(ClkError::AckTimeout);
            }
        }
        Ok(())
    }
}

pub fn rate_for(parent_rate: u64, div: u32) -> u64 {
    parent_rate / u64::from(div.max(1))
}

/// Smallest divisor whose output does not exceed `target`, clamped to
/// `1..=max_div`.
pub fn divisor_round_up(parent_rate: u64, target: u64, max_div: u32) -> u32 {
    let d = (parent_rate / target.saturating_add(1)).saturating_add(1);
    d.clamp(1, u64::from(max_div.max(1))) as u32
}

/// Divisor whose output is nearest to `target`; on a tie, the one that does
/// not exceed it.
pub fn divisor_closest(parent_rate: u64, target: u64, max_div: u32) -> u32 {
    let up = divisor_round_up(parent_rate, target, max_div);
    if up <= 1 {
        return up;
    }
    let down = up - 1;
    let err_up = target.abs_diff(rate_for(parent_rate, up));
    let err_down = target.abs_diff(rate_for(parent_rate, down));
    if err_down < err_up {
        down
    } else {
        up
    }
}

pub fn divisor_for(
    parent_rate: u64,
    target: u64,
    max_div: u32,
    closest: bool,
) -> u32 {
    if closest {
        divisor_closest(parent_rate, target, max_div)
    } else {
        divisor_round_up(parent_rate, target, max_div)
    }
}

/// Whether `now` is a better approximation of `target` than `best`.
pub(crate) fn is_better(target: u64, now: u64, best: u64, closest: bool) -> bool {
    if closest {
        target.abs_diff(now) < target.abs_diff(best)
    } else {
        now <= target && now > best
    }
}
