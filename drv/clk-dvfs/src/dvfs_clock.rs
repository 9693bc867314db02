// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DVFS clock nodes.
//!
//! A DVFS node sits in front of the clock that actually produces its rate
//! (its parent, usually a divider chain or a fast-switch clock) and owns a
//! vote. A rate change is sequenced against the vote: going faster raises
//! the vote and waits before the frequency moves; going slower moves the
//! frequency first and then lowers the vote without waiting.

use drv_clk_dvfs_api::{ClkError, ClockId, RegisterPort, VoteId};

use crate::registry::VoteKey;
use crate::trace::{trace, Trace};
use crate::ClkDvfs;

#[derive(Copy, Clone, Debug)]
pub struct DvfsClockDesc {
    pub vote: VoteId,
    /// Highest rate supported at each tier, ascending.
    pub rates: &'static [u64],
    /// Highest rate allowed while the low-temperature condition holds.
    pub low_temp_max: Option<u64>,
}

impl DvfsClockDesc {
    pub const fn new(vote: VoteId, rates: &'static [u64]) -> Self {
        Self {
            vote,
            rates,
            low_temp_max: None,
        }
    }

    pub const fn with_low_temp_max(self, rate: u64) -> Self {
        Self {
            low_temp_max: Some(rate),
            ..self
        }
    }

    /// Lowest tier that supports `rate`.
    pub fn tier_for(&self, rate: u64) -> Option<u8> {
        self.rates
            .iter()
            .position(|&max| rate <= max)
            .map(|t| t as u8)
    }
}

impl<P: RegisterPort> ClkDvfs<P> {
    pub(crate) fn set_dvfs_rate(
        &self,
        id: ClockId,
        dvfs: &DvfsClockDesc,
        rate: u64,
    ) -> Result<(), ClkError> {
        // Held across both steps; the vote calls below re-enter it.
        let _vote_lock = self.dvfs.lock(self.port.context_id());

        if self.is_low_temperature() && dvfs.low_temp_max.is_some_and(|m| rate > m)
        {
            return Err(ClkError::LowTemperatureExceeded);
        }
        let tier = dvfs.tier_for(rate).ok_or(ClkError::InvalidRateRequest)?;

        let hw = self.hw();
        let (target, current) = {
            let mut st = self.tree.lock();
            let i = usize::from(id.0);
            let live = match self.tree.friend(&mut st, id)? {
                Some(f) => self.tree.enable_count(&st, f) > 0,
                None => true,
            };
            if !live {
                st[i].pending = Some(rate);
                trace!(self.trace, Trace::DvfsPending { clock: id, rate });
                return Ok(());
            }
            let target = self
                .tree
                .parent(&hw, &mut st, id)?
                .ok_or(ClkError::NoSuchClock)?;
            (target, self.tree.rate(&hw, &mut st, target)?)
        };

        if rate > current {
            // Takes the vote lock again on this same context.
            self.set_voltage(VoteKey::Id(dvfs.vote), tier)?;
            self.with_tree(|hw, st| self.tree.set_rate(hw, st, target, rate))?;
        } else {
            self.with_tree(|hw, st| self.tree.set_rate(hw, st, target, rate))?;
            self.set_voltage_nowait(VoteKey::Id(dvfs.vote), tier)?;
        }

        self.with_tree(|hw, st| {
            st[usize::from(id.0)].pending = None;
            self.tree.rate(hw, st, id).map(|_| ())
        })
    }
}
