// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Glitch-free profile switching.
//!
//! A fast-switch clock is a divider behind a source mux, fed by up to five
//! fixed operating points ("profiles"). Moving between profiles may need a
//! new divisor, a new source PLL, or both, and doing those two writes in
//! either order can briefly put the output above both the old and the new
//! rate. The engine avoids that by first parking the divider on a
//! transitional value that is safe for both sources, then switching the
//! source, then writing the final divisor.
//!
//! While prepared, the engine holds one prepare+enable reference on the PLL
//! its mux currently selects.

use drv_clk_dvfs_api::{ClkError, ClockId, RegField, RegisterPort};

use crate::hw::Hw;
use crate::node::mux::wait_ack;
use crate::node::{ClockTree, GateDesc, NodeFlags, NodeStates};
use crate::trace::{trace, Trace};

pub const MAX_PROFILES: usize = 5;

/// Settle time after each step of a switch.
pub const FAST_SWITCH_PAUSE_US: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FastSwitchProfile {
    /// Output rate at this operating point.
    pub rate: u64,
    /// Rate of the selected source PLL.
    pub source_rate: u64,
    pub div: u32,
    pub select: u8,
}

impl FastSwitchProfile {
    pub const fn new(rate: u64, source_rate: u64, div: u32, select: u8) -> Self {
        Self {
            rate,
            source_rate,
            div,
            select,
        }
    }
}

/// One input of the source mux and the PLL node behind it.
#[derive(Copy, Clone, Debug)]
pub struct FastSwitchSource {
    pub select: u8,
    pub rate: u64,
    pub pll: &'static str,
}

impl FastSwitchSource {
    pub const fn new(select: u8, rate: u64, pll: &'static str) -> Self {
        Self { select, rate, pll }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FastSwitchDesc {
    /// Ascending by rate.
    pub profiles: &'static [FastSwitchProfile],
    pub sources: &'static [FastSwitchSource],
    pub div: RegField,
    pub mux: RegField,
    pub mux_ack: Option<RegField>,
    /// The soft clock gate, present only if the domain is gateable.
    pub gate: Option<GateDesc>,
    /// How far above both endpoint rates the output may go mid-switch.
    pub margin: u64,
}

impl FastSwitchDesc {
    pub(crate) fn validate(&self) -> Result<(), ClkError> {
        if self.profiles.is_empty() || self.profiles.len() > MAX_PROFILES {
            return Err(ClkError::TableFull);
        }
        let max_div = self.div.max() + 1;
        for p in self.profiles {
            if p.div == 0 || p.div > max_div {
                return Err(ClkError::InvalidRateRequest);
            }
            self.source(p.select)?;
        }
        Ok(())
    }

    pub fn source(&self, select: u8) -> Result<&FastSwitchSource, ClkError> {
        self.sources
            .iter()
            .find(|s| s.select == select)
            .ok_or(ClkError::NoSuchClock)
    }

    /// The highest profile whose rate does not exceed `rate`, or 0.
    pub fn level_for(&self, rate: u64) -> usize {
        self.profiles
            .iter()
            .rposition(|p| p.rate <= rate)
            .unwrap_or(0)
    }

    pub fn round_rate(&self, rate: u64) -> u64 {
        self.profiles
            .get(self.level_for(rate))
            .map_or(0, |p| p.rate)
    }

    pub(crate) fn rate<P: RegisterPort>(&self, hw: &Hw<'_, P>) -> u64 {
        let select = hw.read_field(&self.mux) as u8;
        let div = hw.read_field(&self.div) + 1;
        self.source(select).map_or(0, |s| s.rate / u64::from(div))
    }
}

/// Smallest divisor, no smaller than either profile's own, at which both
/// sources stay within `margin` of the faster endpoint. Falls back to the
/// larger profile divisor if nothing up to `max_div` qualifies.
pub fn transitional_divider(
    cur: &FastSwitchProfile,
    tgt: &FastSwitchProfile,
    max_div: u32,
    margin: u64,
) -> u32 {
    let floor = cur.div.max(tgt.div).max(1);
    let limit = cur.rate.max(tgt.rate).saturating_add(margin);
    (floor..=max_div)
        .find(|&d| {
            let d = u64::from(d);
            cur.source_rate / d <= limit && tgt.source_rate / d <= limit
        })
        .unwrap_or(floor)
}

impl ClockTree {
    pub(crate) fn fast_switch_acquire<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        fs: &FastSwitchDesc,
    ) -> Result<(), ClkError> {
        let select = hw.read_field(&fs.mux) as u8;
        let pll = self.resolve(fs.source(select)?.pll)?;
        self.prepare_enable(hw, st, pll)
    }

    pub(crate) fn fast_switch_release<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        fs: &FastSwitchDesc,
    ) -> Result<(), ClkError> {
        let select = hw.read_field(&fs.mux) as u8;
        let pll = self.resolve(fs.source(select)?.pll)?;
        self.disable_unprepare(hw, st, pll)
    }

    pub(crate) fn fast_switch<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
        fs: &FastSwitchDesc,
        rate: u64,
    ) -> Result<(), ClkError> {
        let desc = self.desc(id)?;
        let hiword = desc.flags.contains(NodeFlags::HIWORD_MASK);

        let from = fs.level_for(fs.rate(hw));
        let to = fs.level_for(rate);
        let (Some(cur), Some(tgt)) = (fs.profiles.get(from), fs.profiles.get(to))
        else {
            return Err(ClkError::InvalidRateRequest);
        };
        let cur_select = hw.read_field(&fs.mux) as u8;
        let cur_div = hw.read_field(&fs.div);
        let cur_source = fs.source(cur_select)?;
        let cur_pll = self.resolve(cur_source.pll)?;
        let tgt_pll = self.resolve(fs.source(tgt.select)?.pll)?;
        // The bound must hold for the source actually feeding the divider,
        // which need not be the one the matched profile names.
        let here = FastSwitchProfile {
            source_rate: cur_source.rate,
            ..*cur
        };
        let transitional =
            transitional_divider(&here, tgt, fs.div.max() + 1, fs.margin);

        self.prepare_enable(hw, st, cur_pll)?;
        if let Err(e) = self.prepare_enable(hw, st, tgt_pll) {
            let _ = self.disable_unprepare(hw, st, cur_pll);
            return Err(e);
        }

        let switching = tgt.select != cur_select;
        hw.write_field(&fs.div, transitional - 1, hiword);
        hw.delay(FAST_SWITCH_PAUSE_US);
        if switching {
            hw.write_field(&fs.mux, u32::from(tgt.select), hiword);
        }
        hw.delay(FAST_SWITCH_PAUSE_US);
        hw.write_field(&fs.div, tgt.div - 1, hiword);
        hw.delay(FAST_SWITCH_PAUSE_US);

        let acked = match &fs.mux_ack {
            Some(ack) if switching => wait_ack(hw, id, ack, tgt.select),
            _ => Ok(()),
        };
        if acked.is_err() {
            // Back onto the old source, through the same transitional divisor.
            hw.write_field(&fs.div, transitional - 1, hiword);
            hw.delay(FAST_SWITCH_PAUSE_US);
            hw.write_field(&fs.mux, u32::from(cur_select), hiword);
            hw.delay(FAST_SWITCH_PAUSE_US);
            hw.write_field(&fs.div, cur_div, hiword);
            hw.delay(FAST_SWITCH_PAUSE_US);
        }

        // Drop the two references taken above. If the switch went through
        // and the engine holds one on the old source, that one goes instead
        // of the new source's, which leaves the engine holding the new
        // source. Otherwise the mux is back on the old source and the new
        // source's reference goes.
        let held = st[usize::from(id.0)].prepare_count > 0;
        let r = self.disable_unprepare(hw, st, cur_pll);
        let extra = if held && acked.is_ok() { cur_pll } else { tgt_pll };
        let r = self.disable_unprepare(hw, st, extra).and(r);
        acked?;
        r?;

        trace!(
            hw.trace,
            Trace::FastSwitch {
                clock: id,
                from: from as u8,
                to: to as u8,
                transitional,
            }
        );
        Ok(())
    }
}
