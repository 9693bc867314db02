// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_clk_dvfs_api::{Bank, ClkError, ClockId, RegBit, RegisterPort};

use crate::hw::Hw;
use crate::trace::{trace, Trace};

/// Attempts at 1 µs each for a switched supply to report power-good.
pub const SUPPLY_GOOD_POLL: u32 = 500;

/// How a gate's enable bit is laid out.
#[derive(Copy, Clone, Debug)]
pub enum GateDesc {
    /// Write-one-to-set at `offset`, write-one-to-clear at `offset + 4`,
    /// state readable at `offset + 8`.
    SetClear { bank: Bank, offset: u32, bit: u8 },
    /// A single read/write bit; set `HIWORD_MASK` on the node if the
    /// register takes a write-enable mask in its upper half.
    Bit(RegBit),
}

impl GateDesc {
    pub const fn set_clear(bank: Bank, offset: u32, bit: u8) -> Self {
        Self::SetClear { bank, offset, bit }
    }

    pub const fn bit(bank: Bank, offset: u32, bit: u8) -> Self {
        Self::Bit(RegBit::new(bank, offset, bit))
    }

    pub(crate) fn set<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        on: bool,
        hiword: bool,
    ) {
        match *self {
            Self::SetClear { bank, offset, bit } => {
                let offset = if on { offset } else { offset + 4 };
                hw.write(bank, offset, 1 << bit);
            }
            Self::Bit(b) => hw.write_bit(&b, on, hiword),
        }
    }

    pub(crate) fn is_set<P: RegisterPort>(&self, hw: &Hw<'_, P>) -> bool {
        match *self {
            Self::SetClear { bank, offset, bit } => {
                hw.bit(&RegBit::new(bank, offset + 8, bit))
            }
            Self::Bit(b) => hw.bit(&b),
        }
    }
}

/// A switchable power supply feeding a regulator-gated clock.
#[derive(Copy, Clone, Debug)]
pub struct SupplyDesc {
    pub enable: RegBit,
    pub good: RegBit,
}

impl SupplyDesc {
    pub const fn new(enable: RegBit, good: RegBit) -> Self {
        Self { enable, good }
    }

    pub(crate) fn power_up<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        clock: ClockId,
        hiword: bool,
    ) -> Result<(), ClkError> {
        hw.write_bit(&self.enable, true, hiword);
        if hw.poll(SUPPLY_GOOD_POLL, 1, || hw.bit(&self.good)) {
            Ok(())
        } else {
            hw.write_bit(&self.enable, false, hiword);
            trace!(hw.trace, Trace::SupplyTimeout(clock));
            Err(ClkError::AckTimeout)
        }
    }

    pub(crate) fn power_down<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        hiword: bool,
    ) {
        hw.write_bit(&self.enable, false, hiword);
    }
}
