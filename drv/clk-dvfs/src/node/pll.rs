// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_clk_dvfs_api::{ClkError, ClockId, RegBit, RegisterPort, SecureOp};

use crate::hw::Hw;
use crate::trace::{trace, Trace};

/// Attempts at 1 µs each for a PLL to report lock.
pub const PLL_LOCK_POLL: u32 = 1000;

#[derive(Copy, Clone, Debug)]
pub enum PllControl {
    /// Powered by a vote-enable bit in a local register.
    Local { enable: RegBit },
    /// Powered through the secure monitor.
    Secure { pll: u32 },
}

#[derive(Copy, Clone, Debug)]
pub enum PllRate {
    /// Always produces this rate and cannot be reprogrammed.
    Fixed(u64),
    /// Rate set and read back through the secure monitor, in kHz steps.
    Dynamic { pll: u32 },
}

#[derive(Copy, Clone, Debug)]
pub struct PllDesc {
    pub control: PllControl,
    pub lock: Option<RegBit>,
    pub rate: PllRate,
}

impl PllDesc {
    pub const fn new(control: PllControl, rate: PllRate) -> Self {
        Self {
            control,
            lock: None,
            rate,
        }
    }

    pub const fn with_lock(self, lock: RegBit) -> Self {
        Self {
            lock: Some(lock),
            ..self
        }
    }

    pub(crate) fn enable<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        clock: ClockId,
        hiword: bool,
    ) -> Result<(), ClkError> {
        match self.control {
            PllControl::Local { enable } => hw.write_bit(&enable, true, hiword),
            PllControl::Secure { pll } => {
                hw.secure(SecureOp::PllEnable, [pll, 0, 0, 0])?;
            }
        }

        let Some(lock) = &self.lock else {
            return Ok(());
        };
        if hw.config.simulation {
            return Ok(());
        }
        if hw.poll(PLL_LOCK_POLL, 1, || hw.bit(lock)) {
            Ok(())
        } else {
            trace!(hw.trace, Trace::PllLockTimeout(clock));
            Err(ClkError::AckTimeout)
        }
    }

    pub(crate) fn disable<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        hiword: bool,
    ) -> Result<(), ClkError> {
        match self.control {
            PllControl::Local { enable } => {
                hw.write_bit(&enable, false, hiword);
                Ok(())
            }
            PllControl::Secure { pll } => hw
                .secure(SecureOp::PllDisable, [pll, 0, 0, 0])
                .map(|_| ()),
        }
    }

    pub(crate) fn is_enabled<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
    ) -> Option<bool> {
        match &self.control {
            PllControl::Local { enable } => Some(hw.bit(enable)),
            PllControl::Secure { .. } => None,
        }
    }

    pub(crate) fn rate<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
    ) -> Result<u64, ClkError> {
        match self.rate {
            PllRate::Fixed(rate) => Ok(rate),
            PllRate::Dynamic { pll } => {
                let [khz, ..] =
                    hw.secure(SecureOp::PllGetRate, [pll, 0, 0, 0])?;
                Ok(u64::from(khz) * 1000)
            }
        }
    }

    pub(crate) fn round_rate(&self, rate: u64) -> u64 {
        match self.rate {
            PllRate::Fixed(fixed) => fixed,
            PllRate::Dynamic { .. } => rate / 1000 * 1000,
        }
    }

    pub(crate) fn set_rate<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        rate: u64,
    ) -> Result<(), ClkError> {
        match self.rate {
            PllRate::Fixed(fixed) if fixed == rate => Ok(()),
            PllRate::Fixed(_) => Err(ClkError::InvalidRateRequest),
            PllRate::Dynamic { pll } => {
                let khz = u32::try_from(rate / 1000)
                    .map_err(|_| ClkError::InvalidRateRequest)?;
                hw.secure(SecureOp::PllSetRate, [pll, khz, 0, 0])
                    .map(|_| ())
            }
        }
    }
}
