// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Voltage arbitration channel handshake.
//!
//! A channel takes a voltage selector code through its request register.
//! One request is:
//!
//! 1. wait for the channel to drop its busy bit for the previous request,
//!    and check that no timeout interrupt is already raised;
//! 2. write the code with the valid bit set;
//! 3. repeat (1), which catches an immediate rejection;
//! 4. write the valid bit clear, leaving the code alone;
//! 5. optionally repeat (1) again to wait for the regulator to settle.
//!
//! Step 5 can be deferred with `wait = false` and finished later with
//! [`wait_ack`]. Any failed wait dumps the channel's registers into the
//! trace ring before returning.

use bitfield::bitfield;
use drv_clk_dvfs_api::{Bank, ChannelId, ClkError, RegField, RegisterPort};

use crate::hw::Hw;
use crate::trace::{trace, Trace};

/// Attempts at 1 µs each for a channel to clear its busy bit.
pub const DVS_ACK_POLL: u32 = 500;

/// Delay before the first busy check, which can otherwise see a stale
/// value from a request issued a moment earlier.
pub const DVS_SETTLE_US: u32 = 1;

bitfield! {
    /// Request register word. Bits 31:16 are write enables for 15:0.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct ChannelRequest(u32);
    impl Debug;
    pub code, set_code: 7, 0;
    pub valid, set_valid: 8;
    pub code_we, set_code_we: 23, 16;
    pub valid_we, set_valid_we: 24;
}

impl ChannelRequest {
    pub fn request(code: u8) -> Self {
        let mut r = Self(0);
        r.set_code(u32::from(code));
        r.set_valid(true);
        r.set_code_we(0xff);
        r.set_valid_we(true);
        r
    }

    pub fn clear() -> Self {
        let mut r = Self(0);
        r.set_valid_we(true);
        r
    }
}

/// Register layout of the arbitration block. Channels below
/// `secure_channels` have their request registers in the secure window;
/// the rest are numbered from zero again in the non-secure window. Every
/// per-channel register is 4 bytes apart.
#[derive(Copy, Clone, Debug)]
pub struct DvsConfig {
    pub bank: Bank,
    pub channels: u8,
    pub secure_channels: u8,
    pub secure_base: u32,
    pub nonsecure_base: u32,
    /// One busy bit per channel.
    pub ack: u32,
    /// One raw timeout-interrupt bit per channel.
    pub irq_raw: u32,
    /// Masked timeout-interrupt status.
    pub irq_status: u32,
    /// Write-one-to-clear for timeout interrupts.
    pub irq_clear: u32,
    /// First per-channel status register.
    pub status_base: u32,
    /// Position of the applied code in a status register.
    pub status_shift: u8,
    pub status_width: u8,
    /// Further state registers worth capturing on failure.
    pub dump: &'static [u32],
}

impl DvsConfig {
    /// A block with no channels, for platforms without voltage scaling.
    pub const NONE: Self = Self {
        bank: Bank(0),
        channels: 0,
        secure_channels: 0,
        secure_base: 0,
        nonsecure_base: 0,
        ack: 0,
        irq_raw: 0,
        irq_status: 0,
        irq_clear: 0,
        status_base: 0,
        status_shift: 0,
        status_width: 8,
        dump: &[],
    };

    fn check(&self, ch: ChannelId) -> Result<(), ClkError> {
        if ch.0 < self.channels {
            Ok(())
        } else {
            Err(ClkError::InvalidChannelOrVote)
        }
    }

    pub fn request_offset(&self, ch: ChannelId) -> Result<u32, ClkError> {
        self.check(ch)?;
        Ok(if ch.0 < self.secure_channels {
            self.secure_base + 4 * u32::from(ch.0)
        } else {
            self.nonsecure_base + 4 * u32::from(ch.0 - self.secure_channels)
        })
    }

    pub fn status(&self, ch: ChannelId) -> RegField {
        RegField::new(
            self.bank,
            self.status_base + 4 * u32::from(ch.0),
            self.status_shift,
            self.status_width,
        )
    }

    fn mask(&self) -> u32 {
        match self.channels {
            0 => 0,
            32.. => u32::MAX,
            n => (1 << n) - 1,
        }
    }
}

/// Issues one voltage request. With `wait`, also waits for the channel to
/// finish applying it.
pub(crate) fn write_code<P: RegisterPort>(
    hw: &Hw<'_, P>,
    ch: ChannelId,
    code: u8,
    wait: bool,
) -> Result<(), ClkError> {
    let dvs = &hw.config.dvs;
    let offset = dvs.request_offset(ch)?;

    wait_ack(hw, ch)?;
    hw.write(dvs.bank, offset, ChannelRequest::request(code).0);
    trace!(hw.trace, Trace::DvsWrite { channel: ch, code });
    wait_ack(hw, ch)?;
    hw.write(dvs.bank, offset, ChannelRequest::clear().0);

    if wait {
        wait_ack(hw, ch)?;
    }
    Ok(())
}

/// Waits for the channel to go idle and checks that its last request did
/// not time out.
pub(crate) fn wait_ack<P: RegisterPort>(
    hw: &Hw<'_, P>,
    ch: ChannelId,
) -> Result<(), ClkError> {
    let dvs = &hw.config.dvs;
    dvs.check(ch)?;
    let bit = 1u32 << ch.0;

    hw.delay(DVS_SETTLE_US);
    if !hw.poll(DVS_ACK_POLL, 1, || hw.read(dvs.bank, dvs.ack) & bit == 0) {
        trace!(hw.trace, Trace::DvsBusyTimeout(ch));
        dump(hw, ch);
        return Err(ClkError::AckTimeout);
    }
    if hw.read(dvs.bank, dvs.irq_raw) & bit != 0 {
        trace!(hw.trace, Trace::DvsInterruptRaw(ch));
        dump(hw, ch);
        return Err(ClkError::InterruptedTimeout);
    }
    Ok(())
}

/// The code the channel is currently applying.
pub(crate) fn current_code<P: RegisterPort>(
    hw: &Hw<'_, P>,
    ch: ChannelId,
) -> Result<u8, ClkError> {
    let dvs = &hw.config.dvs;
    dvs.check(ch)?;
    Ok(hw.read_field(&dvs.status(ch)) as u8)
}

/// Records the channel's request and status registers, and the block's
/// shared ack, interrupt and state registers, in the trace ring.
pub(crate) fn dump<P: RegisterPort>(hw: &Hw<'_, P>, ch: ChannelId) {
    let dvs = &hw.config.dvs;
    let own = [
        dvs.request_offset(ch).ok(),
        Some(dvs.status(ch).offset),
        Some(dvs.ack),
        Some(dvs.irq_raw),
        Some(dvs.irq_status),
    ];
    let extra = dvs.dump.iter().copied().map(Some);
    for offset in own.into_iter().chain(extra).flatten() {
        let value = hw.read(dvs.bank, offset);
        trace!(hw.trace, Trace::DvsDump { offset, value });
    }
}

/// Services the timeout interrupt: dumps every flagged channel, clears the
/// flags and returns them as a bitmask.
pub(crate) fn handle_interrupt<P: RegisterPort>(hw: &Hw<'_, P>) -> u32 {
    let dvs = &hw.config.dvs;
    let pending = hw.read(dvs.bank, dvs.irq_status) & dvs.mask();
    if pending == 0 {
        return 0;
    }
    trace!(hw.trace, Trace::DvsIrq(pending));
    for ch in 0..dvs.channels {
        if pending & (1 << ch) != 0 {
            dump(hw, ChannelId(ch));
        }
    }
    hw.write(dvs.bank, dvs.irq_clear, pending);
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_words() {
        let r = ChannelRequest::request(5);
        assert_eq!(r.0, 0x01ff_0105);
        let c = ChannelRequest::clear();
        assert_eq!(c.0, 0x0100_0000);
        assert_eq!(c.code(), 0);
        assert!(!c.valid());
    }

    #[test]
    fn secure_and_nonsecure_windows() {
        let dvs = DvsConfig {
            channels: 6,
            secure_channels: 2,
            secure_base: 0x100,
            nonsecure_base: 0x200,
            ..DvsConfig::NONE
        };
        assert_eq!(dvs.request_offset(ChannelId(1)), Ok(0x104));
        assert_eq!(dvs.request_offset(ChannelId(2)), Ok(0x200));
        assert_eq!(dvs.request_offset(ChannelId(5)), Ok(0x20c));
        assert_eq!(
            dvs.request_offset(ChannelId(6)),
            Err(ClkError::InvalidChannelOrVote)
        );
    }
}
