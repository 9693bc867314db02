// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_clk_dvfs_api::{ClkError, ClockId, RegField, RegisterPort};

use crate::hw::Hw;
use crate::trace::{trace, Trace};

/// Attempts at 1 µs each for a mux acknowledgment to match the selection.
pub const MUX_ACK_POLL: u32 = 100;

/// A source selector. The selector field holds the parent index; the
/// optional acknowledgment field reports the active input one-hot.
#[derive(Copy, Clone, Debug)]
pub struct MuxDesc {
    pub field: RegField,
    pub ack: Option<RegField>,
}

impl MuxDesc {
    pub const fn new(field: RegField) -> Self {
        Self { field, ack: None }
    }

    pub const fn with_ack(self, ack: RegField) -> Self {
        Self {
            ack: Some(ack),
            ..self
        }
    }

    pub(crate) fn selected<P: RegisterPort>(&self, hw: &Hw<'_, P>) -> u8 {
        hw.read_field(&self.field) as u8
    }

    pub(crate) fn select<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        clock: ClockId,
        index: u8,
        hiword: bool,
    ) -> Result<(), ClkError> {
        hw.write_field(&self.field, u32::from(index), hiword);
        trace!(hw.trace, Trace::Parent { clock, index });
        match &self.ack {
            Some(ack) => wait_ack(hw, clock, ack, index),
            None => Ok(()),
        }
    }
}

/// Polls a one-hot acknowledgment field until its lowest set bit is
/// `index`. Skipped on simulation platforms, which have no ack hardware.
pub(crate) fn wait_ack<P: RegisterPort>(
    hw: &Hw<'_, P>,
    clock: ClockId,
    ack: &RegField,
    index: u8,
) -> Result<(), ClkError> {
    if hw.config.simulation {
        return Ok(());
    }
    let decoded = || hw.read_field(ack).trailing_zeros();
    if hw.poll(MUX_ACK_POLL, 1, || decoded() == u32::from(index)) {
        Ok(())
    } else {
        trace!(
            hw.trace,
            Trace::MuxAckTimeout {
                clock,
                expected: index,
                ack: hw.read_field(ack),
            }
        );
        Err(ClkError::AckTimeout)
    }
}
