// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register access helpers shared by every part of the driver.

use drv_clk_dvfs_api::{
    Bank, ClkError, RegBit, RegField, RegisterPort, SecureOp, SecureRequest,
};

use crate::trace::{trace, Trace, TraceBuf};
use crate::Config;

/// Borrowed view of everything a hardware sequence needs.
pub(crate) struct Hw<'a, P: RegisterPort> {
    pub port: &'a P,
    pub config: &'a Config,
    pub trace: &'a TraceBuf,
}

impl<P: RegisterPort> Hw<'_, P> {
    pub fn read(&self, bank: Bank, offset: u32) -> u32 {
        self.port.read32(bank, offset)
    }

    pub fn write(&self, bank: Bank, offset: u32, value: u32) {
        self.port.write32(bank, offset, value)
    }

    pub fn read_field(&self, field: &RegField) -> u32 {
        field.extract(self.read(field.bank, field.offset))
    }

    /// Writes `value` into `field`, either through the register's upper-half
    /// write-enable mask or with a read-modify-write.
    pub fn write_field(&self, field: &RegField, value: u32, hiword: bool) {
        let word = if hiword {
            field.masked_write(value)
        } else {
            field.insert(self.read(field.bank, field.offset), value)
        };
        self.write(field.bank, field.offset, word);
    }

    pub fn bit(&self, bit: &RegBit) -> bool {
        bit.is_set(self.read(bit.bank, bit.offset))
    }

    pub fn write_bit(&self, bit: &RegBit, on: bool, hiword: bool) {
        let field = RegField::new(bit.bank, bit.offset, bit.bit, 1);
        self.write_field(&field, on as u32, hiword);
    }

    /// Checks `done` up to `attempts` times, sleeping `step_us` after each
    /// miss. Returns whether it ever reported completion.
    pub fn poll(
        &self,
        attempts: u32,
        step_us: u32,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        for _ in 0..attempts {
            if done() {
                return true;
            }
            self.port.delay_us(step_us);
        }
        false
    }

    pub fn delay(&self, us: u32) {
        self.port.delay_us(us)
    }

    /// One round trip to the secure monitor.
    pub fn secure(
        &self,
        op: SecureOp,
        args: [u32; 4],
    ) -> Result<[u32; 4], ClkError> {
        let resp = self.port.secure_call(&SecureRequest::new(op, args));
        resp.check().inspect_err(|_| {
            trace!(
                self.trace,
                Trace::SecureFailure {
                    op,
                    status: resp.status,
                }
            );
        })
    }
}
