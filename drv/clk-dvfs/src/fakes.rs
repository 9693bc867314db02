// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Register-file fakes for testing!
//
// `FakePort` is a plain map from (bank, offset) to word. Registers marked
// with `hiword` honour a write-enable mask in bits 31:16, and write hooks
// model the bits of hardware the driver waits on (gate status, PLL lock,
// mux ack, applied voltage code). Every access is logged in order, so the
// position of an access in the log doubles as its timestamp.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use drv_clk_dvfs_api::{
    Bank, RegBit, RegField, RegisterPort, SecureOp, SecureRequest,
    SecureResponse,
};

use crate::dvs::{ChannelRequest, DvsConfig};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read { bank: u8, offset: u32, value: u32 },
    Write { bank: u8, offset: u32, value: u32 },
    Secure(SecureRequest),
    Delay(u32),
}

#[derive(Default)]
pub struct Regs(BTreeMap<(u8, u32), u32>);

impl Regs {
    pub fn get(&self, bank: Bank, offset: u32) -> u32 {
        self.0.get(&(bank.0, offset)).copied().unwrap_or(0)
    }

    pub fn set(&mut self, bank: Bank, offset: u32, value: u32) {
        self.0.insert((bank.0, offset), value);
    }

    pub fn bit(&self, bit: RegBit) -> bool {
        bit.is_set(self.get(bit.bank, bit.offset))
    }

    pub fn set_bit(&mut self, bit: RegBit, on: bool) {
        let v = self.get(bit.bank, bit.offset);
        let v = if on { v | bit.mask() } else { v & !bit.mask() };
        self.set(bit.bank, bit.offset, v);
    }

    pub fn field(&self, f: RegField) -> u32 {
        f.extract(self.get(f.bank, f.offset))
    }

    pub fn set_field(&mut self, f: RegField, value: u32) {
        let v = f.insert(self.get(f.bank, f.offset), value);
        self.set(f.bank, f.offset, v);
    }
}

type Hook = Box<dyn Fn(&mut Regs, Bank, u32, u32)>;
type SecureHandler = Box<dyn FnMut(&SecureRequest) -> SecureResponse>;

pub struct FakePort {
    regs: RefCell<Regs>,
    hiword: RefCell<Vec<(u8, u32)>>,
    hooks: RefCell<Vec<Hook>>,
    secure: RefCell<SecureHandler>,
    log: RefCell<Vec<Access>>,
    now_us: Cell<u64>,
    idle: Cell<bool>,
}

impl FakePort {
    pub fn new() -> Self {
        let secure: SecureHandler =
            Box::new(|_: &SecureRequest| SecureResponse::ok([0; 4]));
        Self {
            regs: RefCell::default(),
            hiword: RefCell::default(),
            hooks: RefCell::default(),
            secure: RefCell::new(secure),
            log: RefCell::default(),
            now_us: Cell::new(0),
            idle: Cell::new(true),
        }
    }

    pub fn poke(&self, bank: Bank, offset: u32, value: u32) {
        self.regs.borrow_mut().set(bank, offset, value);
    }

    pub fn peek_bit(&self, bit: RegBit) -> bool {
        self.regs.borrow().bit(bit)
    }

    pub fn peek_field(&self, f: RegField) -> u32 {
        self.regs.borrow().field(f)
    }

    pub fn poke_field(&self, f: RegField, value: u32) {
        self.regs.borrow_mut().set_field(f, value);
    }

    /// Marks a register as taking a write-enable mask in bits 31:16.
    pub fn hiword(&self, bank: Bank, offset: u32) {
        self.hiword.borrow_mut().push((bank.0, offset));
    }

    pub fn on_write(&self, hook: impl Fn(&mut Regs, Bank, u32, u32) + 'static) {
        self.hooks.borrow_mut().push(Box::new(hook));
    }

    pub fn on_secure(
        &self,
        handler: impl FnMut(&SecureRequest) -> SecureResponse + 'static,
    ) {
        *self.secure.borrow_mut() = Box::new(handler);
    }

    /// A set/clear/status triple at `offset`.
    pub fn set_clear(&self, bank: Bank, offset: u32) {
        self.on_write(move |regs, b, off, value| {
            if b != bank {
                return;
            }
            let status = regs.get(bank, offset + 8);
            if off == offset {
                regs.set(bank, offset + 8, status | value);
            } else if off == offset + 4 {
                regs.set(bank, offset + 8, status & !value);
            }
        });
    }

    /// `lock` tracks `enable` on every write to `enable`'s register.
    pub fn lock_follows(&self, enable: RegBit, lock: RegBit) {
        self.on_write(move |regs, b, off, _| {
            if b == enable.bank && off == enable.offset {
                let on = regs.bit(enable);
                regs.set_bit(lock, on);
            }
        });
    }

    /// `ack` reports the selection in `mux` one-hot on every write to it.
    pub fn ack_follows(&self, mux: RegField, ack: RegField) {
        self.on_write(move |regs, b, off, _| {
            if b == mux.bank && off == mux.offset {
                let sel = regs.field(mux);
                regs.set_field(ack, 1 << sel);
            }
        });
    }

    /// A channel's status register picks up each valid request's code.
    pub fn dvs_follows(&self, dvs: DvsConfig) {
        self.on_write(move |regs, b, off, value| {
            if b != dvs.bank {
                return;
            }
            let req = ChannelRequest(value);
            if !req.valid() {
                return;
            }
            for ch in 0..dvs.channels {
                let ch = drv_clk_dvfs_api::ChannelId(ch);
                if dvs.request_offset(ch) == Ok(off) {
                    regs.set_field(dvs.status(ch), req.code());
                }
            }
        });
    }

    pub fn set_idle_allowed(&self, idle: bool) {
        self.idle.set(idle);
    }

    pub fn now_us(&self) -> u64 {
        self.now_us.get()
    }

    pub fn log(&self) -> Vec<Access> {
        self.log.borrow().clone()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    /// Values written to one register, in order.
    pub fn writes_to(&self, bank: Bank, offset: u32) -> Vec<u32> {
        self.log
            .borrow()
            .iter()
            .filter_map(|a| match *a {
                Access::Write {
                    bank: b,
                    offset: o,
                    value,
                } if b == bank.0 && o == offset => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Log positions of writes to one register.
    pub fn write_times(&self, bank: Bank, offset: u32) -> Vec<usize> {
        self.log
            .borrow()
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match *a {
                Access::Write {
                    bank: b, offset: o, ..
                } if b == bank.0 && o == offset => Some(i),
                _ => None,
            })
            .collect()
    }

    pub fn secure_ops(&self) -> Vec<(SecureOp, [u32; 4])> {
        self.log
            .borrow()
            .iter()
            .filter_map(|a| match a {
                Access::Secure(req) => req.op().map(|op| (op, req.args)),
                _ => None,
            })
            .collect()
    }
}

impl RegisterPort for FakePort {
    fn read32(&self, bank: Bank, offset: u32) -> u32 {
        let value = self.regs.borrow().get(bank, offset);
        self.log.borrow_mut().push(Access::Read {
            bank: bank.0,
            offset,
            value,
        });
        value
    }

    fn write32(&self, bank: Bank, offset: u32, value: u32) {
        self.log.borrow_mut().push(Access::Write {
            bank: bank.0,
            offset,
            value,
        });
        let mut regs = self.regs.borrow_mut();
        if self.hiword.borrow().contains(&(bank.0, offset)) {
            let mask = value >> 16;
            let old = regs.get(bank, offset);
            regs.set(bank, offset, (old & !mask) | (value & mask));
        } else {
            regs.set(bank, offset, value);
        }
        for hook in self.hooks.borrow().iter() {
            hook(&mut *regs, bank, offset, value);
        }
    }

    fn secure_call(&self, request: &SecureRequest) -> SecureResponse {
        self.log.borrow_mut().push(Access::Secure(*request));
        let mut handler = self.secure.borrow_mut();
        (*handler)(request)
    }

    fn delay_us(&self, us: u32) {
        self.now_us.set(self.now_us.get() + u64::from(us));
        self.log.borrow_mut().push(Access::Delay(us));
    }

    fn context_id(&self) -> NonZeroUsize {
        NonZeroUsize::MIN
    }

    fn idle_allowed(&self) -> bool {
        self.idle.get()
    }
}
