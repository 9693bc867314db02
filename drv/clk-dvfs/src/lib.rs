// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock tree and dynamic voltage/frequency scaling driver.
//!
//! [`ClkDvfs`] owns everything: the clock tree, the voltage vote registry,
//! the shared-bus domains and the trace ring. Boards build it from `const`
//! descriptor tables at startup and then thread the handle through every
//! call.
//!
//! Two locks protect the runtime state:
//!
//! - a reentrant lock around the vote registry, channels and domains, so a
//!   DVFS rate change can hold it while asking for a voltage change that
//!   takes it again;
//! - a spin lock around the clock tree's per-node state.
//!
//! They are always taken in that order. Nothing acquires the vote lock
//! while holding the tree lock.

#![cfg_attr(not(test), no_std)]

use drv_clk_dvfs_api::{
    ChannelId, ClkError, ClockId, RegBit, RegField, RegisterPort,
};
use static_assertions::const_assert;

mod arbiter;
mod dvfs_clock;
mod dvs;
mod fast_switch;
mod hw;
mod lock;
pub mod node;
mod registry;
mod trace;

#[cfg(test)]
mod fakes;

pub use arbiter::{DomainDesc, DomainLink};
pub use dvfs_clock::DvfsClockDesc;
pub use dvs::{ChannelRequest, DvsConfig, DVS_ACK_POLL, DVS_SETTLE_US};
pub use fast_switch::{
    transitional_divider, FastSwitchDesc, FastSwitchProfile, FastSwitchSource,
    MAX_PROFILES,
};
pub use lock::{ReentrantGuard, ReentrantLock};
pub use node::{NodeDesc, NodeFlags, NodeKind, Parents};
pub use registry::{VoteDesc, VoteKey};
pub use trace::{Ringbuf, RingbufEntry, Trace, TRACE_DEPTH};

use arbiter::{Channel, DvfsState};
use hw::Hw;
use node::{ClockTree, NodeStates};
use registry::VoteRegistry;
use trace::TraceBuf;

pub const MAX_NODES: usize = 128;
pub const MAX_VOTES: usize = 32;
pub const MAX_CHANNELS: usize = 32;
pub const MAX_DOMAINS: usize = 8;
pub const MAX_LINKS: usize = 16;
pub const MAX_TIERS: usize = 8;

// Channel bits are packed into one u32 register.
const_assert!(MAX_CHANNELS <= 32);
// Clock ids are u16 and tiers are u8.
const_assert!(MAX_NODES <= u16::MAX as usize);
const_assert!(MAX_TIERS <= u8::MAX as usize);

/// Platform switches.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// No acknowledgment or lock hardware: mux ack and PLL lock polls are
    /// skipped and assumed to succeed.
    pub simulation: bool,
    /// Fixed-volt maintenance override, read once at startup. A non-zero
    /// value `n` caps every vote at tier `n - 1`.
    pub maintenance: Option<RegField>,
    /// Set while the low-temperature condition is signaled.
    pub low_temperature: Option<RegBit>,
    pub dvs: DvsConfig,
}

impl Config {
    pub const fn new(dvs: DvsConfig) -> Self {
        Self {
            simulation: false,
            maintenance: None,
            low_temperature: None,
            dvs,
        }
    }

    pub const fn simulation(self) -> Self {
        Self {
            simulation: true,
            ..self
        }
    }

    pub const fn with_maintenance(self, field: RegField) -> Self {
        Self {
            maintenance: Some(field),
            ..self
        }
    }

    pub const fn with_low_temperature(self, bit: RegBit) -> Self {
        Self {
            low_temperature: Some(bit),
            ..self
        }
    }
}

pub struct ClkDvfs<P: RegisterPort> {
    port: P,
    config: Config,
    tree: ClockTree,
    dvfs: ReentrantLock<DvfsState>,
    trace: TraceBuf,
}

impl<P: RegisterPort> ClkDvfs<P> {
    pub fn new(port: P, config: Config) -> Result<Self, ClkError> {
        let fixed_volt = match &config.maintenance {
            Some(f) => f.extract(port.read32(f.bank, f.offset)),
            None => 0,
        };

        let mut channels = heapless::Vec::new();
        for _ in 0..config.dvs.channels {
            channels
                .push(Channel {
                    tier: core::cell::Cell::new(0),
                })
                .map_err(|_| ClkError::TableFull)?;
        }

        Ok(Self {
            port,
            config,
            tree: ClockTree::new(),
            dvfs: ReentrantLock::new(DvfsState {
                votes: VoteRegistry::new(),
                channels,
                domains: heapless::Vec::new(),
                fixed_volt,
            }),
            trace: spin::Mutex::new(Ringbuf::new(Trace::None)),
        })
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn hw(&self) -> Hw<'_, P> {
        Hw {
            port: &self.port,
            config: &self.config,
            trace: &self.trace,
        }
    }

    /// Runs `f` with the tree locked.
    pub(crate) fn with_tree<R>(
        &self,
        f: impl FnOnce(&Hw<'_, P>, &mut NodeStates) -> R,
    ) -> R {
        let hw = self.hw();
        let mut st = self.tree.lock();
        f(&hw, &mut st)
    }

    /// Copies the trace ring out, oldest entry first.
    pub fn trace_snapshot(&self) -> Ringbuf<Trace, TRACE_DEPTH> {
        *self.trace.lock()
    }

    //
    // Registration. Descriptors may name parents, friends and link clocks
    // that are registered later; names are resolved on first use.
    //

    pub fn register_clock(&mut self, desc: NodeDesc) -> Result<ClockId, ClkError> {
        self.tree.register(desc)
    }

    pub fn register_vote(&mut self, desc: VoteDesc) -> Result<(), ClkError> {
        let state = self.dvfs.get_mut();
        state.channel(desc.channel)?;
        if let Some(domain) = desc.domain {
            if state.domain(domain)?.desc.channel != desc.channel {
                return Err(ClkError::InvalidChannelOrVote);
            }
        }
        state.votes.register(desc)
    }

    pub fn register_domain(&mut self, desc: DomainDesc) -> Result<(), ClkError> {
        self.dvfs.get_mut().register_domain(desc)
    }

    //
    // Clock tree operations.
    //

    pub fn lookup_clock(&self, name: &str) -> Option<ClockId> {
        self.tree.lookup(name)
    }

    pub fn prepare(&self, id: ClockId) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.prepare(hw, st, id))
    }

    pub fn unprepare(&self, id: ClockId) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.unprepare(hw, st, id))
    }

    /// Enables the clock, then brings any domain or DVFS clock that fell
    /// behind while its friend was off back in line.
    pub fn enable(&self, id: ClockId) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.enable(hw, st, id))?;
        self.resync()
    }

    pub fn disable(&self, id: ClockId) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.disable(hw, st, id))
    }

    pub fn prepare_enable(&self, id: ClockId) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.prepare_enable(hw, st, id))?;
        self.resync()
    }

    pub fn disable_unprepare(&self, id: ClockId) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.disable_unprepare(hw, st, id))
    }

    pub fn is_enabled(&self, id: ClockId) -> Result<bool, ClkError> {
        self.with_tree(|hw, st| self.tree.is_enabled(hw, st, id))
    }

    pub fn enable_count(&self, id: ClockId) -> u32 {
        self.tree.enable_count(&self.tree.lock(), id)
    }

    pub fn prepare_count(&self, id: ClockId) -> u32 {
        self.tree
            .lock()
            .get(usize::from(id.0))
            .map_or(0, |s| s.prepare_count)
    }

    pub fn get_rate(&self, id: ClockId) -> Result<u64, ClkError> {
        self.with_tree(|hw, st| self.tree.rate(hw, st, id))
    }

    pub fn round_rate(&self, id: ClockId, rate: u64) -> Result<u64, ClkError> {
        self.with_tree(|hw, st| self.tree.round_rate(hw, st, id, rate))
    }

    /// Changes the clock's rate. DVFS clocks sequence the change against
    /// their vote; everything else is a plain tree operation.
    pub fn set_rate(&self, id: ClockId, rate: u64) -> Result<(), ClkError> {
        if let NodeKind::Dvfs(dvfs) = self.tree.desc(id)?.kind {
            return self.set_dvfs_rate(id, dvfs, rate);
        }
        self.with_tree(|hw, st| self.tree.set_rate(hw, st, id, rate))
    }

    pub fn set_parent(&self, id: ClockId, index: u8) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.set_parent(hw, st, id, index))
    }

    /// The rate a DVFS clock accepted while its friend was off, if it has
    /// not been applied yet.
    pub fn pending_rate(&self, id: ClockId) -> Option<u64> {
        self.tree
            .lock()
            .get(usize::from(id.0))
            .and_then(|s| s.pending)
    }

    pub fn save_context(&self) {
        self.with_tree(|hw, st| self.tree.save_context(hw, st))
    }

    pub fn restore_context(&self) -> Result<(), ClkError> {
        self.with_tree(|hw, st| self.tree.restore_context(hw, st))
    }

    /// The selector code a channel is applying right now.
    pub fn current_code(&self, ch: ChannelId) -> Result<u8, ClkError> {
        dvs::current_code(&self.hw(), ch)
    }
}
