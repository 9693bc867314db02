// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The clock tree.
//!
//! Nodes are described by [`NodeDesc`] values registered once at startup and
//! never changed afterwards; everything that changes at runtime (reference
//! counts, cached rates, resolved parent and friend handles, saved context)
//! lives in a parallel table of [`NodeState`] behind the tree's spin lock.
//!
//! Parent and friend references are names. They are resolved against the
//! table on first use and the result is cached, so nodes can be registered
//! in any order.
//!
//! Every node is two-phase: `prepare` does the slow part (PLL lock, supply
//! power-up, taking a fast-switch source) and `enable` flips the gate. Both
//! are reference counted independently, and both bring up the node's parent
//! and friend before touching the node itself.

use bitflags::bitflags;
use drv_clk_dvfs_api::{ClkError, ClockId, RegisterPort, SecureOp};

use crate::dvfs_clock::DvfsClockDesc;
use crate::fast_switch::FastSwitchDesc;
use crate::hw::Hw;
use crate::trace::{trace, Trace};
use crate::MAX_NODES;

pub mod divider;
pub mod gate;
pub mod mux;
pub mod pll;

pub use divider::DividerDesc;
pub use gate::{GateDesc, SupplyDesc};
pub use mux::MuxDesc;
pub use pll::{PllControl, PllDesc, PllRate};

use divider::{divisor_for, is_better, rate_for};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct NodeFlags: u16 {
        /// Never gated off once enabled.
        const ALWAYS_ON = 1 << 0;
        /// Rate requests the node cannot meet alone are passed upstream.
        const SET_RATE_PARENT = 1 << 1;
        /// The node's registers lose state in low-power modes with nothing
        /// to restore them from.
        const POWER_COLLAPSED = 1 << 2;
        /// Registers take a write-enable mask in bits 31:16.
        const HIWORD_MASK = 1 << 3;
        /// Dividers round to the nearest achievable rate instead of the
        /// nearest one not above the request.
        const ROUND_CLOSEST = 1 << 4;
    }
}

#[derive(Copy, Clone, Debug)]
pub enum Parents {
    None,
    One(&'static str),
    Many(&'static [&'static str]),
}

impl Parents {
    pub fn get(&self, index: usize) -> Option<&'static str> {
        match *self {
            Parents::None => None,
            Parents::One(name) => (index == 0).then_some(name),
            Parents::Many(names) => names.get(index).copied(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Parents::None => 0,
            Parents::One(_) => 1,
            Parents::Many(names) => names.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Copy, Clone, Debug)]
pub enum NodeKind {
    Fixed { rate: u64 },
    FixedFactor { mult: u32, div: u32 },
    Divider(DividerDesc),
    /// Divider owned by the secure world; `clock` is its secure-side id.
    SecureDivider { clock: u32, max_div: u32 },
    Mux(MuxDesc),
    Gate(GateDesc),
    /// A gate that only exists in hardware when `gateable`; otherwise it is
    /// pure reference counting.
    SoftGate { gate: GateDesc, gateable: bool },
    SecureGate { clock: u32 },
    Pll(PllDesc),
    RegulatorGated { supply: SupplyDesc, gate: GateDesc },
    FastSwitch(&'static FastSwitchDesc),
    /// Voltage-aware front end for its parent; see [`crate::dvfs_clock`].
    Dvfs(&'static DvfsClockDesc),
}

#[derive(Copy, Clone, Debug)]
pub struct NodeDesc {
    pub name: &'static str,
    pub parents: Parents,
    pub friend: Option<&'static str>,
    pub flags: NodeFlags,
    pub kind: NodeKind,
}

impl NodeDesc {
    const fn with(
        name: &'static str,
        parents: Parents,
        kind: NodeKind,
    ) -> Self {
        Self {
            name,
            parents,
            friend: None,
            flags: NodeFlags::empty(),
            kind,
        }
    }

    pub const fn fixed(name: &'static str, rate: u64) -> Self {
        Self::with(name, Parents::None, NodeKind::Fixed { rate })
    }

    pub const fn fixed_factor(
        name: &'static str,
        parent: &'static str,
        mult: u32,
        div: u32,
    ) -> Self {
        Self::with(
            name,
            Parents::One(parent),
            NodeKind::FixedFactor { mult, div },
        )
    }

    pub const fn divider(
        name: &'static str,
        parent: &'static str,
        desc: DividerDesc,
    ) -> Self {
        Self::with(name, Parents::One(parent), NodeKind::Divider(desc))
    }

    pub const fn secure_divider(
        name: &'static str,
        parent: &'static str,
        clock: u32,
        max_div: u32,
    ) -> Self {
        Self::with(
            name,
            Parents::One(parent),
            NodeKind::SecureDivider { clock, max_div },
        )
    }

    pub const fn mux(
        name: &'static str,
        parents: &'static [&'static str],
        desc: MuxDesc,
    ) -> Self {
        Self::with(name, Parents::Many(parents), NodeKind::Mux(desc))
    }

    pub const fn gate(
        name: &'static str,
        parent: &'static str,
        gate: GateDesc,
    ) -> Self {
        Self::with(name, Parents::One(parent), NodeKind::Gate(gate))
    }

    pub const fn soft_gate(
        name: &'static str,
        parent: &'static str,
        gate: GateDesc,
        gateable: bool,
    ) -> Self {
        Self::with(
            name,
            Parents::One(parent),
            NodeKind::SoftGate { gate, gateable },
        )
    }

    pub const fn secure_gate(
        name: &'static str,
        parent: &'static str,
        clock: u32,
    ) -> Self {
        Self::with(name, Parents::One(parent), NodeKind::SecureGate { clock })
    }

    pub const fn pll(name: &'static str, desc: PllDesc) -> Self {
        Self::with(name, Parents::None, NodeKind::Pll(desc))
    }

    pub const fn regulator_gated(
        name: &'static str,
        parent: &'static str,
        supply: SupplyDesc,
        gate: GateDesc,
    ) -> Self {
        Self::with(
            name,
            Parents::One(parent),
            NodeKind::RegulatorGated { supply, gate },
        )
    }

    pub const fn fast_switch(
        name: &'static str,
        desc: &'static FastSwitchDesc,
    ) -> Self {
        Self::with(name, Parents::None, NodeKind::FastSwitch(desc))
    }

    /// A DVFS front end for `target`, whose rate it controls.
    pub const fn dvfs(
        name: &'static str,
        target: &'static str,
        desc: &'static DvfsClockDesc,
    ) -> Self {
        Self::with(name, Parents::One(target), NodeKind::Dvfs(desc))
    }

    pub const fn with_parent(self, parent: &'static str) -> Self {
        Self {
            parents: Parents::One(parent),
            ..self
        }
    }

    pub const fn with_friend(self, friend: &'static str) -> Self {
        Self {
            friend: Some(friend),
            ..self
        }
    }

    pub const fn with_flags(self, flags: NodeFlags) -> Self {
        Self { flags, ..self }
    }

    fn hiword(&self) -> bool {
        self.flags.contains(NodeFlags::HIWORD_MASK)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct NodeState {
    pub prepare_count: u32,
    pub enable_count: u32,
    pub rate: u64,
    pub parent: Option<ClockId>,
    pub friend: Option<ClockId>,
    pub saved: Option<u32>,
    /// DVFS nodes only: a rate accepted while the friend was off.
    pub pending: Option<u64>,
}

pub(crate) type NodeStates = heapless::Vec<NodeState, MAX_NODES>;

fn ndx(id: ClockId) -> usize {
    usize::from(id.0)
}

pub(crate) struct ClockTree {
    nodes: heapless::Vec<NodeDesc, MAX_NODES>,
    state: spin::Mutex<NodeStates>,
}

impl ClockTree {
    pub const fn new() -> Self {
        Self {
            nodes: heapless::Vec::new(),
            state: spin::Mutex::new(heapless::Vec::new()),
        }
    }

    pub fn register(&mut self, desc: NodeDesc) -> Result<ClockId, ClkError> {
        if self.lookup(desc.name).is_some() {
            return Err(ClkError::DuplicateRegistration);
        }
        if let NodeKind::FastSwitch(fs) = &desc.kind {
            fs.validate()?;
        }
        let id = ClockId(self.nodes.len() as u16);
        self.nodes.push(desc).map_err(|_| ClkError::TableFull)?;
        self.state
            .get_mut()
            .push(NodeState::default())
            .map_err(|_| ClkError::TableFull)?;
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<ClockId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(|i| ClockId(i as u16))
    }

    pub fn resolve(&self, name: &str) -> Result<ClockId, ClkError> {
        self.lookup(name).ok_or(ClkError::NoSuchClock)
    }

    pub fn desc(&self, id: ClockId) -> Result<&NodeDesc, ClkError> {
        self.nodes.get(ndx(id)).ok_or(ClkError::NoSuchClock)
    }

    pub fn ids(&self) -> impl Iterator<Item = ClockId> {
        (0..self.nodes.len()).map(|i| ClockId(i as u16))
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, NodeStates> {
        self.state.lock()
    }

    fn cached(
        &self,
        slot: &mut Option<ClockId>,
        name: &str,
    ) -> Result<ClockId, ClkError> {
        if let Some(id) = *slot {
            return Ok(id);
        }
        let id = self.resolve(name)?;
        *slot = Some(id);
        Ok(id)
    }

    /// The node's current parent. For a mux this is whatever the selector
    /// register says right now.
    pub fn parent<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<Option<ClockId>, ClkError> {
        let desc = self.desc(id)?;
        if let NodeKind::Mux(m) = &desc.kind {
            let index = m.selected(hw);
            let name = desc
                .parents
                .get(usize::from(index))
                .ok_or(ClkError::NoSuchClock)?;
            return self.resolve(name).map(Some);
        }
        match desc.parents.get(0) {
            Some(name) => self.cached(&mut st[ndx(id)].parent, name).map(Some),
            None => Ok(None),
        }
    }

    pub fn friend(
        &self,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<Option<ClockId>, ClkError> {
        match self.desc(id)?.friend {
            Some(name) => self.cached(&mut st[ndx(id)].friend, name).map(Some),
            None => Ok(None),
        }
    }

    pub fn prepare<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<(), ClkError> {
        let desc = self.desc(id)?;
        if st[ndx(id)].prepare_count == 0 {
            let parent = self.parent(hw, st, id)?;
            let friend = self.friend(st, id)?;
            self.deps(hw, st, parent, friend, Self::prepare, Self::unprepare)?;
            if let Err(e) = self.prepare_hw(hw, st, id, desc) {
                self.undo(hw, st, parent, friend, Self::unprepare);
                return Err(e);
            }
            trace!(hw.trace, Trace::Prepare(id));
        }
        st[ndx(id)].prepare_count += 1;
        Ok(())
    }

    pub fn unprepare<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<(), ClkError> {
        let desc = self.desc(id)?;
        let s = &mut st[ndx(id)];
        if s.prepare_count == 0 {
            return Ok(());
        }
        s.prepare_count -= 1;
        if s.prepare_count > 0 || desc.flags.contains(NodeFlags::ALWAYS_ON) {
            return Ok(());
        }

        let r = self.unprepare_hw(hw, st, desc);
        trace!(hw.trace, Trace::Unprepare(id));
        let parent = self.parent(hw, st, id)?;
        let friend = self.friend(st, id)?;
        self.undo(hw, st, parent, friend, Self::unprepare);
        r
    }

    pub fn enable<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<(), ClkError> {
        let desc = self.desc(id)?;
        let s = &st[ndx(id)];
        if s.prepare_count == 0 {
            return Err(ClkError::NotPrepared);
        }
        if s.enable_count == 0 {
            let parent = self.parent(hw, st, id)?;
            let friend = self.friend(st, id)?;
            self.deps(hw, st, parent, friend, Self::enable, Self::disable)?;
            if let Err(e) = self.enable_hw(hw, desc) {
                self.undo(hw, st, parent, friend, Self::disable);
                return Err(e);
            }
            trace!(hw.trace, Trace::Enable(id));
        }
        st[ndx(id)].enable_count += 1;
        Ok(())
    }

    pub fn disable<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<(), ClkError> {
        let desc = self.desc(id)?;
        let s = &mut st[ndx(id)];
        if s.enable_count == 0 {
            return Ok(());
        }
        s.enable_count -= 1;
        if s.enable_count > 0 || desc.flags.contains(NodeFlags::ALWAYS_ON) {
            return Ok(());
        }

        let r = self.disable_hw(hw, desc);
        trace!(hw.trace, Trace::Disable(id));
        let parent = self.parent(hw, st, id)?;
        let friend = self.friend(st, id)?;
        self.undo(hw, st, parent, friend, Self::disable);
        r
    }

    pub fn prepare_enable<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<(), ClkError> {
        self.prepare(hw, st, id)?;
        self.enable(hw, st, id).inspect_err(|_| {
            let _ = self.unprepare(hw, st, id);
        })
    }

    pub fn disable_unprepare<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<(), ClkError> {
        let r = self.disable(hw, st, id);
        self.unprepare(hw, st, id).and(r)
    }

    /// Applies `up` to the parent, then the friend, undoing the parent if
    /// the friend fails.
    fn deps<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        parent: Option<ClockId>,
        friend: Option<ClockId>,
        up: Step<P>,
        down: Step<P>,
    ) -> Result<(), ClkError> {
        if let Some(p) = parent {
            up(self, hw, st, p)?;
        }
        if let Some(f) = friend {
            if let Err(e) = up(self, hw, st, f) {
                self.undo(hw, st, parent, None, down);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Applies `down` to the friend, then the parent. Failures on the way
    /// down are already traced where they happen and cannot be acted on.
    fn undo<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        parent: Option<ClockId>,
        friend: Option<ClockId>,
        down: Step<P>,
    ) {
        if let Some(f) = friend {
            let _ = down(self, hw, st, f);
        }
        if let Some(p) = parent {
            let _ = down(self, hw, st, p);
        }
    }

    fn prepare_hw<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
        desc: &NodeDesc,
    ) -> Result<(), ClkError> {
        match &desc.kind {
            NodeKind::Pll(pll) => pll.enable(hw, id, desc.hiword()),
            NodeKind::RegulatorGated { supply, .. } => {
                supply.power_up(hw, id, desc.hiword())
            }
            NodeKind::FastSwitch(fs) => self.fast_switch_acquire(hw, st, fs),
            _ => Ok(()),
        }
    }

    fn unprepare_hw<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        desc: &NodeDesc,
    ) -> Result<(), ClkError> {
        match &desc.kind {
            NodeKind::Pll(pll) => pll.disable(hw, desc.hiword()),
            NodeKind::RegulatorGated { supply, .. } => {
                supply.power_down(hw, desc.hiword());
                Ok(())
            }
            NodeKind::FastSwitch(fs) => self.fast_switch_release(hw, st, fs),
            _ => Ok(()),
        }
    }

    fn hw_gate(desc: &NodeDesc) -> Option<&GateDesc> {
        match &desc.kind {
            NodeKind::Gate(gate)
            | NodeKind::RegulatorGated { gate, .. }
            | NodeKind::SoftGate {
                gate,
                gateable: true,
            } => Some(gate),
            NodeKind::FastSwitch(fs) => fs.gate.as_ref(),
            _ => None,
        }
    }

    fn enable_hw<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        desc: &NodeDesc,
    ) -> Result<(), ClkError> {
        if let NodeKind::SecureGate { clock } = desc.kind {
            return hw
                .secure(SecureOp::GateEnable, [clock, 0, 0, 0])
                .map(|_| ());
        }
        if let Some(gate) = Self::hw_gate(desc) {
            gate.set(hw, true, desc.hiword());
        }
        Ok(())
    }

    fn disable_hw<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        desc: &NodeDesc,
    ) -> Result<(), ClkError> {
        if let NodeKind::SecureGate { clock } = desc.kind {
            return hw
                .secure(SecureOp::GateDisable, [clock, 0, 0, 0])
                .map(|_| ());
        }
        if let Some(gate) = Self::hw_gate(desc) {
            gate.set(hw, false, desc.hiword());
        }
        Ok(())
    }

    /// Hardware enable state where the hardware can report it, otherwise
    /// the software view.
    pub fn is_enabled<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &NodeStates,
        id: ClockId,
    ) -> Result<bool, ClkError> {
        let desc = self.desc(id)?;
        let s = &st[ndx(id)];
        if let Some(gate) = Self::hw_gate(desc) {
            return Ok(gate.is_set(hw));
        }
        Ok(match &desc.kind {
            NodeKind::Pll(pll) => {
                pll.is_enabled(hw).unwrap_or(s.prepare_count > 0)
            }
            _ => s.enable_count > 0,
        })
    }

    pub fn enable_count(&self, st: &NodeStates, id: ClockId) -> u32 {
        st.get(ndx(id)).map_or(0, |s| s.enable_count)
    }

    fn parent_rate<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<u64, ClkError> {
        match self.parent(hw, st, id)? {
            Some(p) => self.rate(hw, st, p),
            None => Ok(0),
        }
    }

    /// Recomputes the node's rate from hardware and caches it.
    pub fn rate<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
    ) -> Result<u64, ClkError> {
        let desc = self.desc(id)?;
        let rate = match &desc.kind {
            NodeKind::Fixed { rate } => *rate,
            NodeKind::FixedFactor { mult, div } => {
                self.parent_rate(hw, st, id)? * u64::from(*mult)
                    / u64::from((*div).max(1))
            }
            NodeKind::Divider(d) => {
                rate_for(self.parent_rate(hw, st, id)?, d.read(hw))
            }
            NodeKind::SecureDivider { clock, .. } => {
                let parent_rate = self.parent_rate(hw, st, id)?;
                let [div, ..] =
                    hw.secure(SecureOp::DividerRead, [*clock, 0, 0, 0])?;
                rate_for(parent_rate, div)
            }
            NodeKind::Pll(pll) => pll.rate(hw)?,
            NodeKind::FastSwitch(fs) => fs.rate(hw),
            _ => self.parent_rate(hw, st, id)?,
        };
        st[ndx(id)].rate = rate;
        Ok(rate)
    }

    /// The rate the node would run at if asked for `rate`, without touching
    /// hardware state.
    pub fn round_rate<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
        rate: u64,
    ) -> Result<u64, ClkError> {
        let desc = self.desc(id)?;
        let upstream = desc.flags.contains(NodeFlags::SET_RATE_PARENT);
        match &desc.kind {
            NodeKind::Fixed { rate } => Ok(*rate),
            NodeKind::FixedFactor { mult, div } => {
                let (mult, div) =
                    (u64::from((*mult).max(1)), u64::from((*div).max(1)));
                let parent_rate = match self.parent(hw, st, id)? {
                    Some(p) if upstream => self.round_rate(
                        hw,
                        st,
                        p,
                        rate.saturating_mul(div) / mult,
                    )?,
                    _ => self.parent_rate(hw, st, id)?,
                };
                Ok(parent_rate * mult / div)
            }
            NodeKind::Divider(d) => {
                let (div, parent_rate) =
                    self.choose_divisor(hw, st, id, d.max_div(), rate)?;
                Ok(rate_for(parent_rate, div))
            }
            NodeKind::SecureDivider { max_div, .. } => {
                let (div, parent_rate) =
                    self.choose_divisor(hw, st, id, *max_div, rate)?;
                Ok(rate_for(parent_rate, div))
            }
            NodeKind::Mux(_) => match self.parent(hw, st, id)? {
                Some(p) if upstream => self.round_rate(hw, st, p, rate),
                _ => self.choose_parent(hw, st, id, rate).map(|(_, r)| r),
            },
            NodeKind::Pll(pll) => Ok(pll.round_rate(rate)),
            NodeKind::FastSwitch(fs) => Ok(fs.round_rate(rate)),
            NodeKind::Dvfs(_) => match self.parent(hw, st, id)? {
                Some(p) => self.round_rate(hw, st, p, rate),
                None => Ok(0),
            },
            _ => match self.parent(hw, st, id)? {
                Some(p) if upstream => self.round_rate(hw, st, p, rate),
                _ => self.parent_rate(hw, st, id),
            },
        }
    }

    /// Picks a divisor for `rate`, returning it with the parent rate it
    /// assumes. With `SET_RATE_PARENT`, every divisor is tried against the
    /// parent's best rate for it.
    fn choose_divisor<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
        max_div: u32,
        rate: u64,
    ) -> Result<(u32, u64), ClkError> {
        let flags = self.desc(id)?.flags;
        let closest = flags.contains(NodeFlags::ROUND_CLOSEST);
        let Some(parent) = self.parent(hw, st, id)? else {
            return Ok((1, 0));
        };
        let current = self.rate(hw, st, parent)?;
        if !flags.contains(NodeFlags::SET_RATE_PARENT) {
            return Ok((divisor_for(current, rate, max_div, closest), current));
        }

        let mut best: Option<(u32, u64)> = None;
        let mut best_rate = 0;
        for div in 1..=max_div.max(1) {
            let want = rate.saturating_mul(u64::from(div));
            if want == current {
                return Ok((div, current));
            }
            let parent_rate = self.round_rate(hw, st, parent, want)?;
            let now = rate_for(parent_rate, div);
            if is_better(rate, now, best_rate, closest) {
                best = Some((div, parent_rate));
                best_rate = now;
            }
        }
        match best {
            Some(best) => Ok(best),
            None => {
                let slowest = self.round_rate(hw, st, parent, 1)?;
                Ok((max_div.max(1), slowest))
            }
        }
    }

    /// Picks the mux input whose current rate best matches `rate`: the
    /// fastest one not above it, or the slowest overall if all are above.
    /// With `ROUND_CLOSEST`, simply the nearest.
    fn choose_parent<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
        rate: u64,
    ) -> Result<(u8, u64), ClkError> {
        let desc = self.desc(id)?;
        let closest = desc.flags.contains(NodeFlags::ROUND_CLOSEST);
        let mut below: Option<(u8, u64)> = None;
        let mut above: Option<(u8, u64)> = None;
        for index in 0..desc.parents.len() {
            let Some(p) = desc.parents.get(index).and_then(|n| self.lookup(n))
            else {
                continue;
            };
            let r = self.rate(hw, st, p)?;
            let cand = (index as u8, r);
            if closest {
                if below.map_or(true, |(_, b)| rate.abs_diff(r) < rate.abs_diff(b)) {
                    below = Some(cand);
                }
            } else if r <= rate {
                if below.map_or(true, |(_, b)| r > b) {
                    below = Some(cand);
                }
            } else if above.map_or(true, |(_, a)| r < a) {
                above = Some(cand);
            }
        }
        below.or(above).ok_or(ClkError::NoSuchClock)
    }

    pub fn set_rate<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
        rate: u64,
    ) -> Result<(), ClkError> {
        let desc = self.desc(id)?;
        let upstream = desc.flags.contains(NodeFlags::SET_RATE_PARENT);
        let parent = self.parent(hw, st, id)?.filter(|_| upstream);

        match &desc.kind {
            NodeKind::Fixed { rate: fixed } => {
                if *fixed != rate {
                    return Err(ClkError::InvalidRateRequest);
                }
            }
            NodeKind::FixedFactor { mult, div } => match parent {
                Some(p) => {
                    let want = rate.saturating_mul(u64::from((*div).max(1)))
                        / u64::from((*mult).max(1));
                    self.set_rate(hw, st, p, want)?;
                }
                None => {
                    if self.round_rate(hw, st, id, rate)? != rate {
                        return Err(ClkError::InvalidRateRequest);
                    }
                }
            },
            NodeKind::Divider(d) => {
                let (div, parent_rate) =
                    self.choose_divisor(hw, st, id, d.max_div(), rate)?;
                if let Some(p) = parent {
                    if st[ndx(p)].rate != parent_rate {
                        self.set_rate(hw, st, p, parent_rate)?;
                    }
                }
                d.write(hw, id, div, desc.hiword())?;
            }
            NodeKind::SecureDivider { clock, max_div } => {
                let (div, parent_rate) =
                    self.choose_divisor(hw, st, id, *max_div, rate)?;
                if let Some(p) = parent {
                    if st[ndx(p)].rate != parent_rate {
                        self.set_rate(hw, st, p, parent_rate)?;
                    }
                }
                hw.secure(SecureOp::DividerWrite, [*clock, div, 0, 0])?;
                trace!(hw.trace, Trace::Divider { clock: id, div });
            }
            NodeKind::Mux(_) => match parent {
                Some(p) => self.set_rate(hw, st, p, rate)?,
                None => {
                    let (index, _) = self.choose_parent(hw, st, id, rate)?;
                    self.set_parent(hw, st, id, index)?;
                }
            },
            NodeKind::Pll(pll) => pll.set_rate(hw, rate)?,
            NodeKind::FastSwitch(fs) => self.fast_switch(hw, st, id, fs, rate)?,
            NodeKind::Dvfs(_) => return Err(ClkError::Unsupported),
            _ => match parent {
                Some(p) => self.set_rate(hw, st, p, rate)?,
                None => {
                    if self.parent_rate(hw, st, id)? != rate {
                        return Err(ClkError::InvalidRateRequest);
                    }
                }
            },
        }

        let now = self.rate(hw, st, id)?;
        trace!(hw.trace, Trace::Rate { clock: id, rate: now });
        Ok(())
    }

    /// Switches a mux to input `index`. A prepared or enabled mux takes the
    /// same references on its new parent before switching and drops those
    /// on its old parent afterwards.
    pub fn set_parent<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
        id: ClockId,
        index: u8,
    ) -> Result<(), ClkError> {
        let desc = self.desc(id)?;
        let NodeKind::Mux(mux) = &desc.kind else {
            return Err(ClkError::Unsupported);
        };
        let name = desc
            .parents
            .get(usize::from(index))
            .ok_or(ClkError::NoSuchClock)?;
        let new = self.resolve(name)?;
        let old = self.parent(hw, st, id)?;
        if old == Some(new) {
            return Ok(());
        }

        let s = st[ndx(id)];
        let (prepared, enabled) = (s.prepare_count > 0, s.enable_count > 0);
        if prepared {
            self.prepare(hw, st, new)?;
        }
        if enabled {
            if let Err(e) = self.enable(hw, st, new) {
                let _ = self.unprepare(hw, st, new);
                return Err(e);
            }
        }

        if let Err(e) = mux.select(hw, id, index, desc.hiword()) {
            if enabled {
                let _ = self.disable(hw, st, new);
            }
            if prepared {
                let _ = self.unprepare(hw, st, new);
            }
            return Err(e);
        }

        if let Some(old) = old {
            if enabled {
                self.disable(hw, st, old)?;
            }
            if prepared {
                self.unprepare(hw, st, old)?;
            }
        }
        self.rate(hw, st, id)?;
        Ok(())
    }

    /// Records the divider and mux settings that would be lost across a
    /// power-down. Secure nodes keep their state on the secure side and
    /// power-collapsed nodes have nothing worth keeping.
    pub fn save_context<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
    ) {
        for (i, desc) in self.nodes.iter().enumerate() {
            if desc.flags.contains(NodeFlags::POWER_COLLAPSED) {
                continue;
            }
            let field = match &desc.kind {
                NodeKind::Divider(d) => d.field,
                NodeKind::Mux(m) => m.field,
                _ => continue,
            };
            let value = hw.read_field(&field);
            st[i].saved = Some(value);
            trace!(
                hw.trace,
                Trace::ContextSaved {
                    clock: ClockId(i as u16),
                    value,
                }
            );
        }
    }

    /// Reapplies everything [`ClockTree::save_context`] recorded. Every node
    /// is attempted; the first failure is returned.
    pub fn restore_context<P: RegisterPort>(
        &self,
        hw: &Hw<'_, P>,
        st: &mut NodeStates,
    ) -> Result<(), ClkError> {
        let mut result = Ok(());
        for (i, desc) in self.nodes.iter().enumerate() {
            let Some(value) = st[i].saved.take() else {
                continue;
            };
            let clock = ClockId(i as u16);
            let r = match &desc.kind {
                NodeKind::Divider(d) => {
                    d.write(hw, clock, value + 1, desc.hiword())
                }
                NodeKind::Mux(m) => {
                    m.select(hw, clock, value as u8, desc.hiword())
                }
                _ => Ok(()),
            };
            trace!(hw.trace, Trace::ContextRestored { clock, value });
            result = result.and(r);
        }
        result
    }
}

type Step<P> = fn(
    &ClockTree,
    &Hw<'_, P>,
    &mut NodeStates,
    ClockId,
) -> Result<(), ClkError>;
