// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Voltage arbitration and frequency/voltage ordering.
//!
//! A channel delivers the highest tier any of its votes asks for, clamped
//! to its domain's low-temperature cap while that condition is signaled.
//! If a shared-bus domain sits on the channel, the domain's link clocks are
//! moved with it, always in the order that keeps every clock within what
//! the supply can carry at that instant:
//!
//! - going down (or staying put): slow the links, then lower the voltage;
//! - going up: raise the voltage, wait for it, then speed up the links.
//!
//! A domain whose friend gate is off has no live hardware to protect, so a
//! vote change there only updates the vote and marks the domain stale. The
//! next top-level `enable` (or an explicit [`ClkDvfs::refresh_domain`])
//! brings it back in line.

use core::cell::Cell;

use drv_clk_dvfs_api::{
    ChannelId, ClkError, ClockId, DomainId, RegisterPort, VoteId,
};

use crate::node::NodeKind;
use crate::registry::{Vote, VoteKey, VoteRegistry};
use crate::trace::{trace, Trace};
use crate::{dvs, ClkDvfs, MAX_CHANNELS, MAX_DOMAINS, MAX_LINKS, MAX_NODES};

/// One clock on a shared bus and its highest rate at each tier.
#[derive(Copy, Clone, Debug)]
pub struct DomainLink {
    pub clock: &'static str,
    pub rates: &'static [u64],
}

impl DomainLink {
    pub const fn new(clock: &'static str, rates: &'static [u64]) -> Self {
        Self { clock, rates }
    }

    /// Rate for `tier`; tiers past the end of the table use its last entry.
    pub fn rate(&self, tier: u8) -> Option<u64> {
        self.rates
            .get(usize::from(tier))
            .or(self.rates.last())
            .copied()
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DomainDesc {
    pub id: DomainId,
    pub channel: ChannelId,
    /// Gate whose state says whether the domain's hardware is live.
    pub friend: &'static str,
    pub links: &'static [DomainLink],
    /// Highest tier allowed while the low-temperature condition holds.
    pub low_temp_cap: Option<u8>,
}

impl DomainDesc {
    pub const fn new(
        id: DomainId,
        channel: ChannelId,
        friend: &'static str,
        links: &'static [DomainLink],
    ) -> Self {
        Self {
            id,
            channel,
            friend,
            links,
            low_temp_cap: None,
        }
    }

    pub const fn with_low_temp_cap(self, cap: u8) -> Self {
        Self {
            low_temp_cap: Some(cap),
            ..self
        }
    }
}

pub(crate) struct Domain {
    pub desc: DomainDesc,
    pub tier: Cell<u8>,
    pub stale: Cell<bool>,
}

pub(crate) struct Channel {
    pub tier: Cell<u8>,
}

/// Everything behind the reentrant vote lock.
pub(crate) struct DvfsState {
    pub votes: VoteRegistry,
    pub channels: heapless::Vec<Channel, MAX_CHANNELS>,
    pub domains: heapless::Vec<Domain, MAX_DOMAINS>,
    /// Maintenance ceiling read at startup; 0 when inactive.
    pub fixed_volt: u32,
}

impl DvfsState {
    pub fn vote(&self, key: VoteKey<'_>) -> Result<&Vote, ClkError> {
        self.votes.lookup(key).ok_or(ClkError::InvalidChannelOrVote)
    }

    pub fn channel(&self, ch: ChannelId) -> Result<&Channel, ClkError> {
        self.channels
            .get(usize::from(ch.0))
            .ok_or(ClkError::InvalidChannelOrVote)
    }

    pub fn domain(&self, id: DomainId) -> Result<&Domain, ClkError> {
        self.domains
            .iter()
            .find(|d| d.desc.id == id)
            .ok_or(ClkError::InvalidChannelOrVote)
    }

    pub fn domain_on(&self, ch: ChannelId) -> Option<&Domain> {
        self.domains.iter().find(|d| d.desc.channel == ch)
    }

    pub fn register_domain(&mut self, desc: DomainDesc) -> Result<(), ClkError> {
        if self
            .domains
            .iter()
            .any(|d| d.desc.id == desc.id || d.desc.channel == desc.channel)
        {
            return Err(ClkError::DuplicateRegistration);
        }
        if desc.links.len() > MAX_LINKS {
            return Err(ClkError::TableFull);
        }
        if usize::from(desc.channel.0) >= self.channels.len() {
            return Err(ClkError::InvalidChannelOrVote);
        }
        self.domains
            .push(Domain {
                desc,
                tier: Cell::new(0),
                stale: Cell::new(false),
            })
            .map_err(|_| ClkError::TableFull)
    }
}

/// When a voltage request waits for the regulator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Completion {
    /// Raising always waits; lowering waits if the platform may idle.
    Settle,
    /// Never waits, except where a domain's links are about to be raised.
    NoWait,
}

impl Completion {
    fn wait(self, raising: bool, idle_allowed: bool) -> bool {
        match self {
            Completion::Settle => raising || idle_allowed,
            Completion::NoWait => false,
        }
    }
}

impl<P: RegisterPort> ClkDvfs<P> {
    pub(crate) fn set_vote_tier_locked(
        &self,
        state: &DvfsState,
        vote: &Vote,
        tier: u8,
        completion: Completion,
    ) -> Result<(), ClkError> {
        let id = vote.desc.id;
        if usize::from(tier) >= vote.desc.millivolts.len() {
            return Err(ClkError::InvalidChannelOrVote);
        }
        if state.fixed_volt != 0 && u32::from(tier) + 1 > state.fixed_volt {
            trace!(self.trace, Trace::FixedVoltRejected { vote: id, tier });
            return Err(ClkError::FixedVoltageCeilingExceeded);
        }

        let old = vote.tier.replace(tier);
        trace!(
            self.trace,
            Trace::VoteTier {
                vote: id,
                from: old,
                to: tier,
            }
        );
        if let Err(e) = self.commit_channel(state, vote.desc.channel, completion)
        {
            vote.tier.set(old);
            trace!(self.trace, Trace::VoteRollback { vote: id, tier: old });
            return Err(e);
        }

        if let Some(record) = &vote.desc.record {
            self.hw().write_field(record, u32::from(tier), false);
        }
        Ok(())
    }

    /// Highest tier voted on `ch`, after the low-temperature clamp.
    pub(crate) fn aggregate(&self, state: &DvfsState, ch: ChannelId) -> u8 {
        let max = state
            .votes
            .on_channel(ch)
            .map(|v| v.tier.get())
            .max()
            .unwrap_or(0);
        let cap = state.domain_on(ch).and_then(|d| d.desc.low_temp_cap);
        match cap {
            Some(cap) if cap < max && self.is_low_temperature() => {
                trace!(
                    self.trace,
                    Trace::LowTempClamp {
                        channel: ch,
                        from: max,
                        to: cap,
                    }
                );
                cap
            }
            _ => max,
        }
    }

    fn commit_channel(
        &self,
        state: &DvfsState,
        ch: ChannelId,
        completion: Completion,
    ) -> Result<(), ClkError> {
        let channel = state.channel(ch)?;
        let target = self.aggregate(state, ch);

        if let Some(domain) = state.domain_on(ch) {
            if !self.friend_enabled(domain)? {
                domain.stale.set(true);
                trace!(self.trace, Trace::DomainStale(domain.desc.id));
                return Ok(());
            }
            return self.apply_domain(state, domain, target, completion);
        }

        let raising = target > channel.tier.get();
        let wait = completion.wait(raising, self.port.idle_allowed());
        dvs::write_code(&self.hw(), ch, target, wait)?;
        channel.tier.set(target);
        trace!(self.trace, Trace::ChannelTier { channel: ch, tier: target });
        Ok(())
    }

    fn friend_enabled(&self, domain: &Domain) -> Result<bool, ClkError> {
        let friend = self.tree.resolve(domain.desc.friend)?;
        let st = self.tree.lock();
        Ok(self.tree.enable_count(&st, friend) > 0)
    }

    /// Moves a domain to `target`, ordering link-rate changes against the
    /// voltage write.
    fn apply_domain(
        &self,
        state: &DvfsState,
        domain: &Domain,
        target: u8,
        completion: Completion,
    ) -> Result<(), ClkError> {
        let ch = domain.desc.channel;
        let channel = state.channel(ch)?;
        let cur = domain.tier.get();
        let hw = self.hw();

        if cur >= target {
            trace!(
                self.trace,
                Trace::DomainLower {
                    domain: domain.desc.id,
                    from: cur,
                    to: target,
                }
            );
            self.set_link_rates(domain, target)?;
            let wait = completion.wait(false, self.port.idle_allowed());
            dvs::write_code(&hw, ch, target, wait)?;
            channel.tier.set(target);
        } else {
            trace!(
                self.trace,
                Trace::DomainRaise {
                    domain: domain.desc.id,
                    from: cur,
                    to: target,
                }
            );
            dvs::write_code(&hw, ch, target, true)?;
            channel.tier.set(target);
            if let Err(e) = self.set_link_rates(domain, target) {
                // Undo in lowering order: links, then the channel.
                let _ = self.set_link_rates(domain, cur);
                if dvs::write_code(&hw, ch, cur, false).is_ok() {
                    channel.tier.set(cur);
                }
                trace!(
                    self.trace,
                    Trace::DomainRollback {
                        domain: domain.desc.id,
                        tier: cur,
                    }
                );
                return Err(e);
            }
        }

        domain.tier.set(target);
        domain.stale.set(false);
        trace!(self.trace, Trace::ChannelTier { channel: ch, tier: target });
        Ok(())
    }

    fn set_link_rates(&self, domain: &Domain, tier: u8) -> Result<(), ClkError> {
        let hw = self.hw();
        for link in domain.desc.links {
            let Some(rate) = link.rate(tier) else {
                continue;
            };
            let id = self.tree.resolve(link.clock)?;
            let mut st = self.tree.lock();
            self.tree.set_rate(&hw, &mut st, id, rate)?;
        }
        Ok(())
    }

    /// Requests `tier` on behalf of vote `vote`.
    pub fn set_vote_tier(&self, vote: VoteId, tier: u8) -> Result<(), ClkError> {
        self.set_voltage(VoteKey::Id(vote), tier)
    }

    /// Reapplies a domain's aggregate tier through the ordered sequence.
    /// Leaves it marked stale if its friend is still off.
    pub fn refresh_domain(&self, id: DomainId) -> Result<(), ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        let domain = state.domain(id)?;
        if !self.friend_enabled(domain)? {
            domain.stale.set(true);
            return Ok(());
        }
        let target = self.aggregate(&state, domain.desc.channel);
        self.apply_domain(&state, domain, target, Completion::Settle)
    }

    /// Catches up every stale domain and every pending DVFS rate whose
    /// friend has come back on.
    pub(crate) fn resync(&self) -> Result<(), ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        for domain in state.domains.iter().filter(|d| d.stale.get()) {
            if self.friend_enabled(domain)? {
                let target = self.aggregate(&state, domain.desc.channel);
                self.apply_domain(&state, domain, target, Completion::Settle)?;
            }
        }

        let mut pending: heapless::Vec<(ClockId, u64), MAX_NODES> =
            heapless::Vec::new();
        {
            let mut st = self.tree.lock();
            for id in self.tree.ids() {
                let i = usize::from(id.0);
                let Some(rate) = st[i].pending else {
                    continue;
                };
                let live = match self.tree.friend(&mut st, id)? {
                    Some(f) => self.tree.enable_count(&st, f) > 0,
                    None => true,
                };
                if live {
                    // Capacity matches the node table.
                    let _ = pending.push((id, rate));
                }
            }
        }
        for (id, rate) in pending {
            if let Ok(NodeKind::Dvfs(dvfs)) = self.tree.desc(id).map(|d| d.kind)
            {
                self.set_dvfs_rate(id, dvfs, rate)?;
            }
        }
        Ok(())
    }

    /// Tier last committed to `ch`.
    pub fn committed_tier(&self, ch: ChannelId) -> Result<u8, ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        Ok(state.channel(ch)?.tier.get())
    }

    pub fn domain_tier(&self, id: DomainId) -> Result<u8, ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        Ok(state.domain(id)?.tier.get())
    }

    pub fn domain_is_stale(&self, id: DomainId) -> Result<bool, ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        Ok(state.domain(id)?.stale.get())
    }

    /// Maintenance ceiling read at startup; 0 when inactive.
    pub fn fixed_volt_override(&self) -> u32 {
        self.dvfs.lock(self.port.context_id()).fixed_volt
    }

    pub fn is_low_temperature(&self) -> bool {
        match &self.config.low_temperature {
            Some(bit) => self.hw().bit(bit),
            None => false,
        }
    }

    /// Services the voltage channel timeout interrupt; returns the mask of
    /// channels that had timed out.
    pub fn handle_dvs_interrupt(&self) -> u32 {
        dvs::handle_interrupt(&self.hw())
    }
}
