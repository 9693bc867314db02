// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Voltage votes.
//!
//! Each consumer of a shared supply registers a vote naming its channel,
//! optionally its shared-bus domain, and a per-tier millivolt table. The
//! public entry points here take the driver's reentrant lock, find the vote
//! and hand off to the arbitrator.

use core::cell::Cell;

use drv_clk_dvfs_api::{
    ChannelId, ClkError, DomainId, RegField, RegisterPort, VoteId,
};

use crate::arbiter::Completion;
use crate::{dvs, ClkDvfs, MAX_TIERS, MAX_VOTES};

#[derive(Copy, Clone, Debug)]
pub struct VoteDesc {
    pub id: VoteId,
    pub name: &'static str,
    pub channel: ChannelId,
    pub domain: Option<DomainId>,
    /// Supply voltage for each tier, in mV.
    pub millivolts: &'static [u32],
    /// Selector code to mV: `code * step_mv + base_mv`.
    pub step_mv: u32,
    pub base_mv: u32,
    /// Where the last accepted tier is recorded for tooling, if anywhere.
    pub record: Option<RegField>,
}

impl VoteDesc {
    pub const fn new(
        id: VoteId,
        name: &'static str,
        channel: ChannelId,
        millivolts: &'static [u32],
    ) -> Self {
        Self {
            id,
            name,
            channel,
            domain: None,
            millivolts,
            step_mv: 0,
            base_mv: 0,
            record: None,
        }
    }

    pub const fn with_domain(self, domain: DomainId) -> Self {
        Self {
            domain: Some(domain),
            ..self
        }
    }

    pub const fn with_conversion(self, step_mv: u32, base_mv: u32) -> Self {
        Self {
            step_mv,
            base_mv,
            ..self
        }
    }

    pub const fn with_record(self, record: RegField) -> Self {
        Self {
            record: Some(record),
            ..self
        }
    }

    pub fn code_to_mv(&self, code: u8) -> u32 {
        u32::from(code) * self.step_mv + self.base_mv
    }
}

/// How a caller names a vote. When both are given the name wins.
#[derive(Copy, Clone, Debug)]
pub enum VoteKey<'a> {
    Id(VoteId),
    Name(&'a str),
    Both(VoteId, &'a str),
}

impl From<VoteId> for VoteKey<'_> {
    fn from(id: VoteId) -> Self {
        VoteKey::Id(id)
    }
}

impl<'a> From<&'a str> for VoteKey<'a> {
    fn from(name: &'a str) -> Self {
        VoteKey::Name(name)
    }
}

pub(crate) struct Vote {
    pub desc: VoteDesc,
    pub tier: Cell<u8>,
}

pub(crate) struct VoteRegistry {
    votes: heapless::Vec<Vote, MAX_VOTES>,
}

impl VoteRegistry {
    pub const fn new() -> Self {
        Self {
            votes: heapless::Vec::new(),
        }
    }

    pub fn register(&mut self, desc: VoteDesc) -> Result<(), ClkError> {
        if self
            .votes
            .iter()
            .any(|v| v.desc.id == desc.id || v.desc.name == desc.name)
        {
            return Err(ClkError::DuplicateRegistration);
        }
        if desc.millivolts.is_empty() || desc.millivolts.len() > MAX_TIERS {
            return Err(ClkError::InvalidChannelOrVote);
        }
        self.votes
            .push(Vote {
                desc,
                tier: Cell::new(0),
            })
            .map_err(|_| ClkError::TableFull)
    }

    pub fn lookup(&self, key: VoteKey<'_>) -> Option<&Vote> {
        let by_id = |id: VoteId| self.votes.iter().find(|v| v.desc.id == id);
        let by_name = |name: &str| self.votes.iter().find(|v| v.desc.name == name);
        match key {
            VoteKey::Id(id) => by_id(id),
            VoteKey::Name(name) => by_name(name),
            VoteKey::Both(id, name) => by_name(name).or_else(|| by_id(id)),
        }
    }

    pub fn on_channel(&self, ch: ChannelId) -> impl Iterator<Item = &Vote> {
        self.votes.iter().filter(move |v| v.desc.channel == ch)
    }
}

impl<P: RegisterPort> ClkDvfs<P> {
    pub fn lookup_vote<'a>(&self, key: impl Into<VoteKey<'a>>) -> Option<VoteId> {
        let state = self.dvfs.lock(self.port.context_id());
        state.votes.lookup(key.into()).map(|v| v.desc.id)
    }

    /// The tier most recently accepted for the vote.
    pub fn vote_tier<'a>(
        &self,
        key: impl Into<VoteKey<'a>>,
    ) -> Result<u8, ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        let vote = state.vote(key.into())?;
        Ok(vote.tier.get())
    }

    /// The voltage the vote's channel is delivering, in mV. While the
    /// maintenance override is active this is the override level and the
    /// hardware is not consulted.
    pub fn get_voltage<'a>(
        &self,
        key: impl Into<VoteKey<'a>>,
    ) -> Result<u32, ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        let vote = state.vote(key.into())?;
        if state.fixed_volt != 0 {
            let tier = (state.fixed_volt - 1) as usize;
            let table = vote.desc.millivolts;
            return table
                .get(tier)
                .or(table.last())
                .copied()
                .ok_or(ClkError::InvalidChannelOrVote);
        }
        let code = dvs::current_code(&self.hw(), vote.desc.channel)?;
        Ok(vote.desc.code_to_mv(code))
    }

    pub fn get_voltage_by_tier<'a>(
        &self,
        key: impl Into<VoteKey<'a>>,
        tier: u8,
    ) -> Result<u32, ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        let vote = state.vote(key.into())?;
        vote.desc
            .millivolts
            .get(usize::from(tier))
            .copied()
            .ok_or(ClkError::InvalidChannelOrVote)
    }

    /// Requests `tier` for the vote and drives the channel to the new
    /// aggregate. Raising waits for the regulator; lowering waits only if
    /// the platform may idle.
    pub fn set_voltage<'a>(
        &self,
        key: impl Into<VoteKey<'a>>,
        tier: u8,
    ) -> Result<(), ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        let vote = state.vote(key.into())?;
        self.set_vote_tier_locked(&state, vote, tier, Completion::Settle)
    }

    /// As [`ClkDvfs::set_voltage`], but returns once the channel has
    /// accepted the request. Finish with [`ClkDvfs::wait_completed`].
    pub fn set_voltage_nowait<'a>(
        &self,
        key: impl Into<VoteKey<'a>>,
        tier: u8,
    ) -> Result<(), ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        let vote = state.vote(key.into())?;
        self.set_vote_tier_locked(&state, vote, tier, Completion::NoWait)
    }

    pub fn wait_completed<'a>(
        &self,
        key: impl Into<VoteKey<'a>>,
    ) -> Result<(), ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        let vote = state.vote(key.into())?;
        dvs::wait_ack(&self.hw(), vote.desc.channel)
    }

    /// Whether the low-temperature condition applies to this vote.
    pub fn vote_is_low_temperature<'a>(
        &self,
        key: impl Into<VoteKey<'a>>,
    ) -> Result<bool, ClkError> {
        let state = self.dvfs.lock(self.port.context_id());
        state.vote(key.into())?;
        Ok(self.is_low_temperature())
    }
}
