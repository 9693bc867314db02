// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event ring for the clock driver.
//!
//! Every interesting thing the driver does (hardware handshakes, tier
//! changes, timeouts, diagnostic register dumps) is recorded as a [`Trace`]
//! entry in a fixed-size ring owned by the [`ClkDvfs`](crate::ClkDvfs)
//! handle. Entries carry the source line that produced them and a
//! generation number; an entry identical to the most recent one (same line,
//! same payload) bumps that entry's count instead of consuming a slot, so a
//! polling loop that logs the same thing over and over costs one entry.
//!
//! The ring is read back with [`ClkDvfs::trace_snapshot`](crate::ClkDvfs::trace_snapshot).

use drv_clk_dvfs_api::{ChannelId, ClockId, DomainId, SecureOp, VoteId};

pub const TRACE_DEPTH: usize = 64;

pub(crate) type TraceBuf = spin::Mutex<Ringbuf<Trace, TRACE_DEPTH>>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,

    Prepare(ClockId),
    Unprepare(ClockId),
    Enable(ClockId),
    Disable(ClockId),
    Rate { clock: ClockId, rate: u64 },
    Divider { clock: ClockId, div: u32 },
    Parent { clock: ClockId, index: u8 },
    MuxAckTimeout { clock: ClockId, expected: u8, ack: u32 },
    DividerAckTimeout(ClockId),
    PllLockTimeout(ClockId),
    SupplyTimeout(ClockId),
    SecureFailure { op: SecureOp, status: u32 },
    FastSwitch { clock: ClockId, from: u8, to: u8, transitional: u32 },
    ContextSaved { clock: ClockId, value: u32 },
    ContextRestored { clock: ClockId, value: u32 },

    DvsWrite { channel: ChannelId, code: u8 },
    DvsBusyTimeout(ChannelId),
    DvsInterruptRaw(ChannelId),
    DvsDump { offset: u32, value: u32 },
    DvsIrq(u32),

    VoteTier { vote: VoteId, from: u8, to: u8 },
    VoteRollback { vote: VoteId, tier: u8 },
    FixedVoltRejected { vote: VoteId, tier: u8 },
    ChannelTier { channel: ChannelId, tier: u8 },
    LowTempClamp { channel: ChannelId, from: u8, to: u8 },
    DomainLower { domain: DomainId, from: u8, to: u8 },
    DomainRaise { domain: DomainId, from: u8, to: u8 },
    DomainRollback { domain: DomainId, tier: u8 },
    DomainStale(DomainId),
    DvfsPending { clock: ClockId, rate: u64 },
}

/// Records `payload` in the ring behind `buf` (a `&TraceBuf`), tagged with
/// the current source line.
macro_rules! trace {
    ($buf:expr, $payload:expr) => {{
        let (p, buf) = ($payload, &$buf);
        $crate::trace::Ringbuf::entry(&mut *buf.lock(), line!() as u16, p);
    }};
}
pub(crate) use trace;

#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug, Copy, Clone)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // None is treated as an out-of-range index, which both skips the
        // dedup check and makes the first entry land in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let next = last.wrapping_add(1);
            if next >= self.buffer.len() {
                0
            } else {
                next
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Iterates over recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => self.buffer.len(),
        };
        let (newer, older) = self.buffer.split_at(start.min(N));
        older
            .iter()
            .chain(newer.iter())
            .filter(|ent| ent.count != 0)
    }

    /// Iterates over recorded payloads, oldest first.
    pub fn payloads(&self) -> impl Iterator<Item = T> + '_ {
        self.iter().map(|ent| ent.payload)
    }
}
