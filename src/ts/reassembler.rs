//! PCR-aligned MPEG-TS reassembly.
//!
//! Bytes are accumulated until either the flush threshold or the minimum
//! flush interval is reached. A flush aligns the buffer on a packet start,
//! walks the 188-byte packets recording every PCR, skips PCRs that were
//! already delivered by an earlier flush and emits the range between the
//! first new PCR and the last one. Everything from the last PCR onwards stays
//! buffered, since that packet group may still be incomplete.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use super::TsError;
use super::packet::{PACKET_SIZE, check_sync, next_aligned_sync, next_sync, read_pcr};

const DEFAULT_FLUSH_THRESHOLD: usize = 5 * 512 * 1024;
const DEFAULT_HARD_CAP: usize = 10 * 1024 * 1024;
const DEFAULT_MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

const INITIAL_PCR_JOURNAL: usize = 2048;
const MAX_PCR_JOURNAL: usize = 100_000;
/// Flushes worth of PCRs kept in the journal (roughly one minute of stream).
const PCR_JOURNAL_FLUSHES: usize = 60;

const MAX_CONSECUTIVE_ANOMALIES: usize = 3;

/// What to do with a packet whose successor does not start exactly one
/// packet later.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterPolicy {
    /// Keep the packet at its anomalous size
    Bypass,
    /// Cut the packet back to 188 bytes, dropping the trailing garbage
    #[default]
    Trim,
    /// Drop the packet entirely
    Remove,
}

impl FilterPolicy {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Bypass),
            1 => Some(Self::Trim),
            2 => Some(Self::Remove),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReassemblerOptions {
    pub policy: FilterPolicy,
    /// Buffered size that triggers a flush regardless of the interval
    pub flush_threshold: usize,
    /// Buffered size past which a PCR-less stream is declared starved
    pub hard_cap: usize,
    pub min_flush_interval: Duration,
}

impl Default for ReassemblerOptions {
    fn default() -> Self {
        Self {
            policy: FilterPolicy::default(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            hard_cap: DEFAULT_HARD_CAP,
            min_flush_interval: DEFAULT_MIN_FLUSH_INTERVAL,
        }
    }
}

/// Result of walking an aligned buffer.
struct Walk {
    /// Packets as kept by the filter policy, followed by any trailing partial packet
    data: Vec<u8>,
    /// PCR values with their offsets into `data`, in stream order
    pcrs: Vec<(u64, usize)>,
}

pub struct PacketReassembler {
    opts: ReassemblerOptions,
    pending: Vec<u8>,
    last_flush: Option<Instant>,
    seen_order: VecDeque<u64>,
    seen: HashSet<u64>,
    journal_capacity: usize,
    destroyed: bool,
}

impl PacketReassembler {
    pub fn new(opts: ReassemblerOptions) -> Self {
        Self {
            opts,
            pending: Vec::new(),
            last_flush: None,
            seen_order: VecDeque::with_capacity(INITIAL_PCR_JOURNAL),
            seen: HashSet::with_capacity(INITIAL_PCR_JOURNAL),
            journal_capacity: INITIAL_PCR_JOURNAL,
            destroyed: false,
        }
    }

    pub fn with_policy(policy: FilterPolicy) -> Self {
        Self::new(ReassemblerOptions {
            policy,
            ..Default::default()
        })
    }

    /// Bytes currently held back.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Append a chunk, flushing when the threshold or interval is reached.
    ///
    /// Returns the aligned bytes emitted by that flush, if any. An error is
    /// fatal: the reassembler is destroyed and rejects further input.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, TsError> {
        if self.destroyed {
            return Err(TsError::Destroyed);
        }

        if let Err(e) = self.pending.try_reserve(chunk.len()) {
            self.destroy();
            return Err(e.into());
        }
        self.pending.extend_from_slice(chunk);

        let interval_due = self
            .last_flush
            .is_none_or(|at| at.elapsed() >= self.opts.min_flush_interval);
        if self.pending.len() > self.opts.flush_threshold || interval_due {
            return self.flush(false);
        }
        Ok(None)
    }

    /// Process the buffered bytes now. A forced flush emits everything from
    /// the first undelivered PCR to the end and clears the buffer.
    pub fn flush(&mut self, force: bool) -> Result<Option<Bytes>, TsError> {
        if self.destroyed {
            return Err(TsError::Destroyed);
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.last_flush = Some(Instant::now());

        match self.process(force) {
            Ok(out) => {
                if force {
                    self.clear();
                }
                Ok(out)
            }
            Err(e) => {
                warn!("TS reassembly aborted: {}", e);
                self.destroy();
                Err(e)
            }
        }
    }

    fn process(&mut self, force: bool) -> Result<Option<Bytes>, TsError> {
        if self.pending.len() < 4 {
            return Ok(None);
        }

        let start = if check_sync(&self.pending, 0) {
            0
        } else {
            match next_aligned_sync(&self.pending, 0) {
                Some(pos) => {
                    debug!("Skipping {} unaligned bytes", pos);
                    pos
                }
                None => {
                    // Keep everything; the sync byte may arrive with the next chunk.
                    if self.pending.len() > self.opts.hard_cap {
                        return Err(TsError::Starved {
                            buffered: self.pending.len(),
                        });
                    }
                    return Ok(None);
                }
            }
        };

        let walk = self.walk(start)?;
        self.grow_journal(walk.pcrs.len());

        let known = walk
            .pcrs
            .iter()
            .take_while(|(pcr, _)| self.seen.contains(pcr))
            .count();
        let fresh = &walk.pcrs[known..];

        if force {
            let from = match (fresh.first(), walk.pcrs.is_empty()) {
                (Some(&(_, pos)), _) => Some(pos),
                (None, true) => Some(0),
                (None, false) => None,
            };
            let fresh_values: Vec<u64> = fresh.iter().map(|(pcr, _)| *pcr).collect();
            self.remember(&fresh_values);
            self.pending = Vec::new();
            return Ok(from
                .filter(|&pos| pos < walk.data.len())
                .map(|pos| Bytes::copy_from_slice(&walk.data[pos..])));
        }

        if fresh.len() < 2 {
            let buffered = walk.data.len();
            self.pending = walk.data;
            if buffered > self.opts.hard_cap {
                return Err(TsError::Starved { buffered });
            }
            return Ok(None);
        }

        let first = fresh[0].1;
        let last = fresh[fresh.len() - 1].1;
        // The last PCR opens the leftover, so it is not delivered yet.
        let delivered: Vec<u64> = fresh[..fresh.len() - 1].iter().map(|(pcr, _)| *pcr).collect();
        self.remember(&delivered);

        let out = Bytes::copy_from_slice(&walk.data[first..last]);
        let mut leftover = walk.data;
        leftover.drain(..last);
        self.pending = leftover;

        Ok(Some(out))
    }

    /// Walk aligned packets from `start`, applying the filter policy and
    /// collecting PCR positions.
    fn walk(&self, start: usize) -> Result<Walk, TsError> {
        let buf = &self.pending;
        let mut data = Vec::new();
        data.try_reserve(buf.len() - start)?;
        let mut pcrs = Vec::new();
        let mut anomalies = 0usize;
        let mut pointer = start;

        while pointer + PACKET_SIZE <= buf.len() {
            let successor = pointer + PACKET_SIZE;
            let size = if successor + 4 > buf.len() || check_sync(buf, successor) {
                PACKET_SIZE
            } else {
                match next_sync(buf, successor) {
                    Some(next) => next - pointer,
                    // No later packet start yet; the rest waits for more input.
                    None => break,
                }
            };

            let kept = if size == PACKET_SIZE {
                anomalies = 0;
                PACKET_SIZE
            } else {
                anomalies += 1;
                if anomalies >= MAX_CONSECUTIVE_ANOMALIES {
                    return Err(TsError::NotTransportStream { anomalies });
                }
                match self.opts.policy {
                    FilterPolicy::Bypass => size,
                    FilterPolicy::Trim => PACKET_SIZE,
                    FilterPolicy::Remove => 0,
                }
            };

            if kept > 0 {
                if let Some(pcr) = read_pcr(&buf[pointer..pointer + kept]) {
                    if pcrs.iter().any(|(seen, _)| *seen == pcr) {
                        debug!("Duplicate PCR {} inside one flush", pcr);
                    } else {
                        pcrs.push((pcr, data.len()));
                    }
                }
                data.extend_from_slice(&buf[pointer..pointer + kept]);
            }
            pointer += size;
        }

        data.extend_from_slice(&buf[pointer..]);
        Ok(Walk { data, pcrs })
    }

    fn grow_journal(&mut self, pcrs_per_flush: usize) {
        let wanted = MAX_PCR_JOURNAL.min(pcrs_per_flush * PCR_JOURNAL_FLUSHES);
        if wanted > self.journal_capacity {
            self.journal_capacity = wanted;
        }
    }

    fn remember(&mut self, pcrs: &[u64]) {
        for &pcr in pcrs {
            if self.seen.insert(pcr) {
                self.seen_order.push_back(pcr);
            }
        }
        self.trim_journal();
    }

    fn trim_journal(&mut self) {
        while self.seen_order.len() > self.journal_capacity {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.trim_journal();
    }

    /// Drop all state; subsequent calls fail with `TsError::Destroyed`.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.pending = Vec::new();
        self.seen_order.clear();
        self.seen.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
