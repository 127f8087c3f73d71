//! Run-length compression of block-number sets.
//!
//! A set is sent as inclusive `(first, last)` sequences plus a residual list
//! of singletons. Only runs longer than `max_residual_run` (3) become
//! sequences, which bounds inflation for alternating sets while compressing
//! large contiguous holdings to four bytes.
//!
//! Wire form: `seq_count u8 | (first u16, last u16)* | residual_count u16 | u16*`

use std::ops::RangeInclusive;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::buf::{checked_u16, checked_u8, WireReader};
use crate::params::PARAMS_V1;
use crate::{ProtocolError, Result};

/// Inclusive run of block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRun {
    pub first: u16,
    pub last: u16,
}

impl BlockRun {
    pub fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.first..=self.last
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSet {
    pub sequences: Vec<BlockRun>,
    pub residual: Vec<u16>,
}

impl BlockSet {
    /// Compress a set of 1-based block numbers. Duplicates and 0 are dropped.
    pub fn from_numbers<I: IntoIterator<Item = u16>>(numbers: I) -> Self {
        Self::compress(
            numbers,
            PARAMS_V1.max_residual_run,
            PARAMS_V1.max_sequences,
        )
    }

    fn compress<I: IntoIterator<Item = u16>>(
        numbers: I,
        max_residual_run: usize,
        max_sequences: usize,
    ) -> Self {
        let mut sorted: Vec<u16> = numbers.into_iter().filter(|&n| n != 0).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut set = BlockSet::default();
        let mut run: Option<BlockRun> = None;

        for n in sorted {
            match run.as_mut() {
                Some(r) if r.last + 1 == n => r.last = n,
                _ => {
                    if let Some(done) = run.take() {
                        set.flush(done, max_residual_run, max_sequences);
                    }
                    run = Some(BlockRun { first: n, last: n });
                }
            }
        }
        // The trailing run goes through the same rule as every other run.
        if let Some(done) = run {
            set.flush(done, max_residual_run, max_sequences);
        }
        set
    }

    fn flush(&mut self, run: BlockRun, max_residual_run: usize, max_sequences: usize) {
        if run.len() > max_residual_run && self.sequences.len() < max_sequences {
            self.sequences.push(run);
        } else {
            self.residual.extend(run.range());
        }
    }

    /// Block numbers in request order: every sequence expanded, then the residual list.
    pub fn expand(&self) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.len());
        for run in &self.sequences {
            out.extend(run.range());
        }
        out.extend_from_slice(&self.residual);
        out
    }

    /// Sorted, de-duplicated block numbers.
    pub fn to_sorted(&self) -> Vec<u16> {
        let mut out = self.expand();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn len(&self) -> usize {
        self.sequences.iter().map(BlockRun::len).sum::<usize>() + self.residual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty() && self.residual.is_empty()
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(checked_u8("sequence count", self.sequences.len())?);
        for run in &self.sequences {
            dst.put_u16(run.first);
            dst.put_u16(run.last);
        }
        dst.put_u16(checked_u16("residual count", self.residual.len())?);
        for &n in &self.residual {
            dst.put_u16(n);
        }
        Ok(())
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let seq_count = r.u8()? as usize;
        let mut sequences = Vec::with_capacity(seq_count);
        for _ in 0..seq_count {
            let first = r.u16()?;
            let last = r.u16()?;
            if first == 0 || first > last {
                return Err(ProtocolError::MalformedMessage(format!(
                    "invalid block sequence [{first}, {last}]"
                )));
            }
            sequences.push(BlockRun { first, last });
        }

        let residual_count = r.u16()? as usize;
        // Each residual entry is two bytes; refuse counts the buffer cannot hold
        // before allocating for them.
        if residual_count * 2 > r.remaining() {
            return Err(ProtocolError::Truncated {
                needed: residual_count * 2,
                available: r.remaining(),
            });
        }
        let mut residual = Vec::with_capacity(residual_count);
        for _ in 0..residual_count {
            let n = r.u16()?;
            if n == 0 {
                return Err(ProtocolError::MalformedMessage(
                    "block number 0 in residual list".into(),
                ));
            }
            residual.push(n);
        }

        Ok(BlockSet {
            sequences,
            residual,
        })
    }
}
