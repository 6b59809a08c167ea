//! Time-biased sequence ids: 41 bits of milliseconds since [`EPOCH_MS`],
//! 10 bits of node id, 12 bits of per-millisecond counter.

use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Result};
use chrono::Utc;
use shared::domain::SeqId;

/// 2010-11-04T01:42:54.657Z
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const MAX_NODE_ID: i64 = (1 << NODE_BITS) - 1;
const STEP_MASK: i64 = (1 << STEP_BITS) - 1;

#[derive(Debug)]
pub struct SeqIdGenerator {
    node_id: i64,
    state: Mutex<GeneratorState>,
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: i64,
    step: i64,
}

impl SeqIdGenerator {
    pub fn new(node_id: i64) -> Result<Self> {
        if !(0..=MAX_NODE_ID).contains(&node_id) {
            bail!("node id {node_id} out of range 0..={MAX_NODE_ID}");
        }
        Ok(Self {
            node_id,
            state: Mutex::new(GeneratorState::default()),
        })
    }

    pub fn next_id(&self) -> SeqId {
        self.next_at(Utc::now().timestamp_millis())
    }

    /// Ids never go backwards on this node: a clock that steps back keeps
    /// counting on the last millisecond seen, and a full counter borrows the
    /// next millisecond.
    fn next_at(&self, now_ms: i64) -> SeqId {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mut ms = now_ms.max(EPOCH_MS);
        if ms <= state.last_ms {
            ms = state.last_ms;
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                ms += 1;
            }
        } else {
            state.step = 0;
        }
        state.last_ms = ms;

        SeqId(((ms - EPOCH_MS) << (NODE_BITS + STEP_BITS)) | (self.node_id << STEP_BITS) | state.step)
    }
}
