//! slave ID 풀
//!
//! 하나의 primary에 붙는 모든 세션(실제 replica 포함)은 서로 다른
//! server ID를 사용해야 합니다. 풀은 설정된 범위에서 가장 작은 빈 ID를
//! 할당하고, 반환된 ID는 다시 사용합니다.

use crate::config::SlaveIdRange;
use crate::error::{ReplicationError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub type SlaveId = u32;

pub trait SlaveIdPool: Send + Sync {
    fn acquire(&self) -> Result<SlaveId>;

    fn release(&self, id: SlaveId);
}

/// `[base, base + count)` 범위를 관리하는 풀
#[derive(Debug)]
pub struct RangeSlaveIdPool {
    range: SlaveIdRange,
    in_use: Mutex<BTreeSet<SlaveId>>,
}

impl RangeSlaveIdPool {
    pub fn new(range: SlaveIdRange) -> Self {
        RangeSlaveIdPool {
            range,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().len()
    }

    fn contains(&self, id: SlaveId) -> bool {
        id >= self.range.base && (id - self.range.base) < self.range.count
    }
}

impl SlaveIdPool for RangeSlaveIdPool {
    fn acquire(&self) -> Result<SlaveId> {
        let mut in_use = self.in_use.lock();
        let id = (0..self.range.count)
            .filter_map(|offset| self.range.base.checked_add(offset))
            .find(|id| !in_use.contains(id))
            .ok_or(ReplicationError::PoolExhausted)?;

        in_use.insert(id);
        debug!("Acquired slave id {} ({} in use)", id, in_use.len());
        Ok(id)
    }

    fn release(&self, id: SlaveId) {
        if !self.contains(id) {
            warn!("Ignoring release of slave id {} outside of pool range", id);
            return;
        }

        let mut in_use = self.in_use.lock();
        if in_use.remove(&id) {
            debug!("Released slave id {} ({} in use)", id, in_use.len());
        } else {
            warn!("Slave id {} released twice", id);
        }
    }
}
