//! External frequency constraints.
//!
//! Two request-list channels: a floor channel whose effective value is
//! the maximum of all outstanding requests, and a ceiling channel
//! whose effective value is the minimum. Callers hold a request id per
//! constraint and update or drop it over time; the core re-clamps every
//! policy whenever a channel's effective value moves.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{CpufreqError, Result};

/// Which bound a request constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    CpuFreqMin,
    CpuFreqMax,
}

/// Handle for one outstanding constraint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosRequestId(u64);

pub(crate) struct QosChannel {
    class: QosClass,
    next_id: AtomicU64,
    requests: Mutex<BTreeMap<u64, u32>>,
}

impl QosChannel {
    pub fn new(class: QosClass) -> Self {
        Self {
            class,
            next_id: AtomicU64::new(1),
            requests: Mutex::new(BTreeMap::new()),
        }
    }

    fn default_value(&self) -> u32 {
        match self.class {
            QosClass::CpuFreqMin => 0,
            QosClass::CpuFreqMax => u32::MAX,
        }
    }

    fn aggregate(&self, requests: &BTreeMap<u64, u32>) -> u32 {
        let folded = match self.class {
            QosClass::CpuFreqMin => requests.values().max(),
            QosClass::CpuFreqMax => requests.values().min(),
        };
        folded.copied().unwrap_or_else(|| self.default_value())
    }

    /// Effective value of the channel.
    pub fn read(&self) -> u32 {
        let requests = self.requests.lock();
        self.aggregate(&requests)
    }

    /// Adds a request. Returns its id and whether the effective value
    /// moved.
    pub fn add(&self, value: u32) -> (QosRequestId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut requests = self.requests.lock();
        let before = self.aggregate(&requests);
        requests.insert(id, value);
        let after = self.aggregate(&requests);
        (QosRequestId(id), before != after)
    }

    pub fn update(&self, id: QosRequestId, value: u32) -> Result<bool> {
        let mut requests = self.requests.lock();
        if !requests.contains_key(&id.0) {
            return Err(CpufreqError::InvalidArgument);
        }
        let before = self.aggregate(&requests);
        requests.insert(id.0, value);
        let after = self.aggregate(&requests);
        Ok(before != after)
    }

    pub fn remove(&self, id: QosRequestId) -> Result<bool> {
        let mut requests = self.requests.lock();
        let before = self.aggregate(&requests);
        if requests.remove(&id.0).is_none() {
            return Err(CpufreqError::InvalidArgument);
        }
        let after = self.aggregate(&requests);
        Ok(before != after)
    }
}
