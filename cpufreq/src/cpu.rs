//! CPU sets and per-CPU bookkeeping tables.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

/// Sentinel for an unset `policy_cpu` slot.
const NO_POLICY_CPU: usize = usize::MAX;

/// Fixed-capacity CPU set. Capacity is the number of possible CPUs,
/// decided once at core construction.
#[derive(Clone, PartialEq, Eq)]
pub struct CpuMask {
    bits: Vec<u64>,
    nr_cpus: usize,
}

impl CpuMask {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            bits: vec![0; nr_cpus.div_ceil(64).max(1)],
            nr_cpus,
        }
    }

    pub fn single(nr_cpus: usize, cpu: usize) -> Self {
        let mut mask = Self::new(nr_cpus);
        mask.set(cpu);
        mask
    }

    pub fn capacity(&self) -> usize {
        self.nr_cpus
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < self.nr_cpus {
            self.bits[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < self.nr_cpus {
            self.bits[cpu / 64] &= !(1 << (cpu % 64));
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < self.nr_cpus && self.bits[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of CPUs in the set.
    pub fn weight(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn or_assign(&mut self, other: &CpuMask) {
        for (dst, src) in self.bits.iter_mut().zip(other.bits.iter()) {
            *dst |= *src;
        }
    }

    pub fn union(&self, other: &CpuMask) -> CpuMask {
        let mut out = self.clone();
        out.or_assign(other);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nr_cpus).filter(move |cpu| self.contains(*cpu))
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cpu in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", cpu)?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({})", self)
    }
}

/// Per-CPU state owned by the core: the online mask, the lock-index
/// table mapping each CPU to the owner CPU of its policy, and the
/// saved-governor shadow recorded when a CPU detaches.
pub(crate) struct CpuState {
    online: Vec<AtomicBool>,
    policy_cpu: Vec<AtomicUsize>,
    saved_governor: Mutex<Vec<Option<String>>>,
}

impl CpuState {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            online: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
            policy_cpu: (0..nr_cpus)
                .map(|_| AtomicUsize::new(NO_POLICY_CPU))
                .collect(),
            saved_governor: Mutex::new(vec![None; nr_cpus]),
        }
    }

    pub fn is_online(&self, cpu: usize) -> bool {
        self.online
            .get(cpu)
            .map(|o| o.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn set_online(&self, cpu: usize, online: bool) {
        if let Some(o) = self.online.get(cpu) {
            o.store(online, Ordering::Release);
        }
    }

    pub fn policy_cpu(&self, cpu: usize) -> Option<usize> {
        match self.policy_cpu.get(cpu)?.load(Ordering::Acquire) {
            NO_POLICY_CPU => None,
            owner => Some(owner),
        }
    }

    pub fn set_policy_cpu(&self, cpu: usize, owner: usize) {
        if let Some(slot) = self.policy_cpu.get(cpu) {
            slot.store(owner, Ordering::Release);
        }
    }

    pub fn clear_policy_cpu(&self, cpu: usize) {
        if let Some(slot) = self.policy_cpu.get(cpu) {
            slot.store(NO_POLICY_CPU, Ordering::Release);
        }
    }

    /// Records the governor a departing CPU was running. The shadow is
    /// record-only: attachment picks a sibling's governor or the
    /// default, never this entry.
    pub fn save_governor(&self, cpu: usize, name: &str) {
        let mut shadow = self.saved_governor.lock();
        if let Some(slot) = shadow.get_mut(cpu) {
            *slot = Some(String::from(name));
        }
    }

    #[cfg(test)]
    pub fn saved_governor(&self, cpu: usize) -> Option<String> {
        self.saved_governor.lock().get(cpu)?.clone()
    }

    /// Drops every shadow entry naming `name` when a governor
    /// deregisters, so no stale record outlives it.
    pub fn forget_governor(&self, name: &str) {
        let mut shadow = self.saved_governor.lock();
        for slot in shadow.iter_mut() {
            if slot.as_deref() == Some(name) {
                *slot = None;
            }
        }
    }
}
