//! The policy entity: coordinator state for one affinity set.

use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use crate::cpu::CpuMask;
use crate::governor::Governor;
use crate::CpufreqCore;

/// Hardware-reported immutable bounds, filled by `driver.init`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuInfo {
    pub hw_min_khz: u32,
    pub hw_max_khz: u32,
    pub transition_latency_ns: u64,
}

/// How targets within `[min, max]` are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Direct driver policy: pin to the upper bound.
    Performance,
    /// Direct driver policy: pin to the lower bound.
    Powersave,
    /// A governor object drives target selection.
    Governed,
}

/// Last user-requested window, kept unclamped so limits can be
/// re-derived whenever the external constraints move.
#[derive(Clone)]
pub struct UserPolicy {
    pub min_khz: u32,
    pub max_khz: u32,
    pub mode: PolicyMode,
    pub governor: Option<Arc<dyn Governor>>,
}

/// Mutable policy fields, guarded by the per-policy reader-writer lock.
///
/// A mutation path works on a detached clone (the proposed policy) and
/// commits through the transition engine.
#[derive(Clone)]
pub struct PolicyData {
    /// The CPU whose attribute surface is authoritative. Mirrors
    /// [`Policy::owner`]; kept here so drivers and governors see it in
    /// their snapshots.
    pub owner_cpu: usize,
    /// Currently online CPUs controlled by this policy.
    pub affinity: CpuMask,
    /// CPUs that may ever be controlled by it, including offline
    /// siblings.
    pub related: CpuMask,
    pub info: CpuInfo,
    /// Active lower limit after external clamping.
    pub min_khz: u32,
    /// Active upper limit after external clamping.
    pub max_khz: u32,
    pub mode: PolicyMode,
    pub governor: Option<Arc<dyn Governor>>,
    pub user: UserPolicy,
    /// Set when a governor rollback failed; every later mutation on
    /// this policy surfaces an error.
    pub(crate) ungoverned: bool,
}

impl PolicyData {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            owner_cpu: 0,
            affinity: CpuMask::new(nr_cpus),
            related: CpuMask::new(nr_cpus),
            info: CpuInfo::default(),
            min_khz: 0,
            max_khz: 0,
            mode: PolicyMode::Governed,
            governor: None,
            user: UserPolicy {
                min_khz: 0,
                max_khz: 0,
                mode: PolicyMode::Governed,
                governor: None,
            },
            ungoverned: false,
        }
    }

    /// Clamps the proposed window into `[min_khz, max_khz]`. Drivers
    /// call this from `verify` with their lawful bounds.
    pub fn clamp_within(&mut self, min_khz: u32, max_khz: u32) {
        if self.min_khz < min_khz {
            self.min_khz = min_khz;
        }
        if self.max_khz > max_khz {
            self.max_khz = max_khz;
        }
        if self.min_khz > max_khz {
            self.min_khz = max_khz;
        }
        if self.max_khz < min_khz {
            self.max_khz = min_khz;
        }
        if self.min_khz > self.max_khz {
            self.min_khz = self.max_khz;
        }
    }
}

/// One-shot teardown signal. The remover parks on it until the last
/// outstanding reference is dropped.
pub(crate) struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn wait(&self) {
        while !self.done.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

/// Shared-ownership policy object.
///
/// `owner` and `cur_khz` live outside the data lock: transition
/// notifications commit the observed frequency without taking the
/// policy lock, and the owner cell moves during ownership transfer
/// while readers may still hold references.
pub struct Policy {
    owner: AtomicUsize,
    cur_khz: AtomicU32,
    refs: AtomicUsize,
    dying: AtomicBool,
    in_transition: AtomicBool,
    pub(crate) update_pending: AtomicBool,
    teardown: Completion,
    /// Serializes the mutation paths. Taken before `data` and held
    /// across governor callbacks, which run with `data` released.
    pub(crate) change_lock: Mutex<()>,
    pub(crate) data: RwLock<PolicyData>,
}

impl Policy {
    pub(crate) fn new(owner: usize, nr_cpus: usize) -> Self {
        let mut data = PolicyData::new(nr_cpus);
        data.owner_cpu = owner;
        Self {
            owner: AtomicUsize::new(owner),
            cur_khz: AtomicU32::new(0),
            // The attribute surface owns one reference from birth.
            refs: AtomicUsize::new(1),
            dying: AtomicBool::new(false),
            in_transition: AtomicBool::new(false),
            update_pending: AtomicBool::new(false),
            teardown: Completion::new(),
            change_lock: Mutex::new(()),
            data: RwLock::new(data),
        }
    }

    /// The canonical CPU whose attribute surface is authoritative.
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, cpu: usize) {
        self.owner.store(cpu, Ordering::Release);
    }

    /// Most recently observed frequency.
    pub fn cur_khz(&self) -> u32 {
        self.cur_khz.load(Ordering::Acquire)
    }

    pub(crate) fn set_cur_khz(&self, khz: u32) {
        self.cur_khz.store(khz, Ordering::Release);
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dying(&self) {
        self.dying.store(true, Ordering::Release);
    }

    pub(crate) fn get_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.teardown.complete();
        }
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Parks until every holder has dropped its reference.
    pub(crate) fn teardown_wait(&self) {
        self.teardown.wait();
    }

    /// Claims the transition latch. Phases of two changes never
    /// interleave for one policy.
    pub(crate) fn begin_transition(&self) {
        while self
            .in_transition
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    pub(crate) fn end_transition(&self) {
        self.in_transition.store(false, Ordering::Release);
    }
}

/// Counted handle to a live policy, obtained from
/// [`CpufreqCore::policy`]. While any handle is outstanding the driver
/// stays pinned and the policy cannot finish teardown.
pub struct PolicyRef<'a> {
    core: &'a CpufreqCore,
    policy: Arc<Policy>,
}

impl<'a> PolicyRef<'a> {
    pub(crate) fn new(core: &'a CpufreqCore, policy: Arc<Policy>) -> Self {
        Self { core, policy }
    }

    pub(crate) fn policy_arc(&self) -> &Arc<Policy> {
        &self.policy
    }
}

impl Deref for PolicyRef<'_> {
    type Target = Policy;

    fn deref(&self) -> &Policy {
        &self.policy
    }
}

impl Drop for PolicyRef<'_> {
    fn drop(&mut self) {
        self.policy.put_ref();
        self.core.registry_unpin();
    }
}
