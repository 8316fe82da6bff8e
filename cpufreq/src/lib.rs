//! CPU-frequency policy coordination core.
//!
//! Binds per-CPU frequency policies, a pluggable hardware driver, and
//! pluggable governors together under one concurrency discipline:
//! CPUs come and go, several CPUs may share one policy, readers and
//! writers contend on the same policy, and both the governor and the
//! driver receive precisely ordered callbacks across every state
//! change.
//!
//! - A [`CpufreqDriver`](driver::CpufreqDriver) programs the clocks.
//! - A [`Governor`](governor::Governor) picks targets within the
//!   committed `[min, max]` window.
//! - [`CpufreqCore`] owns the policy table, the notifier chains, the
//!   QoS clamping, and the hotplug/suspend sequencing.
//!
//! The core is instantiable: every instance is an independent universe
//! sized for a fixed number of possible CPUs.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cpu;
pub mod driver;
pub mod governor;
pub mod notifier;
pub mod policy;
pub mod qos;

mod attr;
mod engine;
mod hotplug;
mod ratelimit;
mod work;

#[cfg(test)]
mod tests;

use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub use cpu::CpuMask;
pub use driver::{CpufreqDriver, DriverFlags, Relation, Scaling, SetPolicyOps, TargetOps};
pub use engine::TransitionBus;
pub use governor::{GovernedPolicy, Governor, GovernorEvent};
pub use hotplug::CpuEvent;
pub use notifier::{
    FreqChange, NotifierChain, NotifierToken, PolicyCallback, PolicyNotice, TransitionCallback,
    TransitionPhase,
};
pub use policy::{CpuInfo, Policy, PolicyData, PolicyMode, PolicyRef, UserPolicy};
pub use qos::{QosClass, QosRequestId};

/// Longest accepted driver or governor name, excluding the terminator
/// the textual interface never stores.
pub const NAME_LEN: usize = 15;

/// Core error codes. The attribute surface maps the internal variants
/// (`InvalidRange`, `InvalidGovernor`, `NotSupported`) onto
/// `InvalidArgument` before they cross the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpufreqError {
    NoSuchDevice,
    InvalidArgument,
    InvalidRange,
    InvalidGovernor,
    Busy,
    NoMemory,
    IoError,
    NotSupported,
}

impl CpufreqError {
    /// Collapses internal codes onto the externally visible set.
    pub fn boundary(self) -> CpufreqError {
        match self {
            CpufreqError::InvalidRange
            | CpufreqError::InvalidGovernor
            | CpufreqError::NotSupported => CpufreqError::InvalidArgument,
            other => other,
        }
    }
}

impl fmt::Display for CpufreqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CpufreqError::NoSuchDevice => "no such device",
            CpufreqError::InvalidArgument => "invalid argument",
            CpufreqError::InvalidRange => "limits outside the requested window",
            CpufreqError::InvalidGovernor => "unusable governor",
            CpufreqError::Busy => "busy",
            CpufreqError::NoMemory => "out of memory",
            CpufreqError::IoError => "i/o error",
            CpufreqError::NotSupported => "not supported",
        };
        f.write_str(text)
    }
}

pub type Result<T> = core::result::Result<T, CpufreqError>;

/// Construction parameters for a core instance.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Number of possible CPUs; per-CPU tables are sized once from
    /// this.
    pub nr_cpus: usize,
    /// CPU whose policy participates in suspend/resume.
    pub boot_cpu: usize,
    /// Governor installed when no online sibling policy provides one.
    pub default_governor: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            boot_cpu: 0,
            default_governor: String::from("performance"),
        }
    }
}

struct CoreStats {
    transitions: AtomicU64,
    policy_updates: AtomicU64,
    governor_switches: AtomicU64,
    hotplug_adds: AtomicU64,
    hotplug_removes: AtomicU64,
    qos_updates: AtomicU64,
}

impl CoreStats {
    const fn new() -> Self {
        Self {
            transitions: AtomicU64::new(0),
            policy_updates: AtomicU64::new(0),
            governor_switches: AtomicU64::new(0),
            hotplug_adds: AtomicU64::new(0),
            hotplug_removes: AtomicU64::new(0),
            qos_updates: AtomicU64::new(0),
        }
    }
}

/// Counter snapshot for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStatistics {
    pub transitions: u64,
    pub policy_updates: u64,
    pub governor_switches: u64,
    pub hotplug_adds: u64,
    pub hotplug_removes: u64,
    pub qos_updates: u64,
}

/// The policy coordinator.
pub struct CpufreqCore {
    nr_cpus: usize,
    boot_cpu: usize,
    default_governor: String,
    registry: driver::DriverRegistry,
    governors: governor::GovernorRegistry,
    cpus: cpu::CpuState,
    surfaces: attr::AttrSurfaces,
    transition_chain: NotifierChain<TransitionCallback>,
    policy_chain: NotifierChain<PolicyCallback>,
    qos_min: qos::QosChannel,
    qos_max: qos::QosChannel,
    work: work::WorkQueue,
    ratelimit: ratelimit::RateLimit,
    stats: CoreStats,
}

impl CpufreqCore {
    pub fn new(config: CoreConfig) -> Self {
        let nr_cpus = config.nr_cpus.max(1);
        Self {
            nr_cpus,
            boot_cpu: config.boot_cpu.min(nr_cpus - 1),
            default_governor: config.default_governor,
            registry: driver::DriverRegistry::new(nr_cpus),
            governors: governor::GovernorRegistry::new(),
            cpus: cpu::CpuState::new(nr_cpus),
            surfaces: attr::AttrSurfaces::new(nr_cpus),
            transition_chain: NotifierChain::new(false),
            policy_chain: NotifierChain::new(true),
            qos_min: qos::QosChannel::new(QosClass::CpuFreqMin),
            qos_max: qos::QosChannel::new(QosClass::CpuFreqMax),
            work: work::WorkQueue::new(),
            ratelimit: ratelimit::RateLimit::new(),
            stats: CoreStats::new(),
        }
    }

    /// Core sized for `nr_cpus` CPUs with the default configuration.
    pub fn with_cpus(nr_cpus: usize) -> Self {
        Self::new(CoreConfig {
            nr_cpus,
            ..CoreConfig::default()
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn is_online(&self, cpu: usize) -> bool {
        self.cpus.is_online(cpu)
    }

    /// Counted lookup of the policy governing `cpu`.
    ///
    /// Fails when no driver is registered, the CPU index is out of
    /// range, or no policy is attached. A successful lookup pins the
    /// driver until the returned handle drops.
    pub fn policy(&self, cpu: usize) -> Result<PolicyRef<'_>> {
        let state = self.registry.state.lock();
        if state.driver.is_none() {
            return Err(CpufreqError::NoSuchDevice);
        }
        let slot = state.slots.get(cpu).ok_or(CpufreqError::NoSuchDevice)?;
        let policy = slot.clone().ok_or(CpufreqError::NoSuchDevice)?;
        if policy.is_dying() {
            return Err(CpufreqError::NoSuchDevice);
        }
        policy.get_ref();
        self.registry.pin();
        drop(state);
        Ok(PolicyRef::new(self, policy))
    }

    /// Last known frequency of `cpu` without touching the driver.
    pub fn quick_get(&self, cpu: usize) -> Option<u32> {
        self.policy(cpu).ok().map(|p| p.cur_khz())
    }

    /// Current upper limit for `cpu`.
    pub fn quick_get_max(&self, cpu: usize) -> Option<u32> {
        self.policy(cpu)
            .ok()
            .map(|p| p.policy_arc().data.read().max_khz)
    }

    /// Copy of the live policy for `cpu`.
    pub fn get_policy_snapshot(&self, cpu: usize) -> Result<PolicyData> {
        let policy = self.policy(cpu)?;
        let data = policy.policy_arc().data.read();
        Ok(data.clone())
    }

    /// Chain delivering `PreChange`/`PostChange` around every
    /// frequency change. Subscribers must not suspend.
    pub fn transition_notifiers(&self) -> &NotifierChain<TransitionCallback> {
        &self.transition_chain
    }

    /// Chain delivering policy-mutation notices. Subscribers may block
    /// and may tighten the proposed policy on `Adjust` and
    /// `Incompatible`.
    pub fn policy_notifiers(&self) -> &NotifierChain<PolicyCallback> {
        &self.policy_chain
    }

    /// Adds an external constraint request.
    pub fn qos_add_request(&self, class: QosClass, khz: u32) -> QosRequestId {
        let (id, changed) = self.qos_channel(class).add(khz);
        if changed {
            self.qos_changed(class);
        }
        id
    }

    pub fn qos_update_request(&self, class: QosClass, id: QosRequestId, khz: u32) -> Result<()> {
        if self.qos_channel(class).update(id, khz)? {
            self.qos_changed(class);
        }
        Ok(())
    }

    pub fn qos_remove_request(&self, class: QosClass, id: QosRequestId) -> Result<()> {
        if self.qos_channel(class).remove(id)? {
            self.qos_changed(class);
        }
        Ok(())
    }

    fn qos_channel(&self, class: QosClass) -> &qos::QosChannel {
        match class {
            QosClass::CpuFreqMin => &self.qos_min,
            QosClass::CpuFreqMax => &self.qos_max,
        }
    }

    /// Re-clamps every online policy against the fresh constraint
    /// values. The re-evaluation itself is deferred work.
    fn qos_changed(&self, class: QosClass) {
        self.stats.qos_updates.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "qos cpu-freq {} now {}",
            match class {
                QosClass::CpuFreqMin => "min",
                QosClass::CpuFreqMax => "max",
            },
            self.qos_channel(class).read()
        );
        for cpu in 0..self.nr_cpus {
            if !self.cpus.is_online(cpu) {
                continue;
            }
            if let Ok(policy) = self.policy(cpu) {
                self.schedule_update(policy.policy_arc());
            }
        }
    }

    /// Queues a deferred re-evaluation for `policy`, once.
    pub(crate) fn schedule_update(&self, policy: &alloc::sync::Arc<Policy>) {
        if !policy.update_pending.swap(true, Ordering::AcqRel) {
            self.work.schedule(policy.owner());
        }
    }

    /// Drains the deferred-work queue. Call from a context holding no
    /// policy locks.
    pub fn process_deferred_work(&self) {
        for cpu in self.work.drain() {
            let _ = self.update_policy(cpu);
        }
    }

    /// Number of queued deferred items.
    pub fn deferred_work_len(&self) -> usize {
        self.work.len()
    }

    pub fn statistics(&self) -> CoreStatistics {
        CoreStatistics {
            transitions: self.stats.transitions.load(Ordering::Relaxed),
            policy_updates: self.stats.policy_updates.load(Ordering::Relaxed),
            governor_switches: self.stats.governor_switches.load(Ordering::Relaxed),
            hotplug_adds: self.stats.hotplug_adds.load(Ordering::Relaxed),
            hotplug_removes: self.stats.hotplug_removes.load(Ordering::Relaxed),
            qos_updates: self.stats.qos_updates.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn stat_transition(&self) {
        self.stats.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stat_policy_update(&self) {
        self.stats.policy_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stat_governor_switch(&self) {
        self.stats.governor_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stat_hotplug_add(&self) {
        self.stats.hotplug_adds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stat_hotplug_remove(&self) {
        self.stats.hotplug_removes.fetch_add(1, Ordering::Relaxed);
    }
}
