//! Governor contract, registry, and the built-in decision-makers.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::driver::Relation;
use crate::policy::{Policy, PolicyMode};
use crate::{CpufreqCore, CpufreqError, Result, NAME_LEN};

/// State-machine edges delivered to a governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorEvent {
    /// The governor now drives this policy.
    Start,
    /// The governor no longer drives this policy. Delivered with no
    /// policy lock held.
    Stop,
    /// The committed `[min, max]` window moved.
    LimitsChanged,
    /// Periodic nudge to re-evaluate the target.
    UpdatePoll,
}

/// Handle a governor receives with every event. Reads are snapshots;
/// `target` re-enters the core through the normal transition path.
pub struct GovernedPolicy<'a> {
    core: &'a CpufreqCore,
    policy: &'a Arc<Policy>,
}

impl<'a> GovernedPolicy<'a> {
    pub(crate) fn new(core: &'a CpufreqCore, policy: &'a Arc<Policy>) -> Self {
        Self { core, policy }
    }

    /// Owner CPU of the governed policy.
    pub fn cpu(&self) -> usize {
        self.policy.owner()
    }

    /// Committed `(min, max)` window in kHz.
    pub fn limits(&self) -> (u32, u32) {
        let data = self.policy.data.read();
        (data.min_khz, data.max_khz)
    }

    /// Last observed frequency in kHz.
    pub fn cur_khz(&self) -> u32 {
        self.policy.cur_khz()
    }

    pub fn transition_latency_ns(&self) -> u64 {
        self.policy.data.read().info.transition_latency_ns
    }

    /// Asks the driver for a specific frequency.
    pub fn target(&self, target_khz: u32, relation: Relation) -> Result<()> {
        self.core.driver_target(self.policy, target_khz, relation)
    }

    /// Running-average frequency for `cpu`, when the driver tracks one.
    pub fn getavg(&self, cpu: usize) -> Option<u32> {
        self.core.driver_getavg(self.policy, cpu)
    }
}

/// Contract for a frequency decision-maker.
pub trait Governor: Send + Sync {
    fn name(&self) -> &str;

    /// Slowest hardware this governor tolerates, as a transition
    /// latency bound. Policies on slower hardware fall back to the
    /// compiled-in performance governor.
    fn max_transition_latency_ns(&self) -> Option<u64> {
        None
    }

    fn event(&self, policy: &GovernedPolicy<'_>, event: GovernorEvent) -> Result<()>;

    /// Direct speed programming, for governors that expose it.
    fn store_setspeed(&self, _policy: &GovernedPolicy<'_>, _khz: u32) -> Result<()> {
        Err(CpufreqError::NotSupported)
    }

    fn show_setspeed(&self, _policy: &GovernedPolicy<'_>) -> Option<u32> {
        None
    }
}

pub(crate) struct GovernorRegistry {
    list: Mutex<BTreeMap<String, Arc<dyn Governor>>>,
}

impl GovernorRegistry {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Governor>> {
        self.list.lock().get(name).cloned()
    }

    pub fn insert(&self, governor: Arc<dyn Governor>) -> Result<()> {
        let mut list = self.list.lock();
        if list.contains_key(governor.name()) {
            return Err(CpufreqError::Busy);
        }
        list.insert(String::from(governor.name()), governor);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Governor>> {
        self.list.lock().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.list.lock().keys().cloned().collect()
    }
}

impl CpufreqCore {
    pub fn register_governor(&self, governor: Arc<dyn Governor>) -> Result<()> {
        if governor.name().is_empty()
            || governor.name().len() > NAME_LEN
            || governor.name().contains(char::is_whitespace)
        {
            return Err(CpufreqError::InvalidArgument);
        }
        self.governors.insert(governor)
    }

    /// Removes a governor from the registry. Policies must drop their
    /// references first; while any online policy still runs it, the
    /// call fails with `Busy`.
    pub fn unregister_governor(&self, name: &str) -> Result<()> {
        for cpu in 0..self.nr_cpus {
            if let Some(policy) = self.registry.slot(cpu) {
                let in_use = policy
                    .data
                    .read()
                    .governor
                    .as_ref()
                    .map(|g| g.name() == name)
                    .unwrap_or(false);
                if in_use {
                    return Err(CpufreqError::Busy);
                }
            }
        }
        self.cpus.forget_governor(name);
        self.governors
            .remove(name)
            .map(|_| ())
            .ok_or(CpufreqError::NoSuchDevice)
    }

    /// Registered governor names.
    pub fn available_governors(&self) -> Vec<String> {
        self.governors.names()
    }

    /// Resolves a governor name against the active driver shape:
    /// range-managing drivers understand only the two direct modes,
    /// target-style drivers resolve the registry.
    pub(crate) fn parse_governor(
        &self,
        name: &str,
    ) -> Result<(PolicyMode, Option<Arc<dyn Governor>>)> {
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;
        match driver.scaling() {
            crate::driver::Scaling::SetPolicy(_) => match name {
                "performance" => Ok((PolicyMode::Performance, None)),
                "powersave" => Ok((PolicyMode::Powersave, None)),
                _ => Err(CpufreqError::InvalidGovernor),
            },
            crate::driver::Scaling::Target(_) => {
                let governor = self
                    .governors
                    .find(name)
                    .ok_or(CpufreqError::InvalidGovernor)?;
                Ok((PolicyMode::Governed, Some(governor)))
            }
        }
    }
}

/// Pins the policy to its upper limit.
pub struct PerformanceGovernor;

impl Governor for PerformanceGovernor {
    fn name(&self) -> &str {
        "performance"
    }

    fn event(&self, policy: &GovernedPolicy<'_>, event: GovernorEvent) -> Result<()> {
        match event {
            GovernorEvent::Start | GovernorEvent::LimitsChanged | GovernorEvent::UpdatePoll => {
                let (_, max) = policy.limits();
                policy.target(max, Relation::NearestBelow)
            }
            GovernorEvent::Stop => Ok(()),
        }
    }
}

/// Pins the policy to its lower limit.
pub struct PowersaveGovernor;

impl Governor for PowersaveGovernor {
    fn name(&self) -> &str {
        "powersave"
    }

    fn event(&self, policy: &GovernedPolicy<'_>, event: GovernorEvent) -> Result<()> {
        match event {
            GovernorEvent::Start | GovernorEvent::LimitsChanged | GovernorEvent::UpdatePoll => {
                let (min, _) = policy.limits();
                policy.target(min, Relation::NearestAbove)
            }
            GovernorEvent::Stop => Ok(()),
        }
    }
}

/// Holds whatever frequency was last programmed through
/// `scaling_setspeed`, re-clamped when the limits move.
pub struct UserspaceGovernor {
    speeds: Mutex<BTreeMap<usize, u32>>,
}

impl UserspaceGovernor {
    pub fn new() -> Self {
        Self {
            speeds: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for UserspaceGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl Governor for UserspaceGovernor {
    fn name(&self) -> &str {
        "userspace"
    }

    fn event(&self, policy: &GovernedPolicy<'_>, event: GovernorEvent) -> Result<()> {
        match event {
            GovernorEvent::Start => {
                self.speeds.lock().insert(policy.cpu(), policy.cur_khz());
                Ok(())
            }
            GovernorEvent::Stop => {
                self.speeds.lock().remove(&policy.cpu());
                Ok(())
            }
            GovernorEvent::LimitsChanged | GovernorEvent::UpdatePoll => {
                let (min, max) = policy.limits();
                let mut speeds = self.speeds.lock();
                let speed = speeds.entry(policy.cpu()).or_insert_with(|| policy.cur_khz());
                *speed = (*speed).clamp(min, max);
                let khz = *speed;
                drop(speeds);
                policy.target(khz, Relation::NearestBelow)
            }
        }
    }

    fn store_setspeed(&self, policy: &GovernedPolicy<'_>, khz: u32) -> Result<()> {
        let (min, max) = policy.limits();
        let khz = khz.clamp(min, max);
        self.speeds.lock().insert(policy.cpu(), khz);
        policy.target(khz, Relation::NearestBelow)
    }

    fn show_setspeed(&self, policy: &GovernedPolicy<'_>) -> Option<u32> {
        self.speeds.lock().get(&policy.cpu()).copied()
    }
}
