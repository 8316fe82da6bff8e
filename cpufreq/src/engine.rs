//! The transition engine: validate, clamp, notify, commit.

use alloc::string::String;
use alloc::sync::Arc;

use crate::driver::{effective_flags, CpufreqDriver, DriverFlags, Relation, Scaling};
use crate::governor::{GovernedPolicy, Governor, GovernorEvent};
use crate::notifier::{FreqChange, PolicyNotice, TransitionPhase};
use crate::policy::{Policy, PolicyData, PolicyMode};
use crate::{CpufreqCore, CpufreqError, Result};

/// Handle through which a driver delivers the `PreChange`/`PostChange`
/// pair around each hardware frequency change.
pub struct TransitionBus<'a> {
    core: &'a CpufreqCore,
}

impl<'a> TransitionBus<'a> {
    pub(crate) fn new(core: &'a CpufreqCore) -> Self {
        Self { core }
    }

    pub fn pre_change(&self, freqs: &mut FreqChange) {
        self.core
            .notify_transition(freqs, TransitionPhase::PreChange);
    }

    pub fn post_change(&self, freqs: &mut FreqChange) {
        self.core
            .notify_transition(freqs, TransitionPhase::PostChange);
    }
}

fn governor_eq(a: &Option<Arc<dyn Governor>>, b: &Option<Arc<dyn Governor>>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        (None, None) => true,
        _ => false,
    }
}

impl CpufreqCore {
    /// The canonical mutation path: commits `proposed` onto the live
    /// policy. The caller holds the policy's change lock and owns
    /// `proposed`, a fully populated copy.
    ///
    /// On failure past the commit point the committed limits are kept;
    /// only the requested window is restored on `proposed`.
    pub(crate) fn set_policy_locked(
        &self,
        policy: &Arc<Policy>,
        proposed: &mut PolicyData,
    ) -> Result<()> {
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;
        let requested_min = proposed.min_khz;
        let requested_max = proposed.max_khz;

        self.ratelimit.disable();
        let ret = self.run_policy_change(&driver, policy, proposed);

        // Restore the limits the caller requested.
        proposed.min_khz = requested_min;
        proposed.max_khz = requested_max;
        self.ratelimit.enable();

        if ret.is_ok() {
            self.stat_policy_update();
        }
        ret
    }

    fn run_policy_change(
        &self,
        driver: &Arc<dyn CpufreqDriver>,
        policy: &Arc<Policy>,
        proposed: &mut PolicyData,
    ) -> Result<()> {
        let mut data = policy.data.write();
        if data.ungoverned {
            return Err(CpufreqError::InvalidGovernor);
        }

        // Clamp to the external constraints. Each constraint is first
        // bounded by the user-requested opposite limit so a new floor
        // cannot silently raise the user's ceiling and vice-versa.
        let qmin = self.qos_min.read().min(data.user.max_khz);
        let qmax = self.qos_max.read().max(data.user.min_khz);
        self.ratelimit.debug(format_args!(
            "setting new policy for CPU {}: {} - {} ({} - {}) kHz",
            policy.owner(),
            proposed.min_khz,
            proposed.max_khz,
            qmin,
            qmax
        ));
        proposed.min_khz = proposed.min_khz.max(qmin);
        proposed.max_khz = proposed.max_khz.min(qmax);

        // Hardware bounds are immutable, and so is the owner cell.
        proposed.info = data.info;
        proposed.owner_cpu = data.owner_cpu;

        if proposed.min_khz > data.user.max_khz || proposed.max_khz < data.user.min_khz {
            return Err(CpufreqError::InvalidRange);
        }

        driver.verify(proposed)?;

        for cb in self.policy_chain.snapshot() {
            (cb.as_ref())(PolicyNotice::Adjust, proposed);
        }
        for cb in self.policy_chain.snapshot() {
            (cb.as_ref())(PolicyNotice::Incompatible, proposed);
        }

        // Subscribers may have widened the window past hardware
        // limits.
        driver.verify(proposed)?;

        for cb in self.policy_chain.snapshot() {
            (cb.as_ref())(PolicyNotice::Notify, proposed);
        }

        let limits_moved = (data.min_khz, data.max_khz) != (proposed.min_khz, proposed.max_khz);
        data.min_khz = proposed.min_khz;
        data.max_khz = proposed.max_khz;
        self.ratelimit.debug(format_args!(
            "new min and max freqs are {} - {} kHz",
            data.min_khz, data.max_khz
        ));
        if limits_moved {
            for cb in self.policy_chain.snapshot() {
                (cb.as_ref())(PolicyNotice::LimitsChanged, proposed);
            }
        }

        match driver.scaling() {
            Scaling::SetPolicy(ops) => {
                data.mode = proposed.mode;
                let committed = proposed.clone();
                drop(data);
                ops.set_policy(&committed)
            }
            Scaling::Target(_) => {
                let old_gov = data.governor.clone();
                let new_gov = proposed.governor.clone();
                // Governor callbacks run with the policy lock
                // released; the change lock keeps this mutation
                // exclusive.
                drop(data);
                if !governor_eq(&old_gov, &new_gov) {
                    self.switch_governor(policy, old_gov, new_gov)?;
                }
                // Change or update limits; a failure here does not
                // unwind the committed window.
                let _ = self.governor_event(policy, GovernorEvent::LimitsChanged);
                Ok(())
            }
        }
    }

    /// Stop the old governor, install and start the new one. On a
    /// failed start the old governor is reinstalled; if that restart
    /// fails too the policy is left ungoverned and every later write
    /// surfaces an error.
    fn switch_governor(
        &self,
        policy: &Arc<Policy>,
        old_gov: Option<Arc<dyn Governor>>,
        new_gov: Option<Arc<dyn Governor>>,
    ) -> Result<()> {
        self.ratelimit
            .debug(format_args!("governor switch on CPU {}", policy.owner()));

        if old_gov.is_some() {
            let _ = self.governor_event(policy, GovernorEvent::Stop);
        }

        policy.data.write().governor = new_gov.clone();
        if self.governor_event(policy, GovernorEvent::Start).is_ok() {
            self.stat_governor_switch();
            return Ok(());
        }

        log::warn!(
            "starting governor {} failed",
            new_gov.as_ref().map(|g| g.name()).unwrap_or("<none>")
        );
        policy.data.write().governor = old_gov.clone();
        if old_gov.is_some() && self.governor_event(policy, GovernorEvent::Start).is_err() {
            log::error!(
                "governor rollback failed, CPU {} left ungoverned",
                policy.owner()
            );
            let mut data = policy.data.write();
            data.governor = None;
            data.ungoverned = true;
        }
        Err(CpufreqError::InvalidGovernor)
    }

    /// Delivers one event to the policy's governor, substituting the
    /// compiled-in performance governor when the hardware is too slow
    /// for the requested one.
    pub(crate) fn governor_event(&self, policy: &Arc<Policy>, event: GovernorEvent) -> Result<()> {
        let gov = {
            let mut data = policy.data.write();
            let mut gov = data
                .governor
                .clone()
                .ok_or(CpufreqError::InvalidGovernor)?;
            if let Some(max_latency) = gov.max_transition_latency_ns() {
                if data.info.transition_latency_ns > max_latency {
                    let fallback = self
                        .governors
                        .find("performance")
                        .ok_or(CpufreqError::InvalidGovernor)?;
                    log::warn!(
                        "{} governor failed, too long transition latency of HW, fallback to {} governor",
                        gov.name(),
                        fallback.name()
                    );
                    data.governor = Some(fallback.clone());
                    gov = fallback;
                }
            }
            gov
        };
        self.ratelimit.debug(format_args!(
            "governor event {:?} for CPU {}",
            event,
            policy.owner()
        ));
        gov.event(&GovernedPolicy::new(self, policy), event)
    }

    /// Periodic nudge: asks `cpu`'s governor to re-evaluate its
    /// target within the committed window.
    pub fn poll(&self, cpu: usize) -> Result<()> {
        let policy = self.policy(cpu)?;
        let policy = policy.policy_arc().clone();
        let guard = policy.change_lock.lock();
        if !self.cpus.is_online(cpu) {
            return Err(CpufreqError::NoSuchDevice);
        }
        let ret = self.governor_event(&policy, GovernorEvent::UpdatePoll);
        drop(guard);
        ret
    }

    /// Asks the driver for a specific frequency on behalf of `cpu`'s
    /// policy.
    pub fn target(&self, cpu: usize, target_khz: u32, relation: Relation) -> Result<()> {
        let policy = self.policy(cpu)?;
        let policy = policy.policy_arc().clone();
        self.driver_target(&policy, target_khz, relation)
    }

    pub(crate) fn driver_target(
        &self,
        policy: &Arc<Policy>,
        target_khz: u32,
        relation: Relation,
    ) -> Result<()> {
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;
        if !self.cpus.is_online(policy.owner()) {
            return Err(CpufreqError::NoSuchDevice);
        }
        self.ratelimit.debug(format_args!(
            "target for CPU {}: {} kHz, relation {:?}",
            policy.owner(),
            target_khz,
            relation
        ));
        let data = policy.data.write();
        match driver.scaling() {
            Scaling::Target(ops) => {
                ops.target(&TransitionBus::new(self), &data, target_khz, relation)
            }
            Scaling::SetPolicy(_) => Err(CpufreqError::NotSupported),
        }
    }

    /// Running-average frequency for `cpu` within `policy`, when the
    /// driver tracks one.
    pub(crate) fn driver_getavg(&self, policy: &Arc<Policy>, cpu: usize) -> Option<u32> {
        if !self.cpus.is_online(cpu) {
            return None;
        }
        let driver = self.registry.current()?;
        let data = policy.data.read();
        driver.getavg(&data, cpu)
    }

    /// Running-average frequency for `cpu`.
    pub fn getavg(&self, cpu: usize) -> Option<u32> {
        let policy = self.policy(cpu).ok()?;
        let policy = policy.policy_arc().clone();
        self.driver_getavg(&policy, cpu)
    }

    /// Live frequency as reported by the hardware. Detects drift
    /// against the last known value and queues a repair.
    pub fn get(&self, cpu: usize) -> Result<u32> {
        let policy = self.policy(cpu)?;
        let policy = policy.policy_arc().clone();
        {
            let _data = policy.data.read();
            if !self.cpus.is_online(cpu) {
                return Err(CpufreqError::NoSuchDevice);
            }
        }
        self.get_raw(&policy, cpu)
    }

    pub(crate) fn get_raw(&self, policy: &Arc<Policy>, cpu: usize) -> Result<u32> {
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;
        let khz = driver.get(cpu).ok_or(CpufreqError::NotSupported)?;
        let cur = policy.cur_khz();
        if khz != 0
            && cur != 0
            && khz != cur
            && !effective_flags(driver.as_ref()).contains(DriverFlags::CONST_LOOPS)
        {
            self.out_of_sync(cpu, cur, khz);
            self.schedule_update(policy);
        }
        Ok(khz)
    }

    /// The saved and actual frequency disagree: adjust to the actual
    /// value and let the deferred re-evaluation clean up.
    pub(crate) fn out_of_sync(&self, cpu: usize, old_khz: u32, new_khz: u32) {
        log::warn!(
            "CPU frequency out of sync: core thinks of {}, is {} kHz",
            old_khz,
            new_khz
        );
        let mut freqs = FreqChange::new(cpu, old_khz, new_khz);
        self.notify_transition(&mut freqs, TransitionPhase::PreChange);
        self.notify_transition(&mut freqs, TransitionPhase::PostChange);
    }

    /// Fans a transition phase out to the subscribers.
    ///
    /// On `PreChange` the event's old frequency is corrected when the
    /// driver and the core disagree (the driver is trusted). On
    /// `PostChange` the observed frequency is committed, owner CPU
    /// only.
    pub fn notify_transition(&self, freqs: &mut FreqChange, phase: TransitionPhase) {
        if let Some(driver) = self.registry.current() {
            freqs.flags = effective_flags(driver.as_ref());
        }
        let policy = self.registry.slot(freqs.cpu);
        self.ratelimit.debug(format_args!(
            "notification {:?} of frequency transition to {} kHz",
            phase, freqs.new_khz
        ));
        match phase {
            TransitionPhase::PreChange => {
                if let Some(p) = &policy {
                    p.begin_transition();
                }
                if !freqs.flags.contains(DriverFlags::CONST_LOOPS) {
                    if let Some(p) = &policy {
                        let cur = p.cur_khz();
                        if p.owner() == freqs.cpu && cur != 0 && cur != freqs.old_khz {
                            log::warn!(
                                "CPU frequency is {} kHz, core assumed {} kHz",
                                freqs.old_khz,
                                cur
                            );
                            freqs.old_khz = cur;
                        }
                    }
                }
                for cb in self.transition_chain.snapshot() {
                    (cb.as_ref())(TransitionPhase::PreChange, freqs);
                }
            }
            TransitionPhase::PostChange => {
                for cb in self.transition_chain.snapshot() {
                    (cb.as_ref())(TransitionPhase::PostChange, freqs);
                }
                if let Some(p) = &policy {
                    if p.owner() == freqs.cpu {
                        p.set_cur_khz(freqs.new_khz);
                    }
                    p.end_transition();
                }
                self.stat_transition();
            }
        }
    }

    /// Rebuilds a proposed policy from the user-requested window and
    /// runs the engine, re-clamping against the fresh constraint
    /// values.
    pub fn update_policy(&self, cpu: usize) -> Result<()> {
        let policy = self.policy(cpu)?;
        let policy = policy.policy_arc().clone();
        policy
            .update_pending
            .store(false, core::sync::atomic::Ordering::Release);

        let guard = policy.change_lock.lock();
        if !self.cpus.is_online(cpu) {
            return Err(CpufreqError::NoSuchDevice);
        }
        self.ratelimit
            .debug(format_args!("updating policy for CPU {}", cpu));

        let mut proposed = {
            let data = policy.data.read();
            let mut p = data.clone();
            p.min_khz = data.user.min_khz;
            p.max_khz = data.user.max_khz;
            p.mode = data.user.mode;
            p.governor = data.user.governor.clone();
            p
        };

        // The platform might have changed the frequency behind our
        // back; trust the driver and tell the governors.
        if let Some(driver) = self.registry.current() {
            if let Some(khz) = driver.get(cpu) {
                let cur = policy.cur_khz();
                if cur == 0 {
                    self.ratelimit
                        .debug(format_args!("driver did not initialize current freq"));
                    policy.set_cur_khz(khz);
                } else if khz != cur {
                    self.out_of_sync(cpu, cur, khz);
                }
            }
        }

        let ret = self.set_policy_locked(&policy, &mut proposed);
        drop(guard);
        ret
    }

    /// Switches `cpu`'s policy to the named governor. Fails fast when
    /// the policy already runs it.
    pub fn set_governor_for(&self, cpu: usize, name: &str) -> Result<()> {
        let policy = self.policy(cpu)?;
        let policy = policy.policy_arc().clone();
        {
            let data = policy.data.read();
            if !self.cpus.is_online(cpu) {
                return Err(CpufreqError::NoSuchDevice);
            }
            let same = match data.mode {
                PolicyMode::Performance => name == "performance",
                PolicyMode::Powersave => name == "powersave",
                PolicyMode::Governed => data
                    .governor
                    .as_ref()
                    .map(|g| g.name() == name)
                    .unwrap_or(false),
            };
            if same {
                return Err(CpufreqError::InvalidArgument);
            }
        }

        let (mode, governor) = self.parse_governor(name)?;
        let guard = policy.change_lock.lock();
        let mut proposed = policy.data.read().clone();
        proposed.mode = mode;
        proposed.governor = governor;
        let ret = self.set_policy_locked(&policy, &mut proposed);
        if ret.is_ok() {
            let mut data = policy.data.write();
            data.user.mode = data.mode;
            data.user.governor = data.governor.clone();
        }
        drop(guard);
        ret
    }

    /// Name of the governor (or direct mode) currently driving `cpu`.
    pub fn current_governor(&self, cpu: usize) -> Result<String> {
        let policy = self.policy(cpu)?;
        let data = policy.policy_arc().data.read();
        match data.mode {
            PolicyMode::Performance => Ok(String::from("performance")),
            PolicyMode::Powersave => Ok(String::from("powersave")),
            PolicyMode::Governed => data
                .governor
                .as_ref()
                .map(|g| String::from(g.name()))
                .ok_or(CpufreqError::InvalidGovernor),
        }
    }
}
