//! CPU hotplug sequencing and the suspend/resume hooks.

use alloc::sync::Arc;

use crate::governor::GovernorEvent;
use crate::policy::Policy;
use crate::{CpufreqCore, CpufreqError, Result, Scaling};

/// Hotplug notifications fed into the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    /// The CPU came online (first boot or hotplug add).
    Online,
    /// The CPU is about to go offline.
    DownPrepare,
    /// A previously announced removal was aborted.
    DownFailed,
}

impl CpufreqCore {
    /// Feeds one hotplug event into the coordinator.
    pub fn cpu_event(&self, cpu: usize, event: CpuEvent) -> Result<()> {
        if cpu >= self.nr_cpus {
            return Err(CpufreqError::NoSuchDevice);
        }
        match event {
            CpuEvent::Online | CpuEvent::DownFailed => {
                self.cpus.set_online(cpu, true);
                if self.registry.current().is_some() {
                    self.add_dev(cpu)
                } else {
                    Ok(())
                }
            }
            CpuEvent::DownPrepare => {
                let ret = if self.registry.slot(cpu).is_some() {
                    self.remove_dev(cpu)
                } else {
                    Ok(())
                };
                self.cpus.set_online(cpu, false);
                ret
            }
        }
    }

    /// Attaches the frequency interface for an online CPU. A second
    /// call for an already-attached CPU succeeds without effect.
    pub(crate) fn add_dev(&self, cpu: usize) -> Result<()> {
        if !self.cpus.is_online(cpu) {
            return Ok(());
        }
        if self.registry.slot(cpu).is_some() {
            return Ok(());
        }
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;

        self.ratelimit.disable();
        let ret = self.do_add_dev(cpu, &driver);
        self.ratelimit.enable();
        if ret.is_ok() {
            self.stat_hotplug_add();
        }
        ret
    }

    fn do_add_dev(
        &self,
        cpu: usize,
        driver: &Arc<dyn crate::driver::CpufreqDriver>,
    ) -> Result<()> {
        log::debug!("adding CPU {}", cpu);

        let policy = Arc::new(Policy::new(cpu, self.nr_cpus));
        self.cpus.set_policy_cpu(cpu, cpu);
        let change = policy.change_lock.lock();

        // Pick the governor before driver init so the driver can see
        // it: an online sibling's governor wins, the default otherwise.
        let chosen = self
            .sibling_governor(cpu)
            .or_else(|| self.governors.find(&self.default_governor));

        {
            let mut data = policy.data.write();
            data.affinity.set(cpu);
            data.governor = chosen;
            match driver.init(cpu, &mut data) {
                Ok(initial_khz) => policy.set_cur_khz(initial_khz),
                Err(e) => {
                    log::debug!("initialization failed");
                    drop(data);
                    drop(change);
                    self.cpus.clear_policy_cpu(cpu);
                    return Err(e);
                }
            }
            data.user.min_khz = data.min_khz;
            data.user.max_khz = data.max_khz;
            // The affinity set holds only online CPUs; offline
            // siblings stay reachable through `related`.
            let full = data.affinity.clone();
            data.related.or_assign(&full);
            for sibling in full.iter() {
                if !self.cpus.is_online(sibling) {
                    data.affinity.clear(sibling);
                }
            }
        }

        {
            let mut data = policy.data.write();
            for cb in self.policy_chain.snapshot() {
                (cb.as_ref())(crate::PolicyNotice::Start, &mut data);
            }
        }

        // Another CPU of the affinity set may already own a policy:
        // hardware manages them together, so only an alias is needed
        // here and the local policy retires.
        let affinity = policy.data.read().affinity.clone();
        for sibling in affinity.iter() {
            if sibling == cpu {
                continue;
            }
            if let Some(managed) = self.registry.slot(sibling) {
                self.cpus.set_policy_cpu(cpu, managed.owner());
                {
                    let related = policy.data.read().related.clone();
                    let mut managed_data = managed.data.write();
                    managed_data.affinity.or_assign(&affinity);
                    managed_data.related.or_assign(&related);
                }
                self.registry.set_slot(cpu, managed.clone());
                self.attr_link(cpu, managed.owner());
                log::debug!("CPU {} already managed, adding link", cpu);
                driver.exit(&policy.data.read());
                return Ok(());
            }
        }

        for sibling in affinity.iter() {
            if !self.cpus.is_online(sibling) {
                continue;
            }
            self.registry.set_slot(sibling, policy.clone());
            self.cpus.set_policy_cpu(sibling, cpu);
        }
        self.attr_publish(cpu);
        for sibling in affinity.iter() {
            if sibling != cpu && self.cpus.is_online(sibling) {
                self.attr_link(sibling, cpu);
            }
        }

        // Run the starting sequence: the engine sees no installed
        // governor and performs the initial start.
        let mut proposed = policy.data.read().clone();
        policy.data.write().governor = None;
        let ret = if matches!(driver.scaling(), Scaling::Target(_)) && proposed.governor.is_none()
        {
            // A target-style driver cannot run without a governor.
            Err(CpufreqError::InvalidGovernor)
        } else {
            self.set_policy_locked(&policy, &mut proposed)
        };
        {
            let mut data = policy.data.write();
            data.user.mode = data.mode;
            data.user.governor = data.governor.clone();
        }

        if let Err(e) = ret {
            log::debug!("setting policy failed");
            for sibling in affinity.iter() {
                if self.registry.slot(sibling).map(|p| Arc::ptr_eq(&p, &policy)) == Some(true) {
                    self.registry.take_slot(sibling);
                    self.cpus.clear_policy_cpu(sibling);
                    self.attr_unlink(sibling);
                }
            }
            policy.mark_dying();
            drop(change);
            self.attr_release(cpu, &policy);
            policy.teardown_wait();
            driver.exit(&policy.data.read());
            return Err(e);
        }

        log::debug!("initialization complete");
        Ok(())
    }

    fn sibling_governor(&self, cpu: usize) -> Option<Arc<dyn crate::governor::Governor>> {
        for sibling in 0..self.nr_cpus {
            if sibling == cpu || !self.cpus.is_online(sibling) {
                continue;
            }
            if let Some(sp) = self.registry.slot(sibling) {
                let data = sp.data.read();
                if data.related.contains(cpu) {
                    if let Some(gov) = &data.governor {
                        return Some(gov.clone());
                    }
                }
            }
        }
        None
    }

    /// Detaches `cpu` from its policy.
    ///
    /// Non-owner CPUs just leave the affinity set. When the owner
    /// leaves and siblings survive, ownership transfers to the first
    /// survivor and the policy object lives on. Only the last CPU
    /// tears the policy down.
    pub(crate) fn remove_dev(&self, cpu: usize) -> Result<()> {
        self.ratelimit.disable();
        let ret = self.do_remove_dev(cpu);
        self.ratelimit.enable();
        if ret.is_ok() {
            self.stat_hotplug_remove();
        }
        ret
    }

    fn do_remove_dev(&self, cpu: usize) -> Result<()> {
        log::debug!("unregistering CPU {}", cpu);

        let policy = match self.registry.take_slot(cpu) {
            Some(policy) => policy,
            None => return Err(CpufreqError::NoSuchDevice),
        };
        let change = policy.change_lock.lock();

        if cpu != policy.owner() {
            log::debug!("removing link");
            policy.data.write().affinity.clear(cpu);
            self.cpus.clear_policy_cpu(cpu);
            self.attr_unlink(cpu);
            return Ok(());
        }

        if let Some(gov) = &policy.data.read().governor {
            self.cpus.save_governor(cpu, gov.name());
        }

        let survivors: alloc::vec::Vec<usize> = policy
            .data
            .read()
            .affinity
            .iter()
            .filter(|sibling| *sibling != cpu)
            .collect();

        if let Some(&new_owner) = survivors.first() {
            // Ownership transfer: the first surviving sibling takes
            // over the attribute surface; the driver state is
            // untouched.
            {
                let mut data = policy.data.write();
                data.affinity.clear(cpu);
                data.owner_cpu = new_owner;
            }
            policy.set_owner(new_owner);
            for sibling in &survivors {
                self.cpus.set_policy_cpu(*sibling, new_owner);
            }
            self.cpus.clear_policy_cpu(cpu);
            self.attr_unlink(cpu);
            self.attr_publish(new_owner);
            for sibling in &survivors {
                if *sibling != new_owner {
                    self.attr_link(*sibling, new_owner);
                }
            }
            log::debug!("CPU {} ownership moved to CPU {}", cpu, new_owner);
            return Ok(());
        }

        // Last CPU of the policy: full teardown.
        policy.mark_dying();
        policy.data.write().affinity.clear(cpu);
        self.cpus.clear_policy_cpu(cpu);

        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;
        // The stop event runs with no policy lock held; it may re-enter
        // the notifier bus.
        drop(change);
        if matches!(driver.scaling(), Scaling::Target(_)) {
            let _ = self.governor_event(&policy, GovernorEvent::Stop);
        }

        self.attr_release(cpu, &policy);
        self.ratelimit
            .debug(format_args!("waiting for dropping of refcount"));
        policy.teardown_wait();
        self.ratelimit.debug(format_args!("wait complete"));

        driver.exit(&policy.data.read());
        Ok(())
    }

    /// Prepares the boot CPU's policy for system suspend. The other
    /// CPUs are expected to have been taken offline already.
    pub fn suspend(&self) -> Result<()> {
        let cpu = self.boot_cpu;
        log::debug!("suspending cpu {}", cpu);
        let policy = match self.policy(cpu) {
            Ok(policy) => policy,
            Err(_) => return Ok(()),
        };
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;
        let data = policy.policy_arc().data.read();
        if let Err(e) = driver.suspend(&data) {
            log::error!("suspend failed in ->suspend step on CPU {}", policy.owner());
            return Err(e);
        }
        Ok(())
    }

    /// Restores frequency handling on the boot CPU and queues a policy
    /// re-evaluation so state diverged during sleep converges.
    pub fn resume(&self) -> Result<()> {
        let cpu = self.boot_cpu;
        log::debug!("resuming cpu {}", cpu);
        let policy = match self.policy(cpu) {
            Ok(policy) => policy,
            Err(_) => return Ok(()),
        };
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;
        {
            let data = policy.policy_arc().data.read();
            if let Err(e) = driver.resume(&data) {
                log::error!("resume failed in ->resume step on CPU {}", policy.owner());
                return Err(e);
            }
        }
        self.schedule_update(policy.policy_arc());
        Ok(())
    }
}
