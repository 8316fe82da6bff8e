//! Textual attribute surface.
//!
//! Each policy exposes one authoritative surface on its owner CPU; the
//! other CPUs of the affinity set carry aliases pointing at the owner.
//! Reads take the policy lock shared, writes run through the
//! transition engine, and internal error codes collapse onto the
//! boundary set before returning.

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::governor::GovernedPolicy;
use crate::policy::{Policy, PolicyMode};
use crate::{CpufreqCore, CpufreqError, Result, Scaling, NAME_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceEntry {
    /// The authoritative surface of a policy.
    Owner,
    /// Alias to the owner CPU's surface.
    Link { owner: usize },
}

pub(crate) struct AttrSurfaces {
    entries: Mutex<Vec<Option<SurfaceEntry>>>,
}

impl AttrSurfaces {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            entries: Mutex::new(alloc::vec![None; nr_cpus]),
        }
    }

    fn get(&self, cpu: usize) -> Option<SurfaceEntry> {
        *self.entries.lock().get(cpu)?
    }

    fn set(&self, cpu: usize, entry: Option<SurfaceEntry>) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get_mut(cpu) {
            *slot = entry;
        }
    }
}

impl CpufreqCore {
    pub(crate) fn attr_publish(&self, cpu: usize) {
        self.surfaces.set(cpu, Some(SurfaceEntry::Owner));
    }

    pub(crate) fn attr_link(&self, cpu: usize, owner: usize) {
        self.surfaces.set(cpu, Some(SurfaceEntry::Link { owner }));
    }

    pub(crate) fn attr_unlink(&self, cpu: usize) {
        self.surfaces.set(cpu, None);
    }

    /// Removes the owner surface and drops the reference it holds; the
    /// teardown wait completes once every other holder is gone.
    pub(crate) fn attr_release(&self, cpu: usize, policy: &Arc<Policy>) {
        self.surfaces.set(cpu, None);
        policy.put_ref();
    }

    /// Whether `cpu` currently exposes an attribute surface, and
    /// whether it is an alias.
    pub fn attr_owner(&self, cpu: usize) -> Option<usize> {
        match self.surfaces.get(cpu)? {
            SurfaceEntry::Owner => Some(cpu),
            SurfaceEntry::Link { owner } => Some(owner),
        }
    }

    /// Reads one attribute of `cpu`'s policy as text.
    pub fn attr_read(&self, cpu: usize, name: &str) -> Result<String> {
        self.do_attr_read(cpu, name).map_err(CpufreqError::boundary)
    }

    fn do_attr_read(&self, cpu: usize, name: &str) -> Result<String> {
        if self.surfaces.get(cpu).is_none() {
            return Err(CpufreqError::NoSuchDevice);
        }
        let policy_ref = self.policy(cpu)?;
        let policy = policy_ref.policy_arc();
        let driver = self.registry.current().ok_or(CpufreqError::NoSuchDevice)?;

        match name {
            "cpuinfo_cur_freq" => {
                if driver.get(cpu).is_none() {
                    return Err(CpufreqError::NoSuchDevice);
                }
                let khz = self.get(cpu)?;
                return Ok(format!("{}", khz));
            }
            "scaling_cur_freq" => {
                return match driver.scaling() {
                    Scaling::Target(_) => Ok(format!("{}", policy.cur_khz())),
                    Scaling::SetPolicy(_) => Err(CpufreqError::NoSuchDevice),
                };
            }
            "scaling_driver" => return Ok(String::from(driver.name())),
            "scaling_available_governors" => {
                return Ok(match driver.scaling() {
                    Scaling::SetPolicy(_) => String::from("performance powersave"),
                    Scaling::Target(_) => self.available_governors().join(" "),
                });
            }
            "bios_limit" => {
                return driver
                    .bios_limit(cpu)
                    .map(|khz| format!("{}", khz))
                    .ok_or(CpufreqError::NoSuchDevice);
            }
            "scaling_setspeed" => {
                let governor = policy.data.read().governor.clone();
                let shown = governor.and_then(|gov| {
                    gov.show_setspeed(&GovernedPolicy::new(self, policy))
                });
                return Ok(match shown {
                    Some(khz) => format!("{}", khz),
                    None => String::from("<unsupported>"),
                });
            }
            _ => {}
        }

        let data = policy.data.read();
        if !self.cpus.is_online(cpu) {
            return Err(CpufreqError::NoSuchDevice);
        }
        match name {
            "cpuinfo_min_freq" => Ok(format!("{}", data.info.hw_min_khz)),
            "cpuinfo_max_freq" => Ok(format!("{}", data.info.hw_max_khz)),
            "cpuinfo_transition_latency" => Ok(format!("{}", data.info.transition_latency_ns)),
            "scaling_min_freq" => Ok(format!("{}", data.min_khz)),
            "scaling_max_freq" => Ok(format!("{}", data.max_khz)),
            "policy_min_freq" => Ok(format!("{}", data.user.min_khz)),
            "policy_max_freq" => Ok(format!("{}", data.user.max_khz)),
            "scaling_governor" => match data.mode {
                PolicyMode::Performance => Ok(String::from("performance")),
                PolicyMode::Powersave => Ok(String::from("powersave")),
                PolicyMode::Governed => data
                    .governor
                    .as_ref()
                    .map(|g| String::from(g.name()))
                    .ok_or(CpufreqError::InvalidArgument),
            },
            "affected_cpus" => Ok(format!("{}", data.affinity)),
            "related_cpus" => Ok(format!("{}", data.related.union(&data.affinity))),
            _ => Err(CpufreqError::NoSuchDevice),
        }
    }

    /// Writes one attribute of `cpu`'s policy from text.
    pub fn attr_write(&self, cpu: usize, name: &str, value: &str) -> Result<()> {
        self.do_attr_write(cpu, name, value)
            .map_err(CpufreqError::boundary)
    }

    fn do_attr_write(&self, cpu: usize, name: &str, value: &str) -> Result<()> {
        if self.surfaces.get(cpu).is_none() {
            return Err(CpufreqError::NoSuchDevice);
        }
        let policy_ref = self.policy(cpu)?;
        let policy = policy_ref.policy_arc().clone();

        match name {
            "scaling_min_freq" => {
                let khz = parse_khz(value)?;
                self.store_limit(&policy, cpu, khz, true)
            }
            "scaling_max_freq" => {
                let khz = parse_khz(value)?;
                self.store_limit(&policy, cpu, khz, false)
            }
            "scaling_governor" => {
                let name = parse_name(value)?;
                self.store_governor_all(&name)
            }
            "scaling_setspeed" => {
                let khz = parse_khz(value)?;
                let governor = policy
                    .data
                    .read()
                    .governor
                    .clone()
                    .ok_or(CpufreqError::InvalidArgument)?;
                governor.store_setspeed(&GovernedPolicy::new(self, &policy), khz)
            }
            "cpuinfo_min_freq"
            | "cpuinfo_max_freq"
            | "cpuinfo_transition_latency"
            | "cpuinfo_cur_freq"
            | "scaling_cur_freq"
            | "scaling_driver"
            | "scaling_available_governors"
            | "affected_cpus"
            | "related_cpus"
            | "bios_limit"
            | "policy_min_freq"
            | "policy_max_freq" => Err(CpufreqError::IoError),
            _ => Err(CpufreqError::NoSuchDevice),
        }
    }

    /// Runs a limit write through the engine and records the accepted
    /// request as the user window.
    fn store_limit(&self, policy: &Arc<Policy>, cpu: usize, khz: u32, lower: bool) -> Result<()> {
        let guard = policy.change_lock.lock();
        if !self.cpus.is_online(cpu) {
            return Err(CpufreqError::NoSuchDevice);
        }
        let mut proposed = policy.data.read().clone();
        if lower {
            proposed.min_khz = khz;
        } else {
            proposed.max_khz = khz;
        }
        let ret = self.set_policy_locked(policy, &mut proposed);
        if ret.is_ok() {
            let mut data = policy.data.write();
            if lower {
                data.user.min_khz = khz;
            } else {
                data.user.max_khz = khz;
            }
        }
        drop(guard);
        ret
    }

    /// Applies a governor write to every present CPU's own policy,
    /// one engine run per distinct policy.
    fn store_governor_all(&self, name: &str) -> Result<()> {
        let (mode, governor) = self.parse_governor(name)?;
        let mut handled: BTreeSet<usize> = BTreeSet::new();
        for cpu in 0..self.nr_cpus {
            let policy_ref = match self.policy(cpu) {
                Ok(policy_ref) => policy_ref,
                Err(_) => continue,
            };
            let policy = policy_ref.policy_arc().clone();
            if !handled.insert(policy.owner()) {
                continue;
            }
            let guard = policy.change_lock.lock();
            let mut proposed = policy.data.read().clone();
            proposed.mode = mode;
            proposed.governor = governor.clone();
            if self.set_policy_locked(&policy, &mut proposed).is_ok() {
                let mut data = policy.data.write();
                data.user.mode = data.mode;
                data.user.governor = data.governor.clone();
                log::debug!("set governor {} on cpu {}", name, cpu);
            }
            drop(guard);
        }
        Ok(())
    }
}

fn parse_khz(value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| CpufreqError::InvalidArgument)
}

fn parse_name(value: &str) -> Result<String> {
    let token = value.trim();
    if token.is_empty() || token.len() > NAME_LEN || token.contains(char::is_whitespace) {
        return Err(CpufreqError::InvalidArgument);
    }
    Ok(String::from(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn khz_parsing() {
        assert_eq!(parse_khz(" 1400000 ").unwrap(), 1_400_000);
        assert!(parse_khz("fast").is_err());
        assert!(parse_khz("").is_err());
        assert!(parse_khz("-5").is_err());
    }

    #[test]
    fn name_parsing() {
        assert_eq!(parse_name("ondemand\n").unwrap(), "ondemand");
        assert!(parse_name("a name with spaces").is_err());
        assert!(parse_name("averyverylonggovernorname").is_err());
        assert!(parse_name("   ").is_err());
    }
}
