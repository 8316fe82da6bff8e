//! Hardware back-end contract and registry.
//!
//! Exactly zero or one driver is registered at a time. The registry's
//! spin lock also guards the CPU-to-policy table; both are read on hot
//! paths and the critical sections stay a few loads long.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::engine::TransitionBus;
use crate::policy::{Policy, PolicyData};
use crate::{CpufreqCore, CpufreqError, Result, NAME_LEN};

bitflags! {
    /// Driver capability flags, carried into every transition event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFlags: u32 {
        /// Loop calibrations need not track frequency changes.
        const CONST_LOOPS = 1 << 0;
        /// Registration succeeds even if no CPU could be initialized.
        const STICKY = 1 << 1;
    }
}

/// How a specific target frequency is rounded onto the hardware's
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Highest available frequency at or below the target.
    NearestBelow,
    /// Lowest available frequency at or above the target.
    NearestAbove,
}

/// Back end that jumps to specific frequencies.
pub trait TargetOps: Send + Sync {
    /// Programs the clock. The implementation must bracket the actual
    /// change with `bus.pre_change` / `bus.post_change`.
    fn target(
        &self,
        bus: &TransitionBus<'_>,
        policy: &PolicyData,
        target_khz: u32,
        relation: Relation,
    ) -> Result<()>;
}

/// Back end that manages itself within the committed `[min, max]`.
pub trait SetPolicyOps: Send + Sync {
    fn set_policy(&self, policy: &PolicyData) -> Result<()>;
}

/// The two driver shapes. A driver exposes exactly one.
pub enum Scaling<'a> {
    SetPolicy(&'a dyn SetPolicyOps),
    Target(&'a dyn TargetOps),
}

/// Contract for a hardware back end.
pub trait CpufreqDriver: Send + Sync {
    fn name(&self) -> &str;

    fn flags(&self) -> DriverFlags {
        DriverFlags::empty()
    }

    /// Fills hardware info, limits, and the affinity/related masks for
    /// the policy owning `cpu`; returns the initial frequency.
    fn init(&self, cpu: usize, policy: &mut PolicyData) -> Result<u32>;

    /// Clamps the proposed window to a lawful one; may reject.
    fn verify(&self, policy: &mut PolicyData) -> Result<()>;

    fn scaling(&self) -> Scaling<'_>;

    /// Observed frequency, if the hardware can report one.
    fn get(&self, _cpu: usize) -> Option<u32> {
        None
    }

    /// Running average frequency, if the hardware tracks one.
    fn getavg(&self, _policy: &PolicyData, _cpu: usize) -> Option<u32> {
        None
    }

    /// Firmware frequency ceiling, if one exists.
    fn bios_limit(&self, _cpu: usize) -> Option<u32> {
        None
    }

    fn suspend(&self, _policy: &PolicyData) -> Result<()> {
        Ok(())
    }

    fn resume(&self, _policy: &PolicyData) -> Result<()> {
        Ok(())
    }

    fn exit(&self, _policy: &PolicyData) {}
}

/// Flags as seen by the core: range-managing drivers imply constant
/// loop calibration.
pub(crate) fn effective_flags(driver: &dyn CpufreqDriver) -> DriverFlags {
    let mut flags = driver.flags();
    if matches!(driver.scaling(), Scaling::SetPolicy(_)) {
        flags |= DriverFlags::CONST_LOOPS;
    }
    flags
}

pub(crate) struct RegistryState {
    pub driver: Option<Arc<dyn CpufreqDriver>>,
    pub slots: Vec<Option<Arc<Policy>>>,
}

pub(crate) struct DriverRegistry {
    pub(crate) state: Mutex<RegistryState>,
    usage: AtomicUsize,
}

impl DriverRegistry {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                driver: None,
                slots: (0..nr_cpus).map(|_| None).collect(),
            }),
            usage: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn CpufreqDriver>> {
        self.state.lock().driver.clone()
    }

    pub fn slot(&self, cpu: usize) -> Option<Arc<Policy>> {
        self.state.lock().slots.get(cpu)?.clone()
    }

    pub fn set_slot(&self, cpu: usize, policy: Arc<Policy>) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(cpu) {
            *slot = Some(policy);
        }
    }

    pub fn take_slot(&self, cpu: usize) -> Option<Arc<Policy>> {
        self.state.lock().slots.get_mut(cpu)?.take()
    }

    pub fn any_slot(&self) -> bool {
        self.state.lock().slots.iter().any(|s| s.is_some())
    }

    pub fn pin(&self) {
        self.usage.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.usage.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn pinned(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }
}

impl CpufreqCore {
    /// Registers the hardware back end and attaches every online CPU.
    ///
    /// Fails with `Busy` when another driver got here first, and with
    /// `NoSuchDevice` when a non-sticky driver initializes no CPU.
    pub fn register_driver(&self, driver: Arc<dyn CpufreqDriver>) -> Result<()> {
        if driver.name().is_empty() || driver.name().len() > NAME_LEN {
            return Err(CpufreqError::InvalidArgument);
        }

        log::debug!("trying to register driver {}", driver.name());

        {
            let mut state = self.registry.state.lock();
            if state.driver.is_some() {
                return Err(CpufreqError::Busy);
            }
            state.driver = Some(driver.clone());
        }

        for cpu in 0..self.nr_cpus {
            if self.cpus.is_online(cpu) {
                let _ = self.add_dev(cpu);
            }
        }

        if !effective_flags(driver.as_ref()).contains(DriverFlags::STICKY)
            && !self.registry.any_slot()
        {
            log::debug!("no CPU initialized for driver {}", driver.name());
            self.registry.state.lock().driver = None;
            return Err(CpufreqError::NoSuchDevice);
        }

        log::info!("driver {} up and running", driver.name());
        Ok(())
    }

    /// Unregisters the current driver after detaching every CPU.
    ///
    /// Outstanding policy references pin the driver; the call fails
    /// with `Busy` until they drain.
    pub fn unregister_driver(&self, name: &str) -> Result<()> {
        match self.registry.current() {
            Some(driver) if driver.name() == name => {}
            _ => return Err(CpufreqError::InvalidArgument),
        }
        if self.registry.pinned() != 0 {
            return Err(CpufreqError::Busy);
        }

        log::debug!("unregistering driver {}", name);

        for cpu in 0..self.nr_cpus {
            if self.registry.slot(cpu).is_some() {
                let _ = self.remove_dev(cpu);
            }
        }

        self.registry.state.lock().driver = None;
        Ok(())
    }

    /// Name of the active driver.
    pub fn driver_name(&self) -> Option<alloc::string::String> {
        self.registry
            .current()
            .map(|d| alloc::string::String::from(d.name()))
    }

    pub(crate) fn registry_unpin(&self) {
        self.registry.unpin();
    }
}
