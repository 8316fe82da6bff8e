//! End-to-end behavior of the policy lifecycle.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::harness::*;
use crate::driver::DriverFlags;
use crate::notifier::{PolicyNotice, TransitionPhase};
use crate::{CpuEvent, CpufreqCore, CpufreqError, QosClass};

#[test]
fn basic_limit_write() {
    let rig = rig();
    let log = PolicyLog::attach(&rig.core);

    rig.core.attr_write(0, "scaling_max_freq", "1400000").unwrap();

    assert_eq!(rig.core.attr_read(0, "scaling_min_freq").unwrap(), "200000");
    assert_eq!(rig.core.attr_read(0, "scaling_max_freq").unwrap(), "1400000");
    assert_eq!(rig.core.attr_read(0, "policy_max_freq").unwrap(), "1400000");
    assert_eq!(log.count(PolicyNotice::Notify), 1);

    let stats = rig.core.statistics();
    assert_eq!(stats.hotplug_adds, 1);
    assert!(stats.policy_updates >= 2);
}

#[test]
fn qos_clamp_preserves_user_window() {
    let rig = rig();
    rig.core.attr_write(0, "scaling_min_freq", "800000").unwrap();

    let req = rig.core.qos_add_request(QosClass::CpuFreqMin, 1_200_000);
    assert_eq!(rig.core.deferred_work_len(), 1);
    rig.core.process_deferred_work();

    assert_eq!(rig.core.attr_read(0, "scaling_min_freq").unwrap(), "1200000");
    assert_eq!(rig.core.attr_read(0, "policy_min_freq").unwrap(), "800000");

    rig.core.qos_update_request(QosClass::CpuFreqMin, req, 0).unwrap();
    rig.core.process_deferred_work();
    assert_eq!(rig.core.attr_read(0, "scaling_min_freq").unwrap(), "800000");
}

#[test]
fn qos_ceiling_clamps_and_releases() {
    let rig = rig();
    let req = rig.core.qos_add_request(QosClass::CpuFreqMax, 1_000_000);
    rig.core.process_deferred_work();
    assert_eq!(rig.core.attr_read(0, "scaling_max_freq").unwrap(), "1000000");

    rig.core.qos_remove_request(QosClass::CpuFreqMax, req).unwrap();
    rig.core.process_deferred_work();
    assert_eq!(rig.core.attr_read(0, "scaling_max_freq").unwrap(), "2000000");
}

#[test]
fn qos_floor_never_raises_user_ceiling() {
    let rig = rig();
    rig.core.attr_write(0, "scaling_max_freq", "1000000").unwrap();

    // A floor above the user's ceiling is bounded by that ceiling.
    rig.core.qos_add_request(QosClass::CpuFreqMin, 1_600_000);
    rig.core.process_deferred_work();

    assert_eq!(rig.core.attr_read(0, "scaling_min_freq").unwrap(), "1000000");
    assert_eq!(rig.core.attr_read(0, "scaling_max_freq").unwrap(), "1000000");
}

#[test]
fn governor_latency_fallback_surfaces_success() {
    let rig = rig(); // transition latency 10 us
    let strict = Arc::new(RecordingGovernor::new("strict").with_max_latency(1_000));
    rig.core.register_governor(strict.clone()).unwrap();

    rig.core.attr_write(0, "scaling_governor", "strict").unwrap();

    assert_eq!(rig.core.attr_read(0, "scaling_governor").unwrap(), "performance");
    // The strict governor never received a start.
    assert!(strict.events_seen().is_empty());
}

#[test]
fn hotplug_migration_transfers_ownership() {
    let driver = MockDriver::new(200_000, 2_000_000, 10_000).with_group(&[0, 1]);
    let rig = rig_with(driver, 2, &[0, 1]);

    let before = rig.core.policy(1).unwrap().policy_arc().clone();
    assert_eq!(before.owner(), 0);
    assert_eq!(rig.core.attr_owner(1), Some(0));

    let inits = rig.driver.init_calls.load(Ordering::Relaxed);
    let exits = rig.driver.exit_calls.load(Ordering::Relaxed);

    rig.core.cpu_event(0, CpuEvent::DownPrepare).unwrap();

    let after = rig.core.policy(1).unwrap().policy_arc().clone();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.owner(), 1);
    assert_eq!(rig.core.attr_owner(1), Some(1));
    assert!(rig.core.policy(0).is_err());

    // Ownership transfer only: no driver exit/init pair ran.
    assert_eq!(rig.driver.init_calls.load(Ordering::Relaxed), inits);
    assert_eq!(rig.driver.exit_calls.load(Ordering::Relaxed), exits);

    assert_eq!(rig.core.attr_read(1, "affected_cpus").unwrap(), "1");
    assert_eq!(rig.core.attr_read(1, "related_cpus").unwrap(), "0 1");
}

#[test]
fn out_of_sync_repair() {
    let driver = MockDriver::new(200_000, 1_000_000, 10_000).with_initial(1_000_000);
    let rig = rig_with(driver, 1, &[0]);
    let log = TransitionLog::attach(&rig.core);

    rig.driver.script_get(0, 800_000);
    assert_eq!(rig.core.get(0).unwrap(), 800_000);

    let entries = log.snapshot();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, TransitionPhase::PreChange);
    assert_eq!(entries[1].0, TransitionPhase::PostChange);
    for (_, freqs) in &entries {
        assert_eq!((freqs.cpu, freqs.old_khz, freqs.new_khz), (0, 1_000_000, 800_000));
    }
    assert_eq!(rig.core.quick_get(0), Some(800_000));

    assert_eq!(rig.core.deferred_work_len(), 1);
    rig.core.process_deferred_work();
    assert_eq!(rig.core.deferred_work_len(), 0);
}

#[test]
fn governor_roundtrip_target_driver() {
    let rig = rig();
    rig.core.attr_write(0, "scaling_governor", "powersave").unwrap();
    assert_eq!(rig.core.attr_read(0, "scaling_governor").unwrap(), "powersave");
    rig.core.attr_write(0, "scaling_governor", "userspace").unwrap();
    assert_eq!(rig.core.attr_read(0, "scaling_governor").unwrap(), "userspace");
}

#[test]
fn governor_roundtrip_setpolicy_driver() {
    let core = Arc::new(CpufreqCore::with_cpus(1));
    let driver = Arc::new(RangeDriver::new(200_000, 2_000_000));
    core.cpu_event(0, CpuEvent::Online).unwrap();
    core.register_driver(driver.clone()).unwrap();

    assert_eq!(core.attr_read(0, "scaling_governor").unwrap(), "performance");
    assert_eq!(
        core.attr_read(0, "scaling_available_governors").unwrap(),
        "performance powersave"
    );

    core.attr_write(0, "scaling_governor", "powersave").unwrap();
    assert_eq!(core.attr_read(0, "scaling_governor").unwrap(), "powersave");
    let (_, _, mode) = *driver.set_calls.lock().last().unwrap();
    assert_eq!(mode, crate::PolicyMode::Powersave);

    // Registry governors do not exist for a range-managing driver.
    assert_eq!(
        core.attr_write(0, "scaling_governor", "ondemand"),
        Err(CpufreqError::InvalidArgument)
    );
}

#[test]
fn setspeed_through_userspace_governor() {
    let rig = rig();
    assert_eq!(
        rig.core.attr_read(0, "scaling_setspeed").unwrap(),
        "<unsupported>"
    );

    rig.core.attr_write(0, "scaling_governor", "userspace").unwrap();
    rig.core.attr_write(0, "scaling_setspeed", "600000").unwrap();
    assert_eq!(rig.core.attr_read(0, "scaling_setspeed").unwrap(), "600000");
    assert_eq!(rig.core.quick_get(0), Some(600_000));

    // Requests outside the window are clamped onto it.
    rig.core.attr_write(0, "scaling_setspeed", "5000000").unwrap();
    assert_eq!(rig.core.quick_get(0), Some(2_000_000));
}

#[test]
fn invalid_writes_are_rejected_without_state_change() {
    let rig = rig();
    let before = rig.core.get_policy_snapshot(0).unwrap();

    assert_eq!(
        rig.core.attr_write(0, "scaling_max_freq", "fast"),
        Err(CpufreqError::InvalidArgument)
    );
    assert_eq!(
        rig.core.attr_write(0, "scaling_max_freq", "100000"),
        Err(CpufreqError::InvalidArgument)
    );
    assert_eq!(
        rig.core.attr_write(0, "scaling_governor", "no such governor"),
        Err(CpufreqError::InvalidArgument)
    );
    assert_eq!(
        rig.core.attr_write(0, "scaling_driver", "x"),
        Err(CpufreqError::IoError)
    );
    assert_eq!(
        rig.core.attr_write(0, "unknown_attr", "1"),
        Err(CpufreqError::NoSuchDevice)
    );

    let after = rig.core.get_policy_snapshot(0).unwrap();
    assert_eq!((before.min_khz, before.max_khz), (after.min_khz, after.max_khz));
    assert_eq!(
        (before.user.min_khz, before.user.max_khz),
        (after.user.min_khz, after.user.max_khz)
    );
}

#[test]
fn attribute_surface_reads() {
    let driver = MockDriver::new(200_000, 2_000_000, 10_000).with_bios_limit(1_800_000);
    let rig = rig_with(driver, 1, &[0]);

    assert_eq!(rig.core.attr_read(0, "cpuinfo_min_freq").unwrap(), "200000");
    assert_eq!(rig.core.attr_read(0, "cpuinfo_max_freq").unwrap(), "2000000");
    assert_eq!(
        rig.core.attr_read(0, "cpuinfo_transition_latency").unwrap(),
        "10000"
    );
    assert_eq!(rig.core.attr_read(0, "scaling_driver").unwrap(), "mockfreq");
    assert_eq!(
        rig.core.attr_read(0, "scaling_available_governors").unwrap(),
        "performance powersave userspace"
    );
    assert_eq!(rig.core.attr_read(0, "bios_limit").unwrap(), "1800000");
    assert_eq!(rig.core.attr_read(0, "affected_cpus").unwrap(), "0");
    assert_eq!(
        rig.core.attr_read(0, "scaling_cur_freq").unwrap(),
        rig.core.attr_read(0, "cpuinfo_cur_freq").unwrap()
    );
}

#[test]
fn suspend_resume_boot_cpu() {
    let rig = rig();
    rig.core.suspend().unwrap();
    assert_eq!(rig.driver.suspend_calls.load(Ordering::Relaxed), 1);

    rig.core.resume().unwrap();
    assert_eq!(rig.driver.resume_calls.load(Ordering::Relaxed), 1);
    // Resume queues a deferred re-evaluation.
    assert_eq!(rig.core.deferred_work_len(), 1);
    rig.core.process_deferred_work();
    assert_eq!(rig.core.deferred_work_len(), 0);
}

#[test]
fn driver_registration_lifecycle() {
    let core = Arc::new(CpufreqCore::with_cpus(1));
    core.register_governor(Arc::new(crate::governor::PerformanceGovernor))
        .unwrap();

    // Non-sticky driver with no online CPU rolls back.
    let driver = Arc::new(MockDriver::new(200_000, 2_000_000, 10_000));
    assert_eq!(
        core.register_driver(driver.clone()),
        Err(CpufreqError::NoSuchDevice)
    );

    // Sticky registration survives the same situation.
    let sticky = Arc::new(
        MockDriver::new(200_000, 2_000_000, 10_000).with_flags(DriverFlags::STICKY),
    );
    core.register_driver(sticky.clone()).unwrap();
    assert_eq!(core.driver_name().as_deref(), Some("mockfreq"));

    // Second driver is refused while one is active.
    let other = Arc::new(MockDriver::new(1, 2, 3));
    assert_eq!(core.register_driver(other), Err(CpufreqError::Busy));

    core.cpu_event(0, CpuEvent::Online).unwrap();
    assert!(core.policy(0).is_ok());

    // An outstanding reference pins the driver.
    {
        let _held = core.policy(0).unwrap();
        assert_eq!(core.unregister_driver("mockfreq"), Err(CpufreqError::Busy));
    }
    core.unregister_driver("mockfreq").unwrap();
    assert!(core.policy(0).is_err());
    assert_eq!(core.driver_name(), None);
}

#[test]
fn governor_unregister_refused_while_running() {
    let rig = rig();
    assert_eq!(
        rig.core.unregister_governor("performance"),
        Err(CpufreqError::Busy)
    );
    rig.core.attr_write(0, "scaling_governor", "powersave").unwrap();
    rig.core.unregister_governor("performance").unwrap();
    assert_eq!(
        rig.core.attr_read(0, "scaling_available_governors").unwrap(),
        "powersave userspace"
    );
}

#[test]
fn governor_switch_rollback_on_failed_start() {
    let rig = rig();
    let flaky = Arc::new(RecordingGovernor::new("flaky"));
    flaky.fail_start.store(true, Ordering::Release);
    rig.core.register_governor(flaky.clone()).unwrap();

    assert_eq!(
        rig.core.set_governor_for(0, "flaky"),
        Err(CpufreqError::InvalidGovernor)
    );
    // The previous governor is running again.
    assert_eq!(rig.core.current_governor(0).unwrap(), "performance");
    rig.core.attr_write(0, "scaling_max_freq", "1500000").unwrap();
}

#[test]
fn direct_governor_programming() {
    let rig = rig();
    assert_eq!(rig.core.current_governor(0).unwrap(), "performance");
    // Fast-fail when the governor is already running.
    assert_eq!(
        rig.core.set_governor_for(0, "performance"),
        Err(CpufreqError::InvalidArgument)
    );
    rig.core.set_governor_for(0, "powersave").unwrap();
    assert_eq!(rig.core.current_governor(0).unwrap(), "powersave");
    assert_eq!(rig.core.quick_get(0), Some(200_000));

    rig.core.poll(0).unwrap();
    assert_eq!(rig.core.quick_get(0), Some(200_000));
    assert_eq!(rig.core.getavg(0), Some(200_000));
}

#[test]
fn managed_sibling_attaches_via_alias() {
    let driver = MockDriver::new(200_000, 2_000_000, 10_000).with_group(&[0, 1]);
    let rig = rig_with(driver, 2, &[0]);

    assert!(rig.core.policy(1).is_err());
    rig.core.cpu_event(1, CpuEvent::Online).unwrap();

    let p0 = rig.core.policy(0).unwrap().policy_arc().clone();
    let p1 = rig.core.policy(1).unwrap().policy_arc().clone();
    assert!(Arc::ptr_eq(&p0, &p1));
    assert_eq!(rig.core.attr_owner(1), Some(0));
    // The short-lived bootstrap policy of CPU 1 was retired.
    assert_eq!(rig.driver.exit_calls.load(Ordering::Relaxed), 1);
    assert_eq!(rig.core.attr_read(1, "affected_cpus").unwrap(), "0 1");

    // Reads through the alias answer from the owner surface.
    assert_eq!(
        rig.core.attr_read(0, "scaling_max_freq").unwrap(),
        rig.core.attr_read(1, "scaling_max_freq").unwrap()
    );
}

#[test]
fn reattach_without_sibling_installs_default_governor() {
    let rig = rig();
    rig.core.attr_write(0, "scaling_governor", "powersave").unwrap();

    rig.core.cpu_event(0, CpuEvent::DownPrepare).unwrap();
    assert!(rig.core.policy(0).is_err());

    // The departing governor is recorded but never consulted again:
    // with no online sibling, the fresh policy runs the default.
    rig.core.cpu_event(0, CpuEvent::Online).unwrap();
    assert_eq!(rig.core.attr_read(0, "scaling_governor").unwrap(), "performance");
}

#[test]
fn reattach_inherits_online_sibling_governor() {
    let driver = MockDriver::new(200_000, 2_000_000, 10_000).with_group(&[0, 1]);
    let rig = rig_with(driver, 2, &[0, 1]);
    rig.core.attr_write(0, "scaling_governor", "powersave").unwrap();

    rig.core.cpu_event(1, CpuEvent::DownPrepare).unwrap();
    rig.core.cpu_event(1, CpuEvent::Online).unwrap();

    let p0 = rig.core.policy(0).unwrap().policy_arc().clone();
    let p1 = rig.core.policy(1).unwrap().policy_arc().clone();
    assert!(Arc::ptr_eq(&p0, &p1));
    assert_eq!(rig.core.attr_read(1, "scaling_governor").unwrap(), "powersave");
}

#[test]
fn down_failed_reattaches() {
    let rig = rig();
    rig.core.cpu_event(0, CpuEvent::DownPrepare).unwrap();
    assert!(rig.core.policy(0).is_err());
    rig.core.cpu_event(0, CpuEvent::DownFailed).unwrap();
    assert!(rig.core.policy(0).is_ok());
    assert!(rig.core.is_online(0));
}

#[test]
fn failed_driver_init_discards_policy() {
    let rig = rig();
    rig.core.cpu_event(0, CpuEvent::DownPrepare).unwrap();

    rig.driver.fail_init.store(true, Ordering::Release);
    assert_eq!(
        rig.core.cpu_event(0, CpuEvent::Online),
        Err(CpufreqError::IoError)
    );
    assert!(rig.core.policy(0).is_err());

    rig.driver.fail_init.store(false, Ordering::Release);
    rig.core.cpu_event(0, CpuEvent::Online).unwrap();
    assert!(rig.core.policy(0).is_ok());
}

#[test]
fn transition_events_carry_driver_flags() {
    let driver =
        MockDriver::new(200_000, 2_000_000, 10_000).with_flags(DriverFlags::CONST_LOOPS);
    let rig = rig_with(driver, 1, &[0]);
    let log = TransitionLog::attach(&rig.core);

    rig.core.attr_write(0, "scaling_governor", "powersave").unwrap();
    let entries = log.snapshot();
    assert!(!entries.is_empty());
    for (_, freqs) in entries {
        assert!(freqs.flags.contains(DriverFlags::CONST_LOOPS));
    }
}
