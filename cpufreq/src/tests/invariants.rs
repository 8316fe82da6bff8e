//! Structural invariants, held across randomized operation sequences.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::harness::*;
use crate::notifier::TransitionPhase;
use crate::policy::Policy;
use crate::{CpuEvent, CpufreqCore, QosClass};

/// Table/affinity/limit consistency after any operation:
/// every online CPU's slot (if any) covers it, every affinity member
/// of a policy resolves back to that policy and its owner, and the
/// committed window sits inside the hardware bounds.
fn check_invariants(core: &CpufreqCore) {
    let nr = core.nr_cpus();
    for cpu in 0..nr {
        if core.is_online(cpu) {
            if let Some(policy) = core.registry.slot(cpu) {
                assert!(
                    policy.data.read().affinity.contains(cpu),
                    "cpu {} attached to a policy that does not cover it",
                    cpu
                );
            }
        }
    }

    let mut seen: Vec<Arc<Policy>> = Vec::new();
    for cpu in 0..nr {
        let policy = match core.registry.slot(cpu) {
            Some(policy) => policy,
            None => continue,
        };
        if seen.iter().any(|p| Arc::ptr_eq(p, &policy)) {
            continue;
        }
        seen.push(policy.clone());

        let data = policy.data.read();
        assert_eq!(data.owner_cpu, policy.owner());
        assert!(data.info.hw_min_khz <= data.min_khz);
        assert!(data.min_khz <= data.max_khz);
        assert!(data.max_khz <= data.info.hw_max_khz);
        for member in data.affinity.iter() {
            let slot = core
                .registry
                .slot(member)
                .expect("affinity member missing from the table");
            assert!(Arc::ptr_eq(&slot, &policy));
            assert_eq!(core.cpus.policy_cpu(member), Some(policy.owner()));
            assert_eq!(core.attr_owner(member), Some(policy.owner()));
        }
    }
}

#[test]
fn add_dev_is_idempotent() {
    let rig = rig();
    let first = rig.core.policy(0).unwrap().policy_arc().clone();
    rig.core.cpu_event(0, CpuEvent::Online).unwrap();
    let second = rig.core.policy(0).unwrap().policy_arc().clone();
    assert!(Arc::ptr_eq(&first, &second));
    check_invariants(&rig.core);
}

#[test]
fn limits_respect_hardware_bounds_after_writes() {
    let rig = rig();
    for value in ["1", "199999", "200000", "1234567", "2000000", "99999999"] {
        let _ = rig.core.attr_write(0, "scaling_min_freq", value);
        check_invariants(&rig.core);
        let _ = rig.core.attr_write(0, "scaling_max_freq", value);
        check_invariants(&rig.core);
    }
}

#[test]
fn transition_phases_pair_up() {
    let rig = rig();
    let log = TransitionLog::attach(&rig.core);

    rig.core.attr_write(0, "scaling_governor", "powersave").unwrap();
    rig.core.attr_write(0, "scaling_governor", "userspace").unwrap();
    rig.core.attr_write(0, "scaling_setspeed", "700000").unwrap();
    rig.core.attr_write(0, "scaling_setspeed", "900000").unwrap();

    let entries = log.snapshot();
    assert!(!entries.is_empty());
    assert_eq!(entries.len() % 2, 0);
    for pair in entries.chunks(2) {
        let (first_phase, first) = &pair[0];
        let (second_phase, second) = &pair[1];
        assert_eq!(*first_phase, TransitionPhase::PreChange);
        assert_eq!(*second_phase, TransitionPhase::PostChange);
        assert_eq!(first.cpu, second.cpu);
        assert_eq!(first.old_khz, second.old_khz);
        assert_eq!(first.new_khz, second.new_khz);
    }
}

#[test]
fn governed_policies_balance_start_and_stop() {
    let rig = rig();
    let tracer = Arc::new(RecordingGovernor::new("tracer"));
    rig.core.register_governor(tracer.clone()).unwrap();

    rig.core.attr_write(0, "scaling_governor", "tracer").unwrap();
    rig.core.attr_write(0, "scaling_governor", "powersave").unwrap();
    rig.core.attr_write(0, "scaling_governor", "tracer").unwrap();
    rig.core.cpu_event(0, CpuEvent::DownPrepare).unwrap();

    let events = tracer.events_seen();
    let starts = events
        .iter()
        .filter(|(_, e)| *e == crate::GovernorEvent::Start)
        .count();
    let stops = events
        .iter()
        .filter(|(_, e)| *e == crate::GovernorEvent::Stop)
        .count();
    assert_eq!(starts, 2);
    assert_eq!(stops, 2);
}

#[test]
fn randomized_exploration_keeps_tables_consistent() {
    for seed in [1u64, 0x5eed, 0xdead_beef] {
        let driver = MockDriver::new(200_000, 2_000_000, 10_000)
            .with_group(&[0, 1])
            .with_initial(1_000_000);
        let rig = rig_with(driver, 4, &[0, 1, 2, 3]);
        let mut random = Lcg::new(seed);
        let qos_min = rig.core.qos_add_request(QosClass::CpuFreqMin, 0);
        let qos_max = rig.core.qos_add_request(QosClass::CpuFreqMax, u32::MAX);

        for _ in 0..250 {
            let cpu = random.below(4) as usize;
            match random.below(8) {
                0 => {
                    let _ = rig.core.cpu_event(cpu, CpuEvent::Online);
                }
                1 => {
                    let _ = rig.core.cpu_event(cpu, CpuEvent::DownPrepare);
                }
                2 => {
                    let khz = 150_000 + random.below(2_100_000) as u32;
                    let _ = rig
                        .core
                        .attr_write(cpu, "scaling_min_freq", &alloc::format!("{}", khz));
                }
                3 => {
                    let khz = 150_000 + random.below(2_100_000) as u32;
                    let _ = rig
                        .core
                        .attr_write(cpu, "scaling_max_freq", &alloc::format!("{}", khz));
                }
                4 => {
                    let name = ["performance", "powersave", "userspace"]
                        [random.below(3) as usize];
                    let _ = rig.core.attr_write(cpu, "scaling_governor", name);
                }
                5 => {
                    let khz = random.below(2_500_000) as u32;
                    let _ = rig.core.qos_update_request(QosClass::CpuFreqMin, qos_min, khz);
                }
                6 => {
                    let khz = 400_000 + random.below(2_500_000) as u32;
                    let _ = rig.core.qos_update_request(QosClass::CpuFreqMax, qos_max, khz);
                }
                _ => rig.core.process_deferred_work(),
            }
            check_invariants(&rig.core);
        }

        // Whatever the walk did, every online CPU can still be read or
        // is cleanly detached.
        for cpu in 0..4 {
            if rig.core.policy(cpu).is_ok() {
                rig.core.attr_read(cpu, "scaling_min_freq").unwrap();
            }
        }
    }
}
