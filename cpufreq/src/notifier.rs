//! Notifier chains for transition and policy events.
//!
//! One chain abstraction serves both buses; the `blocking` flag records
//! the delivery contract. The transition chain is fanned out while
//! other readers run and its subscribers must not suspend; the policy
//! chain is delivered from blocking context and its subscribers may.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::driver::DriverFlags;
use crate::policy::PolicyData;

/// Phase of a hardware frequency change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    PreChange,
    PostChange,
}

/// Event record carried through the transition chain.
#[derive(Debug, Clone)]
pub struct FreqChange {
    pub cpu: usize,
    pub old_khz: u32,
    pub new_khz: u32,
    pub flags: DriverFlags,
}

impl FreqChange {
    pub fn new(cpu: usize, old_khz: u32, new_khz: u32) -> Self {
        Self {
            cpu,
            old_khz,
            new_khz,
            flags: DriverFlags::empty(),
        }
    }
}

/// Notices delivered on the policy chain during a policy mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyNotice {
    /// A policy has been created and initialized by the driver.
    Start,
    /// Subscribers may tighten the proposed limits for any reason.
    Adjust,
    /// Subscribers may tighten the proposed limits for hardware
    /// incompatibilities.
    Incompatible,
    /// The proposed policy is about to be committed.
    Notify,
    /// Committed limits changed.
    LimitsChanged,
}

pub type TransitionCallback = dyn Fn(TransitionPhase, &FreqChange) + Send + Sync;
pub type PolicyCallback = dyn Fn(PolicyNotice, &mut PolicyData) + Send + Sync;

/// Handle returned by [`NotifierChain::register`]; pass it back to
/// [`NotifierChain::unregister`] to drop the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierToken(u64);

pub struct NotifierChain<C: ?Sized> {
    blocking: bool,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Arc<C>)>>,
}

impl<C: ?Sized> NotifierChain<C> {
    pub(crate) fn new(blocking: bool) -> Self {
        Self {
            blocking,
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Whether subscribers on this chain are allowed to suspend.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn register(&self, callback: Arc<C>) -> NotifierToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, callback));
        NotifierToken(id)
    }

    pub fn unregister(&self, token: NotifierToken) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(id, _)| *id != token.0);
        subs.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Clones the current subscriber list so the fan-out loop runs
    /// without the chain lock held.
    pub(crate) fn snapshot(&self) -> Vec<Arc<C>> {
        self.subscribers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn register_and_fan_out() {
        let chain: NotifierChain<TransitionCallback> = NotifierChain::new(false);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        chain.register(Arc::new(move |_phase, _freqs: &FreqChange| {
            hits2.fetch_add(1, Ordering::Relaxed);
        }));

        let freqs = FreqChange::new(0, 1_000_000, 1_200_000);
        for cb in chain.snapshot() {
            (cb.as_ref())(TransitionPhase::PreChange, &freqs);
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let chain: NotifierChain<TransitionCallback> = NotifierChain::new(false);
        let token = chain.register(Arc::new(|_, _: &FreqChange| {}));
        assert_eq!(chain.len(), 1);
        assert!(chain.unregister(token));
        assert!(!chain.unregister(token));
        assert!(chain.is_empty());
    }
}
