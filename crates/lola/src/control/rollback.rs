// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rollback executor: erases a crashed subscriber's slot references.
//!
//! Runs at proxy creation (for the proxy's own previous incarnation) and
//! at skeleton re-open (for the skeleton tracing log). The executor walks
//! every event control of the service and rolls back the transaction logs
//! registered under the given id. It is non-reentrant by protocol: the
//! driver holds the usage marker flock (proxy, shared) or the existence
//! marker flock (skeleton, exclusive) while it runs.

use crate::control::transaction_log::TransactionLogId;
use crate::error::Result;
use crate::shm::service_data::ServiceDataControl;

/// Rolls back all transaction logs of one subscriber across a service
pub struct TransactionLogRollbackExecutor<'a> {
    service_control: &'a ServiceDataControl,
    transaction_log_id: TransactionLogId,
}

impl<'a> TransactionLogRollbackExecutor<'a> {
    /// Executor for one subscriber id over one control segment
    #[must_use]
    pub fn new(
        service_control: &'a ServiceDataControl,
        transaction_log_id: TransactionLogId,
    ) -> Self {
        Self {
            service_control,
            transaction_log_id,
        }
    }

    /// Roll back every event's logs for the subscriber.
    ///
    /// After this returns, the subscriber contributes zero to every slot's
    /// ref-count and all its log nodes are released, regardless of where
    /// in a transaction the previous incarnation died.
    pub fn rollback_transaction_logs(&self) -> Result<()> {
        for fq_id in self.service_control.element_ids() {
            let Some(control) = self.service_control.event_control(&fq_id) else {
                // The id came from the same map a moment ago; entries are
                // never removed, so this cannot happen.
                continue;
            };
            log::debug!(
                "[CTL] rolling back transaction logs of subscriber {} for element {fq_id}",
                self.transaction_log_id
            );
            control.rollback_subscriber(self.transaction_log_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::event_control::SkeletonEventProperties;
    use crate::shm::arena::Arena;
    use crate::types::{ElementFqId, ElementType};
    use std::sync::Arc;

    fn props(slots: u16) -> SkeletonEventProperties {
        SkeletonEventProperties {
            number_of_slots: slots,
            max_subscribers: 2,
            enforce_max_samples: false,
        }
    }

    #[test]
    fn test_rollback_covers_every_event_of_the_service() {
        let arena = Arc::new(Arena::create_on_heap(512 * 1024).expect("arena"));
        let root = ServiceDataControl::create(arena, 4, 8).expect("root");
        let fq_a = ElementFqId::new(1, 1, 1, ElementType::Event);
        let fq_b = ElementFqId::new(1, 2, 1, ElementType::Event);
        let ctl_a = root.insert_event_control(fq_a, &props(3)).unwrap();
        let ctl_b = root.insert_event_control(fq_b, &props(3)).unwrap();

        // Subscriber 42 holds refs on both events, then crashes.
        for ctl in [&ctl_a, &ctl_b] {
            let log = ctl.register_subscriber(42, 8).unwrap();
            let slot = ctl.allocate_next_slot().unwrap();
            ctl.event_ready(slot, 1);
            ctl.reference_next_event(0, log, u32::MAX).unwrap();
        }
        assert_eq!(ctl_a.slot_status(0).ref_count(), 1);
        assert_eq!(ctl_b.slot_status(0).ref_count(), 1);

        TransactionLogRollbackExecutor::new(&root, 42)
            .rollback_transaction_logs()
            .expect("rollback");

        assert_eq!(ctl_a.slot_status(0).ref_count(), 0);
        assert_eq!(ctl_b.slot_status(0).ref_count(), 0);
        // The subscriber can register again on both events.
        assert!(ctl_a.register_subscriber(42, 8).is_ok());
        assert!(ctl_b.register_subscriber(42, 8).is_ok());
    }

    #[test]
    fn test_rollback_leaves_other_subscribers_untouched() {
        let arena = Arc::new(Arena::create_on_heap(512 * 1024).expect("arena"));
        let root = ServiceDataControl::create(arena, 2, 8).expect("root");
        let fq = ElementFqId::new(1, 1, 1, ElementType::Event);
        let ctl = root.insert_event_control(fq, &props(3)).unwrap();

        let crashed = ctl.register_subscriber(42, 8).unwrap();
        let healthy = ctl.register_subscriber(43, 8).unwrap();
        let slot = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(slot, 1);
        ctl.reference_next_event(0, crashed, u32::MAX).unwrap();
        ctl.reference_next_event(0, healthy, u32::MAX).unwrap();
        assert_eq!(ctl.slot_status(slot).ref_count(), 2);

        TransactionLogRollbackExecutor::new(&root, 42)
            .rollback_transaction_logs()
            .expect("rollback");

        // Only the crashed subscriber's contribution is gone.
        assert_eq!(ctl.slot_status(slot).ref_count(), 1);
        assert_eq!(ctl.log_outstanding(healthy), 1);
    }
}
