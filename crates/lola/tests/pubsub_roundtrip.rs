// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end publish/subscribe over real shared memory, marker files and
//! flag-file discovery, skeleton and proxy living in one process.

mod common;

use common::{setup, setup_with_quota, EVENT_NAME, INSTANCE_SPECIFIER};
use lola::{
    ElementSpec, EnrichedInstanceIdentifier, Proxy, QualityType, Skeleton,
};

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
struct RadarPosition {
    x: f64,
    y: f64,
    counter: u32,
}

#[test]
fn test_single_slot_allocate_publish_read() {
    let setup = setup(QualityType::AsilQm, 5);

    let mut skeleton = Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).expect("skeleton");
    skeleton
        .prepare_offer(&[ElementSpec::event::<RadarPosition>(EVENT_NAME)])
        .expect("prepare offer");
    let publisher = skeleton
        .register_event::<RadarPosition>(EVENT_NAME)
        .expect("register");
    skeleton.finalize_offer().expect("finalize offer");

    // Discovery sees the offer.
    let found = setup
        .runtime
        .discovery()
        .find_service(EnrichedInstanceIdentifier::any_instance(
            setup.service_id,
            QualityType::AsilQm,
        ))
        .expect("find");
    assert_eq!(found.len(), 1);

    // Publish one sample into slot 0 with timestamp 1.
    let mut writer = publisher.allocate().expect("allocate");
    assert_eq!(writer.slot(), 0);
    writer.write(RadarPosition {
        x: 1.5,
        y: -2.5,
        counter: 7,
    });
    let timestamp = writer.send();
    assert_eq!(timestamp, 1);
    assert_eq!(publisher.latest_timestamp(), 1);

    // Proxy connects, subscribes and reads the payload zero-copy.
    let proxy = Proxy::create(&setup.runtime, &found[0]).expect("proxy");
    assert!(proxy.is_service_available());
    let mut event = proxy.event::<RadarPosition>(EVENT_NAME).expect("event");
    event.subscribe().expect("subscribe");

    assert_eq!(event.num_new_samples_available(0).expect("count"), 1);
    let sample = event.receive_next(0).expect("receive").expect("sample");
    assert_eq!(sample.timestamp(), 1);
    assert_eq!(sample.slot(), 0);
    assert_eq!(
        *sample,
        RadarPosition {
            x: 1.5,
            y: -2.5,
            counter: 7
        }
    );
    assert_eq!(event.control().slot_status(0).ref_count(), 1);

    drop(sample);
    assert_eq!(event.control().slot_status(0).ref_count(), 0);
    assert_eq!(event.control().slot_status(0).time_stamp(), 1);

    drop(event);
    drop(proxy);
    skeleton.prepare_stop_offer();
}

#[test]
fn test_publisher_timestamps_are_strictly_increasing() {
    let setup = setup(QualityType::AsilQm, 5);
    let mut skeleton = Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).expect("skeleton");
    skeleton
        .prepare_offer(&[ElementSpec::event::<u64>(EVENT_NAME)])
        .expect("prepare offer");
    let publisher = skeleton.register_event::<u64>(EVENT_NAME).expect("register");

    let mut previous = 0;
    for value in 0..20u64 {
        let timestamp = publisher.send_value(value).expect("send");
        assert!(timestamp > previous, "timestamps must be strictly increasing");
        previous = timestamp;
    }

    drop(publisher);
    skeleton.prepare_stop_offer();
}

#[test]
fn test_consumer_sees_samples_in_publication_order() {
    let setup = setup(QualityType::AsilQm, 4);
    let mut skeleton = Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).expect("skeleton");
    skeleton
        .prepare_offer(&[ElementSpec::event::<u64>(EVENT_NAME)])
        .expect("prepare offer");
    let publisher = skeleton.register_event::<u64>(EVENT_NAME).expect("register");
    skeleton.finalize_offer().expect("finalize offer");

    for value in [100u64, 200, 300] {
        publisher.send_value(value).expect("send");
    }

    let proxy = Proxy::create(&setup.runtime, &setup.handle(QualityType::AsilQm)).expect("proxy");
    let mut event = proxy.event::<u64>(EVENT_NAME).expect("event");
    event.subscribe().expect("subscribe");

    let mut seen = Vec::new();
    let mut cursor = 0;
    while let Some(sample) = event.receive_next(cursor).expect("receive") {
        cursor = sample.timestamp();
        seen.push(*sample);
    }
    assert_eq!(seen, vec![100, 200, 300]);

    drop(event);
    drop(proxy);
    skeleton.prepare_stop_offer();
}

#[test]
fn test_quota_limits_concurrently_held_samples() {
    let setup = setup_with_quota(QualityType::AsilQm, 5, 2, true);
    let mut skeleton = Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).expect("skeleton");
    skeleton
        .prepare_offer(&[ElementSpec::event::<u64>(EVENT_NAME)])
        .expect("prepare offer");
    let publisher = skeleton.register_event::<u64>(EVENT_NAME).expect("register");
    skeleton.finalize_offer().expect("finalize offer");

    for value in 0..4u64 {
        publisher.send_value(value).expect("send");
    }

    let proxy = Proxy::create(&setup.runtime, &setup.handle(QualityType::AsilQm)).expect("proxy");
    let mut event = proxy.event::<u64>(EVENT_NAME).expect("event");
    event.subscribe().expect("subscribe");

    let first = event.receive_next(0).expect("receive").expect("first");
    let second = event
        .receive_next(first.timestamp())
        .expect("receive")
        .expect("second");
    // Quota of two: the third reference is denied while both are held.
    assert!(event
        .receive_next(second.timestamp())
        .expect("receive")
        .is_none());

    drop(first);
    let third = event
        .receive_next(second.timestamp())
        .expect("receive")
        .expect("third after release");
    drop(third);
    drop(second);

    drop(event);
    drop(proxy);
    skeleton.prepare_stop_offer();
}

#[test]
fn test_operations_require_subscription() {
    let setup = setup(QualityType::AsilQm, 3);
    let mut skeleton = Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).expect("skeleton");
    skeleton
        .prepare_offer(&[ElementSpec::event::<u64>(EVENT_NAME)])
        .expect("prepare offer");
    let publisher = skeleton.register_event::<u64>(EVENT_NAME).expect("register");
    skeleton.finalize_offer().expect("finalize offer");
    publisher.send_value(1).expect("send");

    let proxy = Proxy::create(&setup.runtime, &setup.handle(QualityType::AsilQm)).expect("proxy");
    let mut event = proxy.event::<u64>(EVENT_NAME).expect("event");

    assert!(matches!(
        event.num_new_samples_available(0),
        Err(lola::ComError::NotSubscribed)
    ));
    assert!(matches!(
        event.receive_next(0),
        Err(lola::ComError::NotSubscribed)
    ));

    event.subscribe().expect("subscribe");
    assert_eq!(event.num_new_samples_available(0).expect("count"), 1);

    event.unsubscribe();
    assert!(matches!(
        event.num_new_samples_available(0),
        Err(lola::ComError::NotSubscribed)
    ));

    drop(event);
    drop(proxy);
    skeleton.prepare_stop_offer();
}

#[test]
fn test_fields_require_initial_value() {
    let setup = setup(QualityType::AsilQm, 3);
    // Reuse the single configured element as a field for this test.
    let mut config = setup.config.clone();
    let service = &mut config.services[0];
    let element = service.service.events.remove(EVENT_NAME).unwrap();
    service.service.fields.insert(EVENT_NAME.to_string(), element);
    let runtime = lola::Runtime::new(config).expect("runtime");

    let mut skeleton = Skeleton::create(&runtime, INSTANCE_SPECIFIER).expect("skeleton");
    skeleton
        .prepare_offer(&[ElementSpec::field::<u64>(EVENT_NAME)])
        .expect("prepare offer");

    assert!(matches!(
        skeleton.register_field::<u64>(EVENT_NAME, None),
        Err(lola::ComError::FieldValueIsNotValid)
    ));
    let publisher = skeleton
        .register_field::<u64>(EVENT_NAME, Some(42))
        .expect("register with initial value");
    assert_eq!(publisher.latest_timestamp(), 1);

    drop(publisher);
    skeleton.prepare_stop_offer();
}

#[test]
fn test_dual_quality_instance_serves_both_consumer_groups() {
    let setup = setup(QualityType::AsilB, 4);
    let mut skeleton = Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).expect("skeleton");
    skeleton
        .prepare_offer(&[ElementSpec::event::<u64>(EVENT_NAME)])
        .expect("prepare offer");
    let publisher = skeleton.register_event::<u64>(EVENT_NAME).expect("register");
    assert!(publisher.composite().asil_b_control().is_some());
    skeleton.finalize_offer().expect("finalize offer");
    publisher.send_value(5).expect("publish");

    // An ASIL-B offer is discoverable under both qualities.
    for quality in [QualityType::AsilB, QualityType::AsilQm] {
        let found = setup
            .runtime
            .discovery()
            .find_service(EnrichedInstanceIdentifier::any_instance(
                setup.service_id,
                quality,
            ))
            .expect("find");
        assert_eq!(found.len(), 1, "missing offer for {quality:?}");
    }

    // Each consumer group reads through its own control segment.
    let proxy_b = Proxy::create(&setup.runtime, &setup.handle(QualityType::AsilB)).expect("B proxy");
    let mut event_b = proxy_b.event::<u64>(EVENT_NAME).expect("B event");
    event_b.subscribe().expect("B subscribe");
    let sample_b = event_b.receive_next(0).expect("receive").expect("B sample");
    assert_eq!(*sample_b, 5);

    let proxy_qm =
        Proxy::create(&setup.runtime, &setup.handle(QualityType::AsilQm)).expect("QM proxy");
    let mut event_qm = proxy_qm.event::<u64>(EVENT_NAME).expect("QM event");
    event_qm.subscribe().expect("QM subscribe");
    let sample_qm = event_qm.receive_next(0).expect("receive").expect("QM sample");
    assert_eq!(*sample_qm, 5);

    // Disconnecting QM consumers withdraws only the QM flag file.
    skeleton.disconnect_qm_consumers();
    let found_qm = setup
        .runtime
        .discovery()
        .find_service(EnrichedInstanceIdentifier::any_instance(
            setup.service_id,
            QualityType::AsilQm,
        ))
        .expect("find");
    assert!(found_qm.is_empty());
    let found_b = setup
        .runtime
        .discovery()
        .find_service(EnrichedInstanceIdentifier::any_instance(
            setup.service_id,
            QualityType::AsilB,
        ))
        .expect("find");
    assert_eq!(found_b.len(), 1);

    drop(sample_b);
    drop(sample_qm);
    drop(event_b);
    drop(event_qm);
    drop(proxy_b);
    drop(proxy_qm);
    skeleton.prepare_stop_offer();
}

#[test]
fn test_second_skeleton_for_same_instance_is_rejected() {
    let setup = setup(QualityType::AsilQm, 3);
    let _first = Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).expect("first skeleton");
    assert!(
        Skeleton::create(&setup.runtime, INSTANCE_SPECIFIER).is_err(),
        "existence marker must exclude a second live skeleton"
    );
}
