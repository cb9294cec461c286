//! End-to-end tests: client library against an in-process broker.

use std::cell::Cell;
use std::rc::Rc;

use herald_broker::testing::TestBroker;
use herald_client::{Client, PublisherOptions, ReadMode, SubscriberOptions};

fn fill_and_publish(publisher: &mut herald_client::Publisher, payload: &[u8]) -> i64 {
    let buffer = publisher
        .message_buffer()
        .expect("message_buffer")
        .expect("expected a slot");
    buffer[..payload.len()].copy_from_slice(payload);
    publisher.publish(payload.len()).expect("publish").ordinal
}

#[test]
fn reliable_pair_delivers_everything_in_order() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "scenario-a").unwrap();

    let mut publisher = client
        .create_publisher("/a", 64, 4, PublisherOptions::default().reliable(true))
        .unwrap();
    let mut subscriber = client
        .create_subscriber("/a", SubscriberOptions::default().reliable(true))
        .unwrap();

    let drops = Rc::new(Cell::new(0i64));
    let drops_seen = drops.clone();
    subscriber.on_dropped_messages(move |n| drops_seen.set(drops_seen.get() + n));

    let mut received: Vec<(i64, Vec<u8>)> = Vec::new();
    for i in 1..=100u32 {
        let payload = format!("m{i}");
        loop {
            match publisher.message_buffer().unwrap() {
                Some(buffer) => {
                    buffer[..payload.len()].copy_from_slice(payload.as_bytes());
                    publisher.publish(payload.len()).unwrap();
                    break;
                }
                // Backpressure: the subscriber is pinning the oldest slot.
                None => {
                    if let Some(message) = subscriber.read_message(ReadMode::Next).unwrap() {
                        received.push((message.ordinal, message.data.to_vec()));
                    }
                }
            }
        }
        if let Some(message) = subscriber.read_message(ReadMode::Next).unwrap() {
            received.push((message.ordinal, message.data.to_vec()));
        }
    }
    while received.len() < 100 {
        if let Some(message) = subscriber.read_message(ReadMode::Next).unwrap() {
            received.push((message.ordinal, message.data.to_vec()));
        }
    }

    // The activation message took ordinal 0 and was suppressed.
    for (i, (ordinal, payload)) in received.iter().enumerate() {
        assert_eq!(*ordinal, i as i64 + 1);
        assert_eq!(payload, format!("m{}", i + 1).as_bytes());
    }
    assert_eq!(drops.get(), 0, "reliable pair must not drop");
}

#[test]
fn unreliable_pair_accounts_for_every_message() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "scenario-b").unwrap();

    let mut publisher = client
        .create_publisher("/b", 32, 2, PublisherOptions::default())
        .unwrap();
    let mut subscriber = client
        .create_subscriber("/b", SubscriberOptions::default())
        .unwrap();

    let drops = Rc::new(Cell::new(0i64));
    let drops_seen = drops.clone();
    subscriber.on_dropped_messages(move |n| {
        assert!(n > 0);
        drops_seen.set(drops_seen.get() + n);
    });

    let mut received = 0i64;
    let mut last_ordinal = -1i64;
    for i in 1..=1000u32 {
        let payload = format!("{i}");
        fill_and_publish(&mut publisher, payload.as_bytes());
        // Read one of every ten published.
        if i % 10 == 0
            && let Some(message) = subscriber.read_message(ReadMode::Next).unwrap()
        {
            assert!(message.ordinal > last_ordinal, "ordinals must increase");
            last_ordinal = message.ordinal;
            received += 1;
        }
    }
    // Drain whatever is still readable.
    while let Some(message) = subscriber.read_message(ReadMode::Next).unwrap() {
        assert!(message.ordinal > last_ordinal);
        last_ordinal = message.ordinal;
        received += 1;
    }

    assert_eq!(
        received + drops.get(),
        1000,
        "every message is either received or reported dropped"
    );
}

#[test]
fn placeholder_subscribers_materialize_and_share_a_slot() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "scenario-c").unwrap();

    // Two reliable subscribers before any publisher exists.
    let mut sub1 = client
        .create_subscriber("/c", SubscriberOptions::default().reliable(true))
        .unwrap();
    let mut sub2 = client
        .create_subscriber("/c", SubscriberOptions::default().reliable(true))
        .unwrap();
    assert!(sub1.is_placeholder());
    assert!(sub2.is_placeholder());

    // Still readable while placeholder: just empty.
    assert!(sub1.read_message(ReadMode::Next).unwrap().is_none());

    let mut publisher = client
        .create_publisher("/c", 64, 4, PublisherOptions::default().reliable(true))
        .unwrap();
    let ordinal = fill_and_publish(&mut publisher, b"materialized");

    for sub in [&mut sub1, &mut sub2] {
        sub.wait().unwrap();
        let message = sub.read_message(ReadMode::Next).unwrap().expect("message");
        assert_eq!(message.data, b"materialized");
        assert_eq!(message.ordinal, ordinal);
        assert!(!sub.is_placeholder());
    }

    // Both subscribers hold the same slot now.
    assert_eq!(sub1.current_slot_ref_count(), Some(2));
    assert_eq!(sub2.current_slot_ref_count(), Some(2));
}

#[test]
fn reliable_publisher_with_no_subscribers_gets_no_buffer() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "scenario-d").unwrap();

    let mut publisher = client
        .create_publisher("/d", 64, 4, PublisherOptions::default().reliable(true))
        .unwrap();

    // No subscriber anchors reliability yet: backpressure, not an error.
    assert!(publisher.message_buffer().unwrap().is_none());
    assert!(publisher.message_buffer().unwrap().is_none());

    let mut subscriber = client
        .create_subscriber("/d", SubscriberOptions::default().reliable(true))
        .unwrap();

    // The failed attempts consumed no ordinals: activation was 0, so the
    // first real message is 1.
    let ordinal = fill_and_publish(&mut publisher, b"now");
    assert_eq!(ordinal, 1);

    subscriber.wait().unwrap();
    let message = subscriber
        .read_message(ReadMode::Next)
        .unwrap()
        .expect("message");
    assert_eq!(message.data, b"now");
}

#[test]
fn find_message_by_timestamp_is_exact() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "scenario-e").unwrap();

    let mut publisher = client
        .create_publisher("/e", 32, 16, PublisherOptions::default())
        .unwrap();
    let mut subscriber = client
        .create_subscriber("/e", SubscriberOptions::default())
        .unwrap();

    let mut stamps = Vec::new();
    for i in 1..=10u32 {
        let payload = format!("m{i}");
        let buffer = publisher.message_buffer().unwrap().unwrap();
        buffer[..payload.len()].copy_from_slice(payload.as_bytes());
        let info = publisher.publish(payload.len()).unwrap();
        stamps.push(info.timestamp);
    }

    let message = subscriber
        .find_message(stamps[4])
        .unwrap()
        .expect("exact timestamp must hit");
    assert_eq!(message.data, b"m5");
    assert_eq!(message.timestamp, stamps[4]);

    // Nearby is not equal: miss, and the held message is untouched.
    assert!(subscriber.find_message(stamps[4] + 1).unwrap().is_none());
    assert_eq!(subscriber.current_ordinal(), Some(4));
}

#[test]
fn payloads_roundtrip_byte_identical() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "roundtrip").unwrap();

    let mut publisher = client
        .create_publisher("/bytes", 300, 8, PublisherOptions::default())
        .unwrap();
    let mut subscriber = client
        .create_subscriber("/bytes", SubscriberOptions::default())
        .unwrap();

    for len in [0usize, 1, 31, 32, 33, 255, 300] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let buffer = publisher.message_buffer().unwrap().unwrap();
        buffer[..len].copy_from_slice(&payload);
        publisher.publish(len).unwrap();

        let message = subscriber
            .read_message(ReadMode::Next)
            .unwrap()
            .expect("message");
        assert_eq!(message.data, &payload[..], "length {len}");
    }
}

#[test]
fn late_subscriber_matches_placeholder_subscriber() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "parity").unwrap();

    let mut before = client
        .create_subscriber("/parity", SubscriberOptions::default().reliable(true))
        .unwrap();
    let mut publisher = client
        .create_publisher("/parity", 64, 4, PublisherOptions::default().reliable(true))
        .unwrap();
    let mut after = client
        .create_subscriber("/parity", SubscriberOptions::default().reliable(true))
        .unwrap();

    let ordinal = fill_and_publish(&mut publisher, b"same for everyone");

    for sub in [&mut before, &mut after] {
        let message = sub.read_message(ReadMode::Next).unwrap().expect("message");
        assert_eq!(message.ordinal, ordinal);
        assert_eq!(message.data, b"same for everyone");
    }
}

#[test]
fn newest_mode_skips_to_the_tail() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "newest").unwrap();

    let mut publisher = client
        .create_publisher("/newest", 32, 8, PublisherOptions::default())
        .unwrap();
    let mut subscriber = client
        .create_subscriber("/newest", SubscriberOptions::default())
        .unwrap();

    for i in 1..=5u32 {
        fill_and_publish(&mut publisher, format!("m{i}").as_bytes());
    }

    let message = subscriber
        .read_message(ReadMode::Newest)
        .unwrap()
        .expect("message");
    assert_eq!(message.data, b"m5");

    // Nothing newer yet.
    assert!(subscriber.read_message(ReadMode::Newest).unwrap().is_none());

    fill_and_publish(&mut publisher, b"m6");
    let message = subscriber
        .read_message(ReadMode::Newest)
        .unwrap()
        .expect("message");
    assert_eq!(message.data, b"m6");
}

#[test]
fn broker_refusals_keep_the_connection_usable() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "refusals").unwrap();

    let _publisher = client
        .create_publisher(
            "/typed",
            64,
            4,
            PublisherOptions::default().type_tag("geo.Fix"),
        )
        .unwrap();

    // Wrong type tag: refused verbatim, connection stays up.
    let err = client
        .create_publisher(
            "/typed",
            64,
            4,
            PublisherOptions::default().type_tag("imu.Sample"),
        )
        .unwrap_err();
    assert!(matches!(err, herald_client::ClientError::Refused(_)));

    // Wrong geometry: refused too.
    let err = client
        .create_publisher("/typed", 128, 4, PublisherOptions::default())
        .unwrap_err();
    assert!(matches!(err, herald_client::ClientError::Refused(_)));

    // And the connection still works.
    let _subscriber = client
        .create_subscriber("/typed", SubscriberOptions::default())
        .unwrap();
}

#[test]
fn publisher_removal_wakes_nobody_up_wrongly() {
    let broker = TestBroker::spawn();
    let client = Client::init(broker.socket_path(), "teardown").unwrap();

    let mut publisher = client
        .create_publisher("/gone", 32, 4, PublisherOptions::default())
        .unwrap();
    let mut subscriber = client
        .create_subscriber("/gone", SubscriberOptions::default())
        .unwrap();

    fill_and_publish(&mut publisher, b"last words");
    publisher.remove().unwrap();

    // The already-published message is still readable from shared memory.
    let message = subscriber
        .read_message(ReadMode::Next)
        .unwrap()
        .expect("message");
    assert_eq!(message.data, b"last words");

    // Recreating the channel after everyone leaves starts fresh.
    drop(subscriber);
    let mut publisher = client
        .create_publisher("/gone", 32, 4, PublisherOptions::default())
        .unwrap();
    let ordinal = fill_and_publish(&mut publisher, b"reborn");
    assert_eq!(ordinal, 0);
}
