//! Raw control-plane tests, speaking frames and `SCM_RIGHTS` directly.

use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixStream;

use herald_broker::testing::TestBroker;
use herald_wire::framing::{decode_response, encode_request, read_frame, write_frame};
use herald_wire::{
    CreatePublisherRequest, CreateSubscriberRequest, GetTriggersRequest, InitRequest, Request,
    Response,
};

fn request(stream: &UnixStream, req: &Request) -> (Response, Vec<OwnedFd>) {
    let body = encode_request(req).expect("encode");
    write_frame(&mut &*stream, &body).expect("write frame");
    let frame = read_frame(&mut &*stream).expect("read frame");
    let response = decode_response(&frame).expect("decode");
    let fds = herald_fdpass::recv_fds(stream, response.num_fds()).expect("recv fds");
    (response, fds)
}

fn connect(broker: &TestBroker) -> UnixStream {
    let stream = UnixStream::connect(broker.socket_path()).expect("connect");
    let (response, fds) = request(
        &stream,
        &Request::Init(InitRequest {
            client_name: "raw".into(),
        }),
    );
    assert!(response.error().is_empty());
    assert_eq!(fds.len(), 1);
    stream
}

/// Identify the kernel object behind a descriptor. Duplicates of the same
/// socket share an inode.
fn identity(fd: &OwnedFd) -> (u64, u64) {
    let file = std::fs::File::from(fd.try_clone().expect("clone fd"));
    let meta = file.metadata().expect("fstat");
    (meta.dev(), meta.ino())
}

#[test]
fn get_triggers_is_idempotent() {
    let broker = TestBroker::spawn();
    let stream = connect(&broker);

    let (response, _fds) = request(
        &stream,
        &Request::CreatePublisher(CreatePublisherRequest {
            channel_name: "/raw".into(),
            slot_size: 64,
            num_slots: 4,
            is_public: false,
            is_reliable: true,
            is_bridge: false,
            type_tag: String::new(),
        }),
    );
    assert!(response.error().is_empty());

    for _ in 0..2 {
        let (response, fds) = request(
            &stream,
            &Request::CreateSubscriber(CreateSubscriberRequest {
                channel_name: "/raw".into(),
                subscriber_id: -1,
                is_reliable: false,
                is_bridge: false,
                type_tag: String::new(),
            }),
        );
        assert!(response.error().is_empty());
        drop(fds);
    }

    let fetch = || {
        let (response, fds) = request(
            &stream,
            &Request::GetTriggers(GetTriggersRequest {
                channel_name: "/raw".into(),
            }),
        );
        let resp = match response {
            Response::GetTriggers(resp) => resp,
            other => panic!("unexpected response {other:?}"),
        };
        assert!(resp.error.is_empty());
        let subs: Vec<_> = resp
            .sub_trigger_fd_indexes
            .iter()
            .map(|&i| identity(&fds[i as usize]))
            .collect();
        let pubs: Vec<_> = resp
            .reliable_pub_trigger_fd_indexes
            .iter()
            .map(|&i| identity(&fds[i as usize]))
            .collect();
        (subs, pubs)
    };

    // With no roster change in between, repeated calls name the same
    // underlying trigger objects.
    let first = fetch();
    let second = fetch();
    assert_eq!(first, second);
    assert_eq!(first.0.len(), 2);
    assert_eq!(first.1.len(), 1);
}

#[test]
fn unknown_channel_is_refused_with_no_fds() {
    let broker = TestBroker::spawn();
    let stream = connect(&broker);

    let (response, fds) = request(
        &stream,
        &Request::GetTriggers(GetTriggersRequest {
            channel_name: "/nonexistent".into(),
        }),
    );
    assert!(!response.error().is_empty());
    assert!(fds.is_empty());
}

#[test]
fn disconnect_cleans_up_participants() {
    let broker = TestBroker::spawn();

    let stream = connect(&broker);
    let (response, _fds) = request(
        &stream,
        &Request::CreatePublisher(CreatePublisherRequest {
            channel_name: "/ephemeral".into(),
            slot_size: 32,
            num_slots: 4,
            is_public: false,
            is_reliable: false,
            is_bridge: false,
            type_tag: String::new(),
        }),
    );
    assert!(response.error().is_empty());

    // Dropping the connection removes the publisher and, it being the last
    // participant, the channel itself.
    drop(stream);

    // Poll until the broker's handler has observed the hangup.
    let stream = connect(&broker);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let (response, fds) = request(
            &stream,
            &Request::GetTriggers(GetTriggersRequest {
                channel_name: "/ephemeral".into(),
            }),
        );
        drop(fds);
        if !response.error().is_empty() {
            break; // channel reclaimed
        }
        assert!(
            std::time::Instant::now() < deadline,
            "channel was never reclaimed after disconnect"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}
