//! One coroutine per client connection.
//!
//! Each connection reads requests sequentially, mutates the registry
//! synchronously (no await point holds a borrow), and writes back the
//! response frame followed by its descriptors. A connection that drops —
//! cleanly or not — takes every participant it created with it.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

use herald_shm::channel::Channel;
use herald_shm::trigger::TriggerPair;
use herald_wire::framing::{decode_request, encode_response, read_frame_async, write_frame_async};
use herald_wire::{
    CreatePublisherRequest, CreatePublisherResponse, CreateSubscriberRequest,
    CreateSubscriberResponse, GetTriggersRequest, GetTriggersResponse, InitResponse,
    RemovePublisherResponse, RemoveSubscriberResponse, Request, Response,
};

use crate::registry::{PublisherRec, Registry, SubscriberRec};

/// Serve one client connection to completion.
pub async fn serve(mut stream: tokio::net::UnixStream, registry: Rc<RefCell<Registry>>, session: u64) {
    let mut client_name = String::new();

    loop {
        let body = match read_frame_async(&mut stream).await {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(session, client = %client_name, error = %err, "connection closed");
                break;
            }
        };
        let request = match decode_request(&body) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(session, client = %client_name, error = %err, "bad request frame");
                break;
            }
        };

        let (response, fds) = {
            let mut registry = registry.borrow_mut();
            handle_request(&mut registry, session, &mut client_name, request)
        };

        let body = match encode_response(&response) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(session, error = %err, "response encode failed");
                break;
            }
        };
        if let Err(err) = write_frame_async(&mut stream, &body).await {
            tracing::debug!(session, error = %err, "response write failed");
            break;
        }
        debug_assert_eq!(fds.len(), response.num_fds());
        let mut fd_error = false;
        for fd in &fds {
            if let Err(err) = herald_fdpass::send_fd_async(&stream, fd.as_raw_fd()).await {
                tracing::debug!(session, error = %err, "fd send failed");
                fd_error = true;
                break;
            }
        }
        if fd_error {
            break;
        }
    }

    registry.borrow_mut().drop_session(session);
}

fn handle_request(
    registry: &mut Registry,
    session: u64,
    client_name: &mut String,
    request: Request,
) -> (Response, Vec<OwnedFd>) {
    match request {
        Request::Init(req) => {
            *client_name = req.client_name;
            tracing::info!(session, client = %client_name, "client initialized");
            match dup(registry.scb.fd()) {
                Ok(fd) => (
                    Response::Init(InitResponse {
                        error: String::new(),
                        scb_fd_index: 0,
                    }),
                    vec![fd],
                ),
                Err(error) => (Response::Init(InitResponse { error, ..Default::default() }), vec![]),
            }
        }
        Request::CreatePublisher(req) => {
            let name = req.channel_name.clone();
            match create_publisher(registry, session, req) {
                Ok((resp, fds)) => (Response::CreatePublisher(resp), fds),
                Err(error) => {
                    registry.reclaim_if_empty(&name);
                    (
                        Response::CreatePublisher(CreatePublisherResponse {
                            error,
                            ..Default::default()
                        }),
                        vec![],
                    )
                }
            }
        }
        Request::CreateSubscriber(req) => {
            let name = req.channel_name.clone();
            match create_subscriber(registry, session, req) {
                Ok((resp, fds)) => (Response::CreateSubscriber(resp), fds),
                Err(error) => {
                    registry.reclaim_if_empty(&name);
                    (
                        Response::CreateSubscriber(CreateSubscriberResponse {
                            error,
                            ..Default::default()
                        }),
                        vec![],
                    )
                }
            }
        }
        Request::GetTriggers(req) => match get_triggers(registry, req) {
            Ok((resp, fds)) => (Response::GetTriggers(resp), fds),
            Err(error) => (
                Response::GetTriggers(GetTriggersResponse {
                    error,
                    ..Default::default()
                }),
                vec![],
            ),
        },
        Request::RemovePublisher(req) => {
            let error = registry
                .drop_publisher(&req.channel_name, req.publisher_id)
                .err()
                .unwrap_or_default();
            (Response::RemovePublisher(RemovePublisherResponse { error }), vec![])
        }
        Request::RemoveSubscriber(req) => {
            let error = registry
                .drop_subscriber(&req.channel_name, req.subscriber_id)
                .err()
                .unwrap_or_default();
            (Response::RemoveSubscriber(RemoveSubscriberResponse { error }), vec![])
        }
    }
}

fn create_publisher(
    registry: &mut Registry,
    session: u64,
    req: CreatePublisherRequest,
) -> Result<(CreatePublisherResponse, Vec<OwnedFd>), String> {
    if req.slot_size <= 0 || req.num_slots <= 0 {
        return Err("slot_size and num_slots must be positive".to_string());
    }

    let ch = registry.channel_or_create(&req.channel_name, &req.type_tag)?;
    ch.check_type(&req.type_tag)?;

    match &ch.channel {
        Some(existing) => {
            // The first publisher's sizing wins; later publishers must agree.
            if existing.slot_size() != req.slot_size || existing.num_slots() != req.num_slots {
                return Err(format!(
                    "channel {} is sized {}x{}, not {}x{}",
                    req.channel_name,
                    existing.num_slots(),
                    existing.slot_size(),
                    req.num_slots,
                    req.slot_size
                ));
            }
        }
        None => {
            // First publisher: materialize the shared memory, including for
            // any placeholder subscribers that beat it here.
            let channel = Channel::allocate(&req.channel_name, req.slot_size, req.num_slots)
                .map_err(|e| e.to_string())?;
            ch.slot_size = req.slot_size;
            ch.num_slots = req.num_slots;
            ch.channel = Some(channel);
        }
    }

    let trigger = TriggerPair::new().map_err(|err| format!("trigger allocation failed: {err}"))?;

    let mut fds = Vec::with_capacity(4 + ch.subscribers.len());
    let mut sub_trigger_fd_indexes = Vec::with_capacity(ch.subscribers.len());
    {
        let channel = ch.channel.as_ref().expect("sized above");
        fds.push(dup(channel.ccb_fd())?);
        fds.push(dup(channel.buffers_fd())?);
    }
    fds.push(dup(trigger.signal_fd())?);
    fds.push(dup(trigger.wait_fd())?);
    for sub in &ch.subscribers {
        fds.push(dup(sub.trigger.signal_fd())?);
        sub_trigger_fd_indexes.push(fds.len() as u32 - 1);
    }

    let publisher_id = ch
        .owners
        .allocate()
        .ok_or_else(|| format!("channel {} participant ids exhausted", req.channel_name))?;

    // Nothing below fails; commit.
    let type_tag = ch.negotiate_type(&req.type_tag).expect("checked above");
    ch.publishers.push(PublisherRec {
        id: publisher_id,
        session,
        reliable: req.is_reliable,
        is_public: req.is_public,
        bridge: req.is_bridge,
        trigger,
    });
    let channel_id = ch.id;

    let counters = registry.scb.counters(channel_id);
    counters.add_pub(req.is_reliable, 1);
    counters.bump_pub_updates();
    let num_sub_updates = counters.sub_updates();

    tracing::info!(
        session,
        channel = %req.channel_name,
        publisher_id,
        reliable = req.is_reliable,
        "publisher created"
    );

    Ok((
        CreatePublisherResponse {
            error: String::new(),
            channel_id: channel_id as u32,
            publisher_id,
            ccb_fd_index: 0,
            buffers_fd_index: 1,
            trigger_fd_index: 2,
            poll_fd_index: 3,
            sub_trigger_fd_indexes,
            num_sub_updates,
            type_tag,
        },
        fds,
    ))
}

fn create_subscriber(
    registry: &mut Registry,
    session: u64,
    req: CreateSubscriberRequest,
) -> Result<(CreateSubscriberResponse, Vec<OwnedFd>), String> {
    let is_refresh = req.subscriber_id >= 0;

    let ch = if is_refresh {
        registry
            .channel_mut(&req.channel_name)
            .ok_or_else(|| format!("unknown channel {:?}", req.channel_name))?
    } else {
        registry.channel_or_create(&req.channel_name, &req.type_tag)?
    };
    ch.check_type(&req.type_tag)?;
    if is_refresh && !ch.subscribers.iter().any(|s| s.id == req.subscriber_id) {
        return Err(format!(
            "channel {:?} has no subscriber {}",
            req.channel_name, req.subscriber_id
        ));
    }

    let new_trigger = if is_refresh {
        None
    } else {
        Some(TriggerPair::new().map_err(|err| format!("trigger allocation failed: {err}"))?)
    };

    let mut fds = Vec::new();
    let (ccb_fd_index, buffers_fd_index) = match &ch.channel {
        Some(channel) => {
            fds.push(dup(channel.ccb_fd())?);
            fds.push(dup(channel.buffers_fd())?);
            (Some(0), Some(1))
        }
        None => (None, None),
    };
    {
        let trigger = match &new_trigger {
            Some(trigger) => trigger,
            None => {
                &ch.subscribers
                    .iter()
                    .find(|s| s.id == req.subscriber_id)
                    .expect("checked above")
                    .trigger
            }
        };
        fds.push(dup(trigger.signal_fd())?);
        fds.push(dup(trigger.wait_fd())?);
    }
    let trigger_fd_index = fds.len() as u32 - 2;
    let poll_fd_index = fds.len() as u32 - 1;
    let mut reliable_pub_trigger_fd_indexes = Vec::new();
    for publisher in ch.publishers.iter().filter(|p| p.reliable) {
        fds.push(dup(publisher.trigger.signal_fd())?);
        reliable_pub_trigger_fd_indexes.push(fds.len() as u32 - 1);
    }

    // Nothing below fails except id exhaustion, which commits nothing.
    let subscriber_id = if let Some(trigger) = new_trigger {
        let id = ch
            .owners
            .allocate()
            .ok_or_else(|| format!("channel {} participant ids exhausted", req.channel_name))?;
        ch.subscribers.push(SubscriberRec {
            id,
            session,
            reliable: req.is_reliable,
            bridge: req.is_bridge,
            trigger,
        });
        id
    } else {
        req.subscriber_id
    };
    let type_tag = ch.negotiate_type(&req.type_tag).expect("checked above");

    let slot_size = ch.slot_size;
    let num_slots = ch.num_slots;
    let channel_id = ch.id;
    let reliable = req.is_reliable;

    let counters = registry.scb.counters(channel_id);
    if !is_refresh {
        counters.add_sub(reliable, 1);
        counters.bump_sub_updates();
    }
    let num_pub_updates = counters.pub_updates();

    tracing::info!(
        session,
        channel = %req.channel_name,
        subscriber_id,
        reliable,
        refresh = is_refresh,
        placeholder = ccb_fd_index.is_none(),
        "subscriber created"
    );

    Ok((
        CreateSubscriberResponse {
            error: String::new(),
            channel_id: channel_id as u32,
            subscriber_id,
            slot_size,
            num_slots,
            ccb_fd_index,
            buffers_fd_index,
            trigger_fd_index,
            poll_fd_index,
            reliable_pub_trigger_fd_indexes,
            num_pub_updates,
            type_tag,
        },
        fds,
    ))
}

fn get_triggers(
    registry: &mut Registry,
    req: GetTriggersRequest,
) -> Result<(GetTriggersResponse, Vec<OwnedFd>), String> {
    let ch = registry
        .channel_mut(&req.channel_name)
        .ok_or_else(|| format!("unknown channel {:?}", req.channel_name))?;

    let mut fds = Vec::with_capacity(ch.subscribers.len() + ch.publishers.len());
    let mut sub_trigger_fd_indexes = Vec::with_capacity(ch.subscribers.len());
    for sub in &ch.subscribers {
        fds.push(dup(sub.trigger.signal_fd())?);
        sub_trigger_fd_indexes.push(fds.len() as u32 - 1);
    }
    let mut reliable_pub_trigger_fd_indexes = Vec::new();
    for publisher in ch.publishers.iter().filter(|p| p.reliable) {
        fds.push(dup(publisher.trigger.signal_fd())?);
        reliable_pub_trigger_fd_indexes.push(fds.len() as u32 - 1);
    }

    Ok((
        GetTriggersResponse {
            error: String::new(),
            sub_trigger_fd_indexes,
            reliable_pub_trigger_fd_indexes,
        },
        fds,
    ))
}

fn dup(fd: BorrowedFd<'_>) -> Result<OwnedFd, String> {
    fd.try_clone_to_owned()
        .map_err(|err| format!("descriptor duplication failed: {err}"))
}
