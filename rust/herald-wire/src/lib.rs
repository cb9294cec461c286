//! Control-plane wire types for the herald pub/sub bus.
//!
//! Requests and responses travel over the broker's Unix socket as
//! length-prefixed postcard frames (see [`framing`]). File descriptors ride
//! out-of-band as `SCM_RIGHTS` ancillary data immediately after the frame;
//! the `*_fd_index` fields below name positions in that descriptor array.
//!
//! Every response carries an `error` string. Empty means success;
//! non-empty means the broker refused the operation and changed nothing.

use facet::Facet;

pub mod framing;

pub use framing::{FrameError, read_frame, read_frame_async, write_frame, write_frame_async};

/// Announce a client to the broker. First request on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct InitRequest {
    /// Display name, for broker logs.
    pub client_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct InitResponse {
    pub error: String,
    /// Index of the system control block descriptor.
    pub scb_fd_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct CreatePublisherRequest {
    pub channel_name: String,
    /// Payload bytes per slot, not counting the message prefix.
    pub slot_size: i32,
    pub num_slots: i32,
    pub is_public: bool,
    pub is_reliable: bool,
    pub is_bridge: bool,
    /// Opaque user type tag; must agree with the channel's existing tag.
    pub type_tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct CreatePublisherResponse {
    pub error: String,
    pub channel_id: u32,
    pub publisher_id: i32,
    pub ccb_fd_index: u32,
    pub buffers_fd_index: u32,
    /// Signal end of the publisher's own trigger pair.
    pub trigger_fd_index: u32,
    /// Wait end of the publisher's own trigger pair.
    pub poll_fd_index: u32,
    /// Signal ends of every current subscriber's trigger pair, to wake on
    /// publish.
    pub sub_trigger_fd_indexes: Vec<u32>,
    /// Subscriber roster version the trigger list corresponds to.
    pub num_sub_updates: u16,
    pub type_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct CreateSubscriberRequest {
    pub channel_name: String,
    /// `-1` allocates a new subscriber; an existing id refreshes that
    /// subscriber's mappings and trigger lists.
    pub subscriber_id: i32,
    pub is_reliable: bool,
    pub is_bridge: bool,
    pub type_tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct CreateSubscriberResponse {
    pub error: String,
    pub channel_id: u32,
    pub subscriber_id: i32,
    pub slot_size: i32,
    /// Zero for a placeholder (channel has never had a publisher).
    pub num_slots: i32,
    /// Absent for placeholders, which have no shared memory yet.
    pub ccb_fd_index: Option<u32>,
    pub buffers_fd_index: Option<u32>,
    /// Signal end of the subscriber's own trigger pair.
    pub trigger_fd_index: u32,
    /// Wait end of the subscriber's own trigger pair.
    pub poll_fd_index: u32,
    /// Signal ends of every reliable publisher's trigger pair, to request
    /// more data when the active list runs dry.
    pub reliable_pub_trigger_fd_indexes: Vec<u32>,
    /// Publisher roster version the trigger list corresponds to.
    pub num_pub_updates: u16,
    pub type_tag: String,
}

/// Re-fetch a channel's trigger descriptor lists without allocating
/// anything. Issued after a roster-version mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct GetTriggersRequest {
    pub channel_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct GetTriggersResponse {
    pub error: String,
    pub sub_trigger_fd_indexes: Vec<u32>,
    pub reliable_pub_trigger_fd_indexes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct RemovePublisherRequest {
    pub channel_name: String,
    pub publisher_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct RemovePublisherResponse {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct RemoveSubscriberRequest {
    pub channel_name: String,
    pub subscriber_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct RemoveSubscriberResponse {
    pub error: String,
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Request {
    Init(InitRequest) = 0,
    CreatePublisher(CreatePublisherRequest) = 1,
    CreateSubscriber(CreateSubscriberRequest) = 2,
    GetTriggers(GetTriggersRequest) = 3,
    RemovePublisher(RemovePublisherRequest) = 4,
    RemoveSubscriber(RemoveSubscriberRequest) = 5,
}

/// A broker response. Always the same variant as the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Response {
    Init(InitResponse) = 0,
    CreatePublisher(CreatePublisherResponse) = 1,
    CreateSubscriber(CreateSubscriberResponse) = 2,
    GetTriggers(GetTriggersResponse) = 3,
    RemovePublisher(RemovePublisherResponse) = 4,
    RemoveSubscriber(RemoveSubscriberResponse) = 5,
}

impl Response {
    /// How many descriptors accompany this response.
    ///
    /// The broker assigns indexes densely from zero, so the count is one
    /// past the largest index referenced by the body. The receiver uses
    /// this to know how many `SCM_RIGHTS` messages follow the frame.
    pub fn num_fds(&self) -> usize {
        let max = match self {
            Response::Init(r) => {
                if r.error.is_empty() {
                    Some(r.scb_fd_index)
                } else {
                    None
                }
            }
            Response::CreatePublisher(r) => {
                if r.error.is_empty() {
                    [r.ccb_fd_index, r.buffers_fd_index, r.trigger_fd_index, r.poll_fd_index]
                        .into_iter()
                        .chain(r.sub_trigger_fd_indexes.iter().copied())
                        .max()
                } else {
                    None
                }
            }
            Response::CreateSubscriber(r) => {
                if r.error.is_empty() {
                    [r.trigger_fd_index, r.poll_fd_index]
                        .into_iter()
                        .chain(r.ccb_fd_index)
                        .chain(r.buffers_fd_index)
                        .chain(r.reliable_pub_trigger_fd_indexes.iter().copied())
                        .max()
                } else {
                    None
                }
            }
            Response::GetTriggers(r) => {
                if r.error.is_empty() {
                    r.sub_trigger_fd_indexes
                        .iter()
                        .chain(r.reliable_pub_trigger_fd_indexes.iter())
                        .copied()
                        .max()
                } else {
                    None
                }
            }
            Response::RemovePublisher(_) | Response::RemoveSubscriber(_) => None,
        };
        max.map(|m| m as usize + 1).unwrap_or(0)
    }

    /// The refusal message, if the broker rejected the operation.
    pub fn error(&self) -> &str {
        match self {
            Response::Init(r) => &r.error,
            Response::CreatePublisher(r) => &r.error,
            Response::CreateSubscriber(r) => &r.error,
            Response::GetTriggers(r) => &r.error,
            Response::RemovePublisher(r) => &r.error,
            Response::RemoveSubscriber(r) => &r.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: Request) {
        let bytes = facet_postcard::to_vec(&req).unwrap();
        let back: Request = facet_postcard::from_slice(&bytes).unwrap();
        assert_eq!(back, req);
    }

    fn roundtrip_response(resp: Response) {
        let bytes = facet_postcard::to_vec(&resp).unwrap();
        let back: Response = facet_postcard::from_slice(&bytes).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn requests_roundtrip() {
        roundtrip_request(Request::Init(InitRequest {
            client_name: "camera-driver".into(),
        }));
        roundtrip_request(Request::CreatePublisher(CreatePublisherRequest {
            channel_name: "/sensors/lidar".into(),
            slot_size: 4096,
            num_slots: 16,
            is_public: true,
            is_reliable: true,
            is_bridge: false,
            type_tag: "lidar.Scan".into(),
        }));
        roundtrip_request(Request::CreateSubscriber(CreateSubscriberRequest {
            channel_name: "/sensors/lidar".into(),
            subscriber_id: -1,
            is_reliable: false,
            is_bridge: false,
            type_tag: String::new(),
        }));
        roundtrip_request(Request::RemoveSubscriber(RemoveSubscriberRequest {
            channel_name: "/sensors/lidar".into(),
            subscriber_id: 3,
        }));
    }

    #[test]
    fn responses_roundtrip() {
        roundtrip_response(Response::CreateSubscriber(CreateSubscriberResponse {
            channel_id: 7,
            subscriber_id: 2,
            slot_size: 256,
            num_slots: 8,
            ccb_fd_index: Some(0),
            buffers_fd_index: Some(1),
            trigger_fd_index: 2,
            poll_fd_index: 3,
            reliable_pub_trigger_fd_indexes: vec![4, 5],
            num_pub_updates: 9,
            type_tag: "imu.Sample".into(),
            ..Default::default()
        }));
        roundtrip_response(Response::GetTriggers(GetTriggersResponse {
            sub_trigger_fd_indexes: vec![0, 1, 2],
            reliable_pub_trigger_fd_indexes: vec![3],
            ..Default::default()
        }));
    }

    #[test]
    fn fd_counts_match_dense_index_assignment() {
        assert_eq!(
            Response::Init(InitResponse {
                scb_fd_index: 0,
                ..Default::default()
            })
            .num_fds(),
            1
        );

        let resp = Response::CreatePublisher(CreatePublisherResponse {
            ccb_fd_index: 0,
            buffers_fd_index: 1,
            trigger_fd_index: 2,
            poll_fd_index: 3,
            sub_trigger_fd_indexes: vec![4, 5, 6],
            ..Default::default()
        });
        assert_eq!(resp.num_fds(), 7);

        // Placeholder subscribers get only their own trigger pair.
        let resp = Response::CreateSubscriber(CreateSubscriberResponse {
            trigger_fd_index: 0,
            poll_fd_index: 1,
            ..Default::default()
        });
        assert_eq!(resp.num_fds(), 2);

        assert_eq!(
            Response::GetTriggers(GetTriggersResponse::default()).num_fds(),
            0
        );
    }

    #[test]
    fn refusals_carry_no_fds() {
        let resp = Response::CreatePublisher(CreatePublisherResponse {
            error: "slot size mismatch".into(),
            ..Default::default()
        });
        assert_eq!(resp.num_fds(), 0);
        assert_eq!(resp.error(), "slot size mismatch");
    }
}
