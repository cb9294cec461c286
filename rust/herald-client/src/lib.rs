//! Client library for the herald pub/sub bus.
//!
//! A [`Client`] speaks to the broker over its Unix control socket exactly
//! long enough to set up shared mappings; after that, publishing and
//! reading are pure shared-memory operations. The control socket is
//! revisited only when the SCB's roster-version counters say something
//! changed.
//!
//! ```no_run
//! use herald_client::{Client, PublisherOptions, ReadMode, SubscriberOptions};
//!
//! # fn main() -> Result<(), herald_client::ClientError> {
//! let client = Client::init("/tmp/herald.sock".as_ref(), "demo")?;
//!
//! let mut publisher =
//!     client.create_publisher("/chat", 256, 8, PublisherOptions::default())?;
//! let buffer = publisher.message_buffer()?.expect("slot");
//! buffer[..5].copy_from_slice(b"hello");
//! publisher.publish(5)?;
//!
//! let mut subscriber = client.create_subscriber("/chat", SubscriberOptions::default())?;
//! subscriber.wait()?;
//! if let Some(message) = subscriber.read_message(ReadMode::Next)? {
//!     assert_eq!(message.data, b"hello");
//! }
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use herald_shm::channel::Channel;
use herald_shm::trigger;
use herald_wire::{CreatePublisherRequest, CreateSubscriberRequest, Request, Response};

mod conn;
pub mod error;
pub mod message;
pub mod publisher;
pub mod subscriber;
pub mod waiter;

pub use error::ClientError;
pub use message::{Message, PublishInfo};
pub use publisher::{Publisher, PublisherOptions};
pub use subscriber::{ReadMode, Subscriber, SubscriberOptions};
pub use waiter::{PollWaiter, Waiter};

use conn::Conn;
use std::os::fd::AsFd;

/// A connection to the broker, from which publishers and subscribers are
/// created. Handles share the connection; the whole family is meant to
/// live on one thread.
pub struct Client {
    conn: Rc<RefCell<Conn>>,
}

impl Client {
    /// Connect to the broker's control socket and announce `client_name`.
    pub fn init(socket_path: &Path, client_name: &str) -> Result<Self, ClientError> {
        let conn = Conn::connect(socket_path, client_name)?;
        Ok(Self {
            conn: Rc::new(RefCell::new(conn)),
        })
    }

    /// The display name sent at init.
    pub fn name(&self) -> String {
        self.conn.borrow().client_name().to_string()
    }

    /// Create a publisher. The first publisher on a channel decides its
    /// slot geometry; later ones must agree.
    pub fn create_publisher(
        &self,
        channel_name: &str,
        slot_size: usize,
        num_slots: usize,
        opts: PublisherOptions,
    ) -> Result<Publisher, ClientError> {
        let (response, mut fds) = self.conn.borrow_mut().request(&Request::CreatePublisher(
            CreatePublisherRequest {
                channel_name: channel_name.to_string(),
                slot_size: slot_size as i32,
                num_slots: num_slots as i32,
                is_public: opts.public,
                is_reliable: opts.reliable,
                is_bridge: opts.bridge,
                type_tag: opts.type_tag.clone(),
            },
        ))?;

        let mut conn = self.conn.borrow_mut();
        let resp = match response {
            Response::CreatePublisher(resp) => resp,
            _ => {
                conn.close();
                return Err(ClientError::Protocol(
                    "mismatched response to CreatePublisher".to_string(),
                ));
            }
        };
        if !resp.error.is_empty() {
            return Err(ClientError::Refused(resp.error));
        }

        let ccb = conn.take_fd(&mut fds, resp.ccb_fd_index)?;
        let buffers = conn.take_fd(&mut fds, resp.buffers_fd_index)?;
        let channel = Channel::map(channel_name, ccb, buffers)?;
        let trigger_fd = conn.take_fd(&mut fds, resp.trigger_fd_index)?;
        let poll_fd = conn.take_fd(&mut fds, resp.poll_fd_index)?;
        let mut sub_triggers = Vec::with_capacity(resp.sub_trigger_fd_indexes.len());
        for index in resp.sub_trigger_fd_indexes {
            sub_triggers.push(conn.take_fd(&mut fds, index)?);
        }
        drop(conn);

        let mut publisher = Publisher {
            conn: self.conn.clone(),
            name: channel_name.to_string(),
            channel_id: resp.channel_id as usize,
            publisher_id: resp.publisher_id,
            opts,
            channel,
            trigger_fd,
            poll_fd,
            sub_triggers,
            num_updates: resp.num_sub_updates,
            slot: None,
            waiter: Box::new(PollWaiter),
            removed: false,
        };

        if publisher.opts.reliable {
            // Seed every reliable subscriber with a reference so we can
            // never race ahead of one that has yet to read anything.
            publisher.send_activation()?;
        } else {
            publisher.slot = publisher
                .channel
                .find_free_slot(false, publisher.publisher_id)?;
            if publisher.slot.is_none() {
                return Err(ClientError::OutOfSlots(channel_name.to_string()));
            }
        }
        publisher.trigger_subscribers();

        Ok(publisher)
    }

    /// Create a subscriber. Works before any publisher exists: the handle
    /// starts as a placeholder and materializes transparently.
    pub fn create_subscriber(
        &self,
        channel_name: &str,
        opts: SubscriberOptions,
    ) -> Result<Subscriber, ClientError> {
        let (response, mut fds) = self.conn.borrow_mut().request(&Request::CreateSubscriber(
            CreateSubscriberRequest {
                channel_name: channel_name.to_string(),
                subscriber_id: -1,
                is_reliable: opts.reliable,
                is_bridge: opts.bridge,
                type_tag: opts.type_tag.clone(),
            },
        ))?;

        let mut conn = self.conn.borrow_mut();
        let resp = match response {
            Response::CreateSubscriber(resp) => resp,
            _ => {
                conn.close();
                return Err(ClientError::Protocol(
                    "mismatched response to CreateSubscriber".to_string(),
                ));
            }
        };
        if !resp.error.is_empty() {
            return Err(ClientError::Refused(resp.error));
        }

        let channel = match (resp.ccb_fd_index, resp.buffers_fd_index) {
            (Some(ccb_index), Some(buffers_index)) => {
                let ccb = conn.take_fd(&mut fds, ccb_index)?;
                let buffers = conn.take_fd(&mut fds, buffers_index)?;
                Some(Channel::map(channel_name, ccb, buffers)?)
            }
            _ => None,
        };
        let trigger_fd = conn.take_fd(&mut fds, resp.trigger_fd_index)?;
        let poll_fd = conn.take_fd(&mut fds, resp.poll_fd_index)?;
        let mut reliable_pub_triggers =
            Vec::with_capacity(resp.reliable_pub_trigger_fd_indexes.len());
        for index in resp.reliable_pub_trigger_fd_indexes {
            reliable_pub_triggers.push(conn.take_fd(&mut fds, index)?);
        }
        drop(conn);

        let subscriber = Subscriber {
            conn: self.conn.clone(),
            name: channel_name.to_string(),
            channel_id: resp.channel_id as usize,
            subscriber_id: resp.subscriber_id,
            opts,
            channel,
            trigger_fd,
            poll_fd,
            reliable_pub_triggers,
            num_updates: resp.num_pub_updates,
            slot: None,
            drop_callback: None,
            scratch: Vec::new(),
            waiter: Box::new(PollWaiter),
            removed: false,
        };

        // Kick our own trigger so the first wait returns immediately and
        // the subscriber picks up whatever is already active.
        trigger::signal(subscriber.trigger_fd.as_fd());

        Ok(subscriber)
    }
}
