//! The publisher handle.
//!
//! A publisher owns one busy slot at a time. `message_buffer` exposes that
//! slot's bytes for in-place filling; `publish` activates it, wakes
//! subscribers, and takes a replacement. Reliable publishers experience
//! backpressure as `message_buffer() == None` and park on their poll
//! descriptor until a subscriber signals it.

use std::cell::RefCell;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use herald_shm::channel::Channel;
use herald_shm::trigger;
use herald_wire::{GetTriggersRequest, Request, RemovePublisherRequest, Response};

use crate::conn::Conn;
use crate::error::ClientError;
use crate::message::PublishInfo;
use crate::waiter::Waiter;

/// Options for [`crate::Client::create_publisher`].
#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    pub public: bool,
    pub reliable: bool,
    pub bridge: bool,
    pub type_tag: String,
}

impl PublisherOptions {
    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn bridge(mut self, bridge: bool) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = type_tag.into();
        self
    }
}

pub struct Publisher {
    pub(crate) conn: Rc<RefCell<Conn>>,
    pub(crate) name: String,
    pub(crate) channel_id: usize,
    pub(crate) publisher_id: i32,
    pub(crate) opts: PublisherOptions,
    pub(crate) channel: Channel,
    /// Signal end of our own trigger pair (kept so the pair stays valid
    /// for the lifetime of the handle).
    #[allow(dead_code)]
    pub(crate) trigger_fd: OwnedFd,
    /// Wait end of our own trigger pair; reliable backpressure release
    /// arrives here.
    pub(crate) poll_fd: OwnedFd,
    /// Signal ends of every known subscriber's trigger pair.
    pub(crate) sub_triggers: Vec<OwnedFd>,
    /// Cached `num_sub_updates`; a mismatch against the SCB means the
    /// subscriber roster changed.
    pub(crate) num_updates: u16,
    pub(crate) slot: Option<i32>,
    pub(crate) waiter: Box<dyn Waiter>,
    pub(crate) removed: bool,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("name", &self.name)
            .field("channel_id", &self.channel_id)
            .field("publisher_id", &self.publisher_id)
            .field("opts", &self.opts)
            .field("num_updates", &self.num_updates)
            .field("slot", &self.slot)
            .field("removed", &self.removed)
            .finish()
    }
}

impl Publisher {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reliable(&self) -> bool {
        self.opts.reliable
    }

    pub fn slot_size(&self) -> usize {
        self.channel.slot_size() as usize
    }

    /// Replace the default blocking waiter.
    pub fn set_waiter(&mut self, waiter: Box<dyn Waiter>) {
        self.waiter = waiter;
    }

    /// Current subscriber count, straight from the SCB.
    pub fn num_subscribers(&self) -> u16 {
        use core::sync::atomic::Ordering;
        self.conn
            .borrow()
            .scb()
            .counters(self.channel_id)
            .num_subs
            .load(Ordering::Acquire)
    }

    /// The buffer to fill for the next message.
    ///
    /// `None` is backpressure, never an error: a reliable publisher found
    /// no safe slot (or has no subscribers yet to anchor reliability).
    /// Wait on [`Publisher::wait`] and retry.
    pub fn message_buffer(&mut self) -> Result<Option<&mut [u8]>, ClientError> {
        trigger::drain(self.poll_fd.as_fd());
        self.reload_subscribers_if_necessary()?;

        if self.opts.reliable {
            // With no subscriber holding a reference there is nothing to
            // stop us exhausting every slot; a late subscriber would miss
            // those messages, which is exactly what reliability forbids.
            if self.num_subscribers() == 0 {
                return Ok(None);
            }
            if self.slot.is_none() {
                self.slot = self
                    .channel
                    .find_free_slot(true, self.publisher_id)?;
                if self.slot.is_none() {
                    return Ok(None);
                }
            }
        } else if self.slot.is_none() {
            self.slot = self.channel.find_free_slot(false, self.publisher_id)?;
            if self.slot.is_none() {
                return Err(ClientError::OutOfSlots(self.name.clone()));
            }
        }

        let slot = self.slot.expect("acquired above");
        // SAFETY: the slot is on the busy list and exclusively ours.
        Ok(Some(unsafe { self.channel.payload_mut(slot) }))
    }

    /// Commit `message_size` bytes of the current buffer as one message.
    pub fn publish(&mut self, message_size: usize) -> Result<PublishInfo, ClientError> {
        self.reload_subscribers_if_necessary()?;

        if message_size > self.channel.slot_size() as usize {
            return Err(ClientError::Usage(format!(
                "message of {message_size} bytes exceeds slot size {}",
                self.channel.slot_size()
            )));
        }
        let slot = self.slot.take().ok_or_else(|| {
            ClientError::Usage("publish without a buffer; call message_buffer() first".to_string())
        })?;

        let msg = self.channel.activate_slot_and_get_another(
            slot,
            message_size as i64,
            self.publisher_id,
            self.opts.reliable,
            false,
            false,
        )?;
        self.slot = msg.new_slot;

        if msg.notify {
            self.trigger_subscribers();
        }

        // A publisher that got no replacement slot is not failing yet: the
        // hunt runs again on the next message_buffer call, when subscriber
        // references may have moved along.
        Ok(PublishInfo {
            ordinal: msg.ordinal,
            timestamp: msg.timestamp,
            message_size,
        })
    }

    /// Park until a subscriber releases backpressure. Reliable only.
    pub fn wait(&mut self) -> Result<(), ClientError> {
        if !self.opts.reliable {
            return Err(ClientError::Usage(
                "unreliable publishers cannot wait".to_string(),
            ));
        }
        self.reload_subscribers_if_necessary()?;
        self.waiter.wait(self.poll_fd.as_fd())?;
        Ok(())
    }

    /// Tear down this publisher at the broker. Also happens implicitly on
    /// drop, where failures are ignored.
    pub fn remove(mut self) -> Result<(), ClientError> {
        self.removed = true;
        let (response, _fds) = self.conn.borrow_mut().request(&Request::RemovePublisher(
            RemovePublisherRequest {
                channel_name: self.name.clone(),
                publisher_id: self.publisher_id,
            },
        ))?;
        match response {
            Response::RemovePublisher(resp) if resp.error.is_empty() => Ok(()),
            Response::RemovePublisher(resp) => Err(ClientError::Refused(resp.error)),
            _ => Err(ClientError::Protocol(
                "mismatched response to RemovePublisher".to_string(),
            )),
        }
    }

    /// Publish the 1-byte activation message that seeds reliable
    /// subscribers with a slot reference. Creation-time only.
    pub(crate) fn send_activation(&mut self) -> Result<(), ClientError> {
        let slot = self
            .channel
            .find_free_slot(true, self.publisher_id)?
            .ok_or_else(|| ClientError::OutOfSlots(self.name.clone()))?;
        // SAFETY: the busy slot is exclusively ours.
        unsafe { self.channel.payload_mut(slot)[0] = 0 };
        let msg = self.channel.activate_slot_and_get_another(
            slot,
            1,
            self.publisher_id,
            true,
            true,
            false,
        )?;
        self.slot = msg.new_slot;
        Ok(())
    }

    pub(crate) fn trigger_subscribers(&self) {
        for fd in &self.sub_triggers {
            trigger::signal(fd.as_fd());
        }
    }

    /// Refresh the subscriber trigger list if the roster version moved.
    fn reload_subscribers_if_necessary(&mut self) -> Result<(), ClientError> {
        let updates = {
            let conn = self.conn.borrow();
            conn.scb().counters(self.channel_id).sub_updates()
        };
        if updates == self.num_updates {
            return Ok(());
        }
        self.num_updates = updates;

        let mut conn = self.conn.borrow_mut();
        let (response, mut fds) =
            conn.request(&Request::GetTriggers(GetTriggersRequest {
                channel_name: self.name.clone(),
            }))?;
        let resp = match response {
            Response::GetTriggers(resp) => resp,
            _ => {
                conn.close();
                return Err(ClientError::Protocol(
                    "mismatched response to GetTriggers".to_string(),
                ));
            }
        };
        if !resp.error.is_empty() {
            return Err(ClientError::Refused(resp.error));
        }

        let mut sub_triggers = Vec::with_capacity(resp.sub_trigger_fd_indexes.len());
        for index in resp.sub_trigger_fd_indexes {
            sub_triggers.push(conn.take_fd(&mut fds, index)?);
        }
        self.sub_triggers = sub_triggers;
        tracing::debug!(
            channel = %self.name,
            subscribers = self.sub_triggers.len(),
            "subscriber triggers reloaded"
        );
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let request = Request::RemovePublisher(RemovePublisherRequest {
            channel_name: self.name.clone(),
            publisher_id: self.publisher_id,
        });
        if let Ok(mut conn) = self.conn.try_borrow_mut() {
            let _ = conn.request(&request);
        }
    }
}
