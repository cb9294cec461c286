//! The subscriber handle.
//!
//! Reads walk the channel's active list, pinning one slot at a time with
//! a reference count. A subscriber created before any publisher is a
//! placeholder — it owns a valid trigger pair and can wait, and it
//! materializes its mappings the first time the SCB shows a publisher
//! arrived.

use std::cell::RefCell;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use herald_shm::channel::{Channel, SlotRef};
use herald_shm::layout::prefix_flags;
use herald_shm::trigger;
use herald_wire::{
    CreateSubscriberRequest, GetTriggersRequest, RemoveSubscriberRequest, Request, Response,
};

use crate::conn::Conn;
use crate::error::ClientError;
use crate::message::Message;
use crate::waiter::Waiter;

/// Options for [`crate::Client::create_subscriber`].
#[derive(Debug, Clone, Default)]
pub struct SubscriberOptions {
    pub reliable: bool,
    pub bridge: bool,
    pub type_tag: String,
    /// Deliver reliable activation messages instead of silently skipping
    /// them. Bridges want this; almost nothing else does.
    pub pass_activation: bool,
}

impl SubscriberOptions {
    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
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

    pub fn pass_activation(mut self, pass: bool) -> Self {
        self.pass_activation = pass;
        self
    }
}

/// Which message a read should land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// The oldest message newer than the one currently held.
    Next,
    /// The newest active message.
    Newest,
}

pub struct Subscriber {
    pub(crate) conn: Rc<RefCell<Conn>>,
    pub(crate) name: String,
    pub(crate) channel_id: usize,
    pub(crate) subscriber_id: i32,
    pub(crate) opts: SubscriberOptions,
    /// `None` while this subscriber is a placeholder.
    pub(crate) channel: Option<Channel>,
    /// Signal end of our own trigger pair (self-kick).
    pub(crate) trigger_fd: OwnedFd,
    /// Wait end of our own trigger pair.
    pub(crate) poll_fd: OwnedFd,
    /// Signal ends of every reliable publisher's trigger pair; poked when
    /// we drain the channel, to release backpressure.
    pub(crate) reliable_pub_triggers: Vec<OwnedFd>,
    /// Cached `num_pub_updates`.
    pub(crate) num_updates: u16,
    pub(crate) slot: Option<SlotRef>,
    pub(crate) drop_callback: Option<Box<dyn FnMut(i64)>>,
    /// Reusable scratch for timestamp searches.
    pub(crate) scratch: Vec<(i32, u64)>,
    pub(crate) waiter: Box<dyn Waiter>,
    pub(crate) removed: bool,
}

impl Subscriber {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reliable(&self) -> bool {
        self.opts.reliable
    }

    /// Whether this subscriber still awaits its first publisher.
    pub fn is_placeholder(&self) -> bool {
        self.channel.is_none()
    }

    /// Ordinal of the currently held message, if any.
    pub fn current_ordinal(&self) -> Option<i64> {
        self.slot.map(|s| s.ordinal)
    }

    /// Reference count on the currently held slot. Diagnostic only.
    pub fn current_slot_ref_count(&self) -> Option<i16> {
        let channel = self.channel.as_ref()?;
        self.slot.map(|s| channel.slot_ref_count(s.id))
    }

    /// Replace the default blocking waiter.
    pub fn set_waiter(&mut self, waiter: Box<dyn Waiter>) {
        self.waiter = waiter;
    }

    /// Called with the ordinal gap whenever messages were overwritten
    /// before this subscriber read them.
    pub fn on_dropped_messages(&mut self, callback: impl FnMut(i64) + 'static) {
        self.drop_callback = Some(Box::new(callback));
    }

    /// Read one message. `Ok(None)` means nothing to read right now — the
    /// channel is drained, or this subscriber is still a placeholder.
    pub fn read_message(&mut self, mode: ReadMode) -> Result<Option<Message<'_>>, ClientError> {
        if self.is_placeholder() {
            self.reload()?;
            if self.is_placeholder() {
                trigger::drain(self.poll_fd.as_fd());
                return Ok(None);
            }
        }
        self.reload_reliable_publishers_if_necessary()?;
        self.read_internal(mode, self.opts.pass_activation, true)
    }

    /// Find the active message with exactly this timestamp. Ownership is
    /// unchanged on a miss.
    pub fn find_message(&mut self, timestamp: u64) -> Result<Option<Message<'_>>, ClientError> {
        if self.is_placeholder() {
            self.reload()?;
            if self.is_placeholder() {
                trigger::drain(self.poll_fd.as_fd());
                return Ok(None);
            }
        }
        self.reload_reliable_publishers_if_necessary()?;

        let found = self
            .channel
            .as_ref()
            .expect("not a placeholder")
            .find_slot_by_timestamp(
                self.slot,
                timestamp,
                self.opts.reliable,
                self.subscriber_id,
                &mut self.scratch,
            )?;
        let Some(found) = found else {
            return Ok(None);
        };
        self.slot = Some(found);

        let channel = self.channel.as_ref().expect("not a placeholder");
        let prefix = channel.prefix(found.id);
        let size = channel.slot_message_size(found.id).max(0) as usize;
        // SAFETY: our reference pins the slot.
        let data = unsafe { channel.payload(found.id, size) };
        Ok(Some(Message {
            data,
            ordinal: found.ordinal,
            timestamp: prefix.timestamp,
        }))
    }

    /// Park until a publisher signals new data (or the broker closes our
    /// trigger, which also wakes us).
    pub fn wait(&mut self) -> Result<(), ClientError> {
        self.waiter.wait(self.poll_fd.as_fd())?;
        Ok(())
    }

    /// Tear down this subscriber at the broker. Also happens implicitly on
    /// drop, where failures are ignored.
    pub fn remove(mut self) -> Result<(), ClientError> {
        self.removed = true;
        let (response, _fds) = self.conn.borrow_mut().request(&Request::RemoveSubscriber(
            RemoveSubscriberRequest {
                channel_name: self.name.clone(),
                subscriber_id: self.subscriber_id,
            },
        ))?;
        match response {
            Response::RemoveSubscriber(resp) if resp.error.is_empty() => Ok(()),
            Response::RemoveSubscriber(resp) => Err(ClientError::Refused(resp.error)),
            _ => Err(ClientError::Protocol(
                "mismatched response to RemoveSubscriber".to_string(),
            )),
        }
    }

    fn read_internal(
        &mut self,
        mode: ReadMode,
        pass_activation: bool,
        clear_trigger: bool,
    ) -> Result<Option<Message<'_>>, ClientError> {
        if clear_trigger {
            trigger::drain(self.poll_fd.as_fd());
        }
        let reliable = self.opts.reliable;
        let owner = self.subscriber_id;

        loop {
            let old = self.slot;
            let new = {
                let channel = self.channel.as_ref().expect("not a placeholder");
                match mode {
                    ReadMode::Next => channel.next_slot(old, reliable, owner)?,
                    ReadMode::Newest => channel.last_slot(old, reliable, owner)?,
                }
            };
            let Some(new) = new else {
                // Drained. Ask reliable publishers for more; anyone parked
                // on backpressure re-runs its slot hunt.
                for fd in &self.reliable_pub_triggers {
                    trigger::signal(fd.as_fd());
                }
                return Ok(None);
            };
            self.slot = Some(new);

            // A subscriber that has read nothing yet treats -1 as its last
            // ordinal, so messages overwritten before its first read count
            // as drops too.
            let last_ordinal = old.map(|s| s.ordinal).unwrap_or(-1);
            if new.ordinal != last_ordinal + 1
                && let Some(callback) = self.drop_callback.as_mut()
            {
                callback(new.ordinal - last_ordinal - 1);
            }

            let channel = self.channel.as_ref().expect("not a placeholder");
            let prefix = channel.prefix(new.id);
            if prefix.flags & prefix_flags::ACTIVATE != 0 && !pass_activation {
                // Activation messages only exist to seed our reference;
                // keep reading without re-clearing the trigger.
                continue;
            }

            let size = channel.slot_message_size(new.id).max(0) as usize;
            // SAFETY: our reference pins the slot.
            let data = unsafe { channel.payload(new.id, size) };
            return Ok(Some(Message {
                data,
                ordinal: new.ordinal,
                timestamp: prefix.timestamp,
            }));
        }
    }

    /// Placeholder materialization: re-issue `CreateSubscriber` with our
    /// existing id and map whatever the broker now has.
    fn reload(&mut self) -> Result<(), ClientError> {
        let updates = {
            let conn = self.conn.borrow();
            conn.scb().counters(self.channel_id).pub_updates()
        };
        if updates == self.num_updates {
            return Ok(());
        }
        self.num_updates = updates;

        let mut conn = self.conn.borrow_mut();
        let (response, mut fds) = conn.request(&Request::CreateSubscriber(
            CreateSubscriberRequest {
                channel_name: self.name.clone(),
                subscriber_id: self.subscriber_id,
                is_reliable: self.opts.reliable,
                is_bridge: self.opts.bridge,
                type_tag: self.opts.type_tag.clone(),
            },
        ))?;
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

        if let (Some(ccb_index), Some(buffers_index)) = (resp.ccb_fd_index, resp.buffers_fd_index)
        {
            let ccb = conn.take_fd(&mut fds, ccb_index)?;
            let buffers = conn.take_fd(&mut fds, buffers_index)?;
            self.channel = Some(Channel::map(&self.name, ccb, buffers)?);
        }
        self.trigger_fd = conn.take_fd(&mut fds, resp.trigger_fd_index)?;
        self.poll_fd = conn.take_fd(&mut fds, resp.poll_fd_index)?;
        let mut triggers = Vec::with_capacity(resp.reliable_pub_trigger_fd_indexes.len());
        for index in resp.reliable_pub_trigger_fd_indexes {
            triggers.push(conn.take_fd(&mut fds, index)?);
        }
        self.reliable_pub_triggers = triggers;

        tracing::debug!(
            channel = %self.name,
            placeholder = self.channel.is_none(),
            "subscriber reloaded"
        );
        Ok(())
    }

    /// Refresh the reliable-publisher trigger list if the roster moved.
    fn reload_reliable_publishers_if_necessary(&mut self) -> Result<(), ClientError> {
        let updates = {
            let conn = self.conn.borrow();
            conn.scb().counters(self.channel_id).pub_updates()
        };
        if updates == self.num_updates {
            return Ok(());
        }
        self.num_updates = updates;

        let mut conn = self.conn.borrow_mut();
        let (response, mut fds) = conn.request(&Request::GetTriggers(GetTriggersRequest {
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

        let mut triggers = Vec::with_capacity(resp.reliable_pub_trigger_fd_indexes.len());
        for index in resp.reliable_pub_trigger_fd_indexes {
            triggers.push(conn.take_fd(&mut fds, index)?);
        }
        self.reliable_pub_triggers = triggers;
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let request = Request::RemoveSubscriber(RemoveSubscriberRequest {
            channel_name: self.name.clone(),
            subscriber_id: self.subscriber_id,
        });
        if let Ok(mut conn) = self.conn.try_borrow_mut() {
            let _ = conn.request(&request);
        }
    }
}
