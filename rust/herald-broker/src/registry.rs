//! The broker's authoritative channel table.
//!
//! For every channel the broker keeps the shared-memory mapping (it is the
//! allocator and the last unmapper), the participant roster with each
//! participant's trigger pair, and the per-channel owner-id space. All
//! mutation happens from connection handlers on one thread.

use std::collections::HashMap;

use herald_shm::bitset::MAX_SLOT_OWNERS;
use herald_shm::channel::Channel;
use herald_shm::scb::{MAX_CHANNELS, Scb};
use herald_shm::trigger::TriggerPair;

/// Allocates channel ids: indexes into the SCB counter table.
pub struct ChannelIdAllocator {
    in_use: Vec<bool>,
}

impl ChannelIdAllocator {
    pub fn new() -> Self {
        Self {
            in_use: vec![false; MAX_CHANNELS],
        }
    }

    pub fn allocate(&mut self) -> Option<usize> {
        let id = self.in_use.iter().position(|used| !used)?;
        self.in_use[id] = true;
        Some(id)
    }

    pub fn free(&mut self, id: usize) {
        self.in_use[id] = false;
    }
}

impl Default for ChannelIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates participant ids within one channel: indexes into the slot
/// owner bitsets.
pub struct OwnerIdAllocator {
    in_use: Vec<bool>,
}

impl OwnerIdAllocator {
    fn new() -> Self {
        Self {
            in_use: vec![false; MAX_SLOT_OWNERS],
        }
    }

    pub fn allocate(&mut self) -> Option<i32> {
        let id = self.in_use.iter().position(|used| !used)?;
        self.in_use[id] = true;
        Some(id as i32)
    }

    pub fn free(&mut self, id: i32) {
        if id >= 0 && (id as usize) < self.in_use.len() {
            self.in_use[id as usize] = false;
        }
    }
}

/// One registered publisher.
pub struct PublisherRec {
    pub id: i32,
    /// Connection that created this publisher; it dies with it.
    pub session: u64,
    pub reliable: bool,
    pub is_public: bool,
    pub bridge: bool,
    pub trigger: TriggerPair,
}

/// One registered subscriber.
pub struct SubscriberRec {
    pub id: i32,
    pub session: u64,
    pub reliable: bool,
    pub bridge: bool,
    pub trigger: TriggerPair,
}

/// Broker-side state for one channel.
pub struct ServerChannel {
    pub name: String,
    pub id: usize,
    pub type_tag: String,
    /// `None` while the channel is a placeholder (subscribers only, no
    /// publisher has sized it yet).
    pub channel: Option<Channel>,
    pub slot_size: i32,
    pub num_slots: i32,
    pub owners: OwnerIdAllocator,
    pub publishers: Vec<PublisherRec>,
    pub subscribers: Vec<SubscriberRec>,
}

impl ServerChannel {
    fn new(name: &str, id: usize, type_tag: String) -> Self {
        Self {
            name: name.to_string(),
            id,
            type_tag,
            channel: None,
            slot_size: 0,
            num_slots: 0,
            owners: OwnerIdAllocator::new(),
            publishers: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.channel.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }

    /// Whether a requested type tag is acceptable, without committing it.
    pub fn check_type(&self, requested: &str) -> Result<(), String> {
        if requested.is_empty() || self.type_tag.is_empty() || self.type_tag == requested {
            Ok(())
        } else {
            Err(format!(
                "channel {} carries type {:?}, not {requested:?}",
                self.name, self.type_tag
            ))
        }
    }

    /// Reconcile a type tag against the channel's. The first non-empty tag
    /// wins; later non-empty tags must match it.
    pub fn negotiate_type(&mut self, requested: &str) -> Result<String, String> {
        if requested.is_empty() {
            return Ok(self.type_tag.clone());
        }
        if self.type_tag.is_empty() {
            self.type_tag = requested.to_string();
            return Ok(self.type_tag.clone());
        }
        if self.type_tag == requested {
            Ok(self.type_tag.clone())
        } else {
            Err(format!(
                "channel {} carries type {:?}, not {requested:?}",
                self.name, self.type_tag
            ))
        }
    }
}

/// The whole broker state.
pub struct Registry {
    pub scb: Scb,
    pub channels: HashMap<String, ServerChannel>,
    channel_ids: ChannelIdAllocator,
}

impl Registry {
    pub fn new(scb: Scb) -> Self {
        Self {
            scb,
            channels: HashMap::new(),
            channel_ids: ChannelIdAllocator::new(),
        }
    }

    /// Look up a channel, creating an (unsized) record if absent.
    pub fn channel_or_create(&mut self, name: &str, type_tag: &str) -> Result<&mut ServerChannel, String> {
        if !self.channels.contains_key(name) {
            let id = self
                .channel_ids
                .allocate()
                .ok_or_else(|| "channel table full".to_string())?;
            // The id may have belonged to a reclaimed channel.
            self.scb.counters(id).reset();
            self.channels
                .insert(name.to_string(), ServerChannel::new(name, id, type_tag.to_string()));
            tracing::info!(channel = name, id, "channel created");
        }
        Ok(self.channels.get_mut(name).expect("just inserted"))
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut ServerChannel> {
        self.channels.get_mut(name)
    }

    /// Drop the channel once its last participant leaves.
    pub fn reclaim_if_empty(&mut self, name: &str) {
        let Some(ch) = self.channels.get(name) else {
            return;
        };
        if !ch.is_empty() {
            return;
        }
        let id = ch.id;
        self.channels.remove(name);
        self.channel_ids.free(id);
        self.scb.counters(id).reset();
        tracing::info!(channel = name, id, "channel reclaimed");
    }

    /// Remove a publisher record: sweep its slots, free its id, close its
    /// trigger pair, update the roster counters.
    pub fn drop_publisher(&mut self, channel_name: &str, publisher_id: i32) -> Result<(), String> {
        let ch = self
            .channels
            .get_mut(channel_name)
            .ok_or_else(|| format!("unknown channel {channel_name:?}"))?;
        let pos = ch
            .publishers
            .iter()
            .position(|p| p.id == publisher_id)
            .ok_or_else(|| {
                format!("channel {channel_name:?} has no publisher {publisher_id}")
            })?;
        let rec = ch.publishers.remove(pos);
        if let Some(channel) = &ch.channel
            && let Err(err) = channel.cleanup_owner(rec.id, rec.reliable)
        {
            tracing::warn!(channel = channel_name, error = %err, "owner sweep failed");
        }
        ch.owners.free(rec.id);
        let counters = self.scb.counters(ch.id);
        counters.add_pub(rec.reliable, -1);
        counters.bump_pub_updates();
        // rec drops here, closing both trigger ends; pollers see EOF.
        drop(rec);
        self.reclaim_if_empty(channel_name);
        Ok(())
    }

    /// Remove a subscriber record, same duties as [`Self::drop_publisher`].
    /// Reliable publishers are woken so a blocked one re-evaluates
    /// backpressure against the shrunken roster.
    pub fn drop_subscriber(&mut self, channel_name: &str, subscriber_id: i32) -> Result<(), String> {
        let ch = self
            .channels
            .get_mut(channel_name)
            .ok_or_else(|| format!("unknown channel {channel_name:?}"))?;
        let pos = ch
            .subscribers
            .iter()
            .position(|s| s.id == subscriber_id)
            .ok_or_else(|| {
                format!("channel {channel_name:?} has no subscriber {subscriber_id}")
            })?;
        let rec = ch.subscribers.remove(pos);
        if let Some(channel) = &ch.channel
            && let Err(err) = channel.cleanup_owner(rec.id, rec.reliable)
        {
            tracing::warn!(channel = channel_name, error = %err, "owner sweep failed");
        }
        ch.owners.free(rec.id);
        for publisher in ch.publishers.iter().filter(|p| p.reliable) {
            herald_shm::trigger::signal(publisher.trigger.signal_fd());
        }
        let counters = self.scb.counters(ch.id);
        counters.add_sub(rec.reliable, -1);
        counters.bump_sub_updates();
        drop(rec);
        self.reclaim_if_empty(channel_name);
        Ok(())
    }

    /// Remove everything a disconnected client left behind.
    pub fn drop_session(&mut self, session: u64) {
        let doomed: Vec<(String, Vec<i32>, Vec<i32>)> = self
            .channels
            .values()
            .map(|ch| {
                (
                    ch.name.clone(),
                    ch.publishers
                        .iter()
                        .filter(|p| p.session == session)
                        .map(|p| p.id)
                        .collect::<Vec<_>>(),
                    ch.subscribers
                        .iter()
                        .filter(|s| s.session == session)
                        .map(|s| s.id)
                        .collect::<Vec<_>>(),
                )
            })
            .filter(|(_, pubs, subs)| !pubs.is_empty() || !subs.is_empty())
            .collect();

        for (name, pubs, subs) in doomed {
            for id in pubs {
                if let Err(err) = self.drop_publisher(&name, id) {
                    tracing::warn!(channel = %name, error = %err, "session cleanup");
                }
            }
            for id in subs {
                if let Err(err) = self.drop_subscriber(&name, id) {
                    tracing::warn!(channel = %name, error = %err, "session cleanup");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_are_reused_after_free() {
        let mut ids = ChannelIdAllocator::new();
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        assert_ne!(a, b);
        ids.free(a);
        assert_eq!(ids.allocate().unwrap(), a);
    }

    #[test]
    fn owner_ids_exhaust() {
        let mut owners = OwnerIdAllocator::new();
        for _ in 0..MAX_SLOT_OWNERS {
            assert!(owners.allocate().is_some());
        }
        assert!(owners.allocate().is_none());
        owners.free(17);
        assert_eq!(owners.allocate(), Some(17));
    }

    #[test]
    fn type_negotiation() {
        let mut ch = ServerChannel::new("/t", 0, String::new());
        assert_eq!(ch.negotiate_type("").unwrap(), "");
        assert_eq!(ch.negotiate_type("geo.Fix").unwrap(), "geo.Fix");
        assert_eq!(ch.negotiate_type("").unwrap(), "geo.Fix");
        assert_eq!(ch.negotiate_type("geo.Fix").unwrap(), "geo.Fix");
        assert!(ch.negotiate_type("imu.Sample").is_err());
    }

    #[test]
    fn reclaim_resets_counters() {
        let mut registry = Registry::new(Scb::create().unwrap());
        let id = {
            let ch = registry.channel_or_create("/gone", "").unwrap();
            ch.id
        };
        registry.scb.counters(id).bump_pub_updates();
        registry.reclaim_if_empty("/gone");
        assert!(registry.channels.is_empty());
        assert_eq!(registry.scb.counters(id).pub_updates(), 0);

        // The freed id is allocatable again.
        let ch = registry.channel_or_create("/new", "").unwrap();
        assert_eq!(ch.id, id);
    }
}
