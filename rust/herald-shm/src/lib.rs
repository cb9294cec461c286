//! Shared-memory channel substrate for the herald pub/sub bus.
//!
//! A channel is two shared objects plus a discipline for using them:
//!
//! - the **channel control block** (CCB): a header with three intrusive,
//!   offset-linked slot lists (active, busy, free) and a robust
//!   process-shared mutex, followed by an inline array of message slots;
//! - the **buffer region**: one fixed-size stride per slot, each beginning
//!   with a 32-byte message prefix that bridges forward verbatim.
//!
//! Publishers fill a busy slot they own exclusively, then move it to the
//! active list under the lock and take a new one. Subscribers walk the
//! active list, pinning slots with reference counts. The broker-global
//! [`scb::Scb`] table lets everyone detect roster changes without a
//! control-socket round trip, and [`trigger`] objects carry wakeups
//! between processes as plain file descriptors.
//!
//! This crate is the data plane only. Who maps what, and when, is decided
//! by the broker and client crates.

pub mod bitset;
pub mod channel;
pub mod layout;
pub mod mmap;
pub mod mutex;
pub mod region;
pub mod scb;
pub mod trigger;

pub use bitset::{MAX_SLOT_OWNERS, OwnerBitset};
pub use channel::{
    Channel, ChannelSnapshot, PublishedMessage, SlotListKind, SlotRef, SlotSnapshot,
};
pub use layout::{
    ChannelControlBlock, MAX_CHANNEL_NAME, MessagePrefix, MessageSlot, PREFIX_SIZE, prefix_flags,
};
pub use mmap::MemfdRegion;
pub use mutex::{LockRecovery, SharedMutex};
pub use region::Region;
pub use scb::{ChannelCounters, MAX_CHANNELS, Scb, SystemControlBlock};
pub use trigger::TriggerPair;
