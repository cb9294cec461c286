//! Shared-memory layout of a channel.
//!
//! A channel owns two shared objects: the channel control block (header
//! plus an inline array of message slots) and the buffer region (one
//! fixed-size stride per slot, each beginning with a 32-byte message
//! prefix). Everything that links slots together uses byte offsets from
//! the CCB base — the block is mapped at a different address in every
//! process, so pointers are forbidden. Offset 0 is the null sentinel.

use core::mem::{align_of, size_of};

use crate::bitset::OwnerBitset;
use crate::mutex::SharedMutex;

/// Bytes of channel name stored in the CCB for debugger visibility.
/// Longer names are truncated here; the full name stays in process memory.
pub const MAX_CHANNEL_NAME: usize = 64;

/// Size of the message prefix preceding every slot buffer.
pub const PREFIX_SIZE: usize = size_of::<MessagePrefix>();

/// Flags carried in [`MessagePrefix::flags`].
pub mod prefix_flags {
    /// Synthetic activation message from a reliable publisher.
    pub const ACTIVATE: u64 = 1;
    /// Message was injected by a bridge.
    pub const BRIDGED: u64 = 2;
    /// Message has been seen.
    pub const SEEN: u64 = 4;
}

/// Header immediately preceding every slot buffer.
///
/// Bytes 4..32 are a frozen wire binding: a bridge forwards the prefix
/// starting at `message_size` over a byte stream whose framing writes the
/// length into `padding` in place. Do not reorder or resize the fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MessagePrefix {
    /// Reserved for a bridge to stamp a frame length in place.
    pub padding: i32,
    pub message_size: i32,
    pub ordinal: i64,
    pub timestamp: u64,
    pub flags: u64,
}

const _: () = assert!(size_of::<MessagePrefix>() == 32);

/// Doubly-linked list element embedded at offset 0 of every slot.
/// `prev`/`next` are CCB-relative byte offsets; 0 terminates.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SlotListElement {
    pub prev: i32,
    pub next: i32,
}

/// Head of an intrusive slot list. `first`/`last` are CCB-relative byte
/// offsets; 0 means empty.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SlotList {
    pub first: i32,
    pub last: i32,
}

/// Metadata for one message slot. Always a member of exactly one of the
/// channel's three lists.
#[repr(C)]
pub struct MessageSlot {
    pub element: SlotListElement,
    /// Slot id in `[0, num_slots)`.
    pub id: i32,
    /// Subscribers currently referring to this slot.
    pub ref_count: i16,
    /// Reliable subscribers among them. Never exceeds `ref_count`.
    pub reliable_ref_count: i16,
    /// Ordinal of the message currently held.
    pub ordinal: i64,
    /// Size of the message currently held.
    pub message_size: i64,
    /// One bit per participant currently pointing at this slot.
    pub owners: OwnerBitset,
}

const _: () = assert!(size_of::<MessageSlot>() == 32 + size_of::<OwnerBitset>());

/// The channel control block. Mapped by the broker and every participant.
#[repr(C)]
pub struct ChannelControlBlock {
    /// Truncated channel name, for hexdumps and debuggers.
    pub name: [u8; MAX_CHANNEL_NAME],
    pub num_slots: i32,
    /// Slot size in bytes, not counting the message prefix.
    pub slot_size: i32,
    /// Next ordinal to assign. Strictly exceeds every active ordinal.
    pub next_ordinal: i64,
    pub total_bytes: i64,
    pub total_messages: i64,
    /// Slots carrying published messages, ascending by ordinal.
    pub active_list: SlotList,
    /// Slots currently allocated to publishers.
    pub busy_list: SlotList,
    /// Slots on neither of the above.
    pub free_list: SlotList,
    /// Participant id of the current lock holder, -1 when unheld.
    /// Consulted when the robust mutex reports a dead owner.
    pub lock_owner: i32,
    /// Whether the current lock holder is a reliable participant.
    pub lock_owner_reliable: i32,
    pub lock: SharedMutex,
}

/// Byte offset of the slot array within the CCB mapping.
///
/// Nonzero by construction (the header precedes it), which keeps offset 0
/// free as the list null sentinel; [`crate::channel::Channel`] asserts this
/// at init time.
pub const fn slots_offset() -> usize {
    align_up(size_of::<ChannelControlBlock>(), align_of::<MessageSlot>())
}

/// Total CCB size for a slot count.
pub const fn ccb_size(num_slots: usize) -> usize {
    slots_offset() + num_slots * size_of::<MessageSlot>()
}

/// Distance between consecutive slot buffers: prefix plus payload rounded
/// up to a 32-byte boundary.
pub const fn buffer_stride(slot_size: usize) -> usize {
    PREFIX_SIZE + align32(slot_size)
}

/// Total buffer-region size for a channel.
pub const fn buffers_size(num_slots: usize, slot_size: usize) -> usize {
    num_slots * buffer_stride(slot_size)
}

/// Round up to a 32-byte boundary.
pub const fn align32(v: usize) -> usize {
    align_up(v, 32)
}

const fn align_up(v: usize, align: usize) -> usize {
    (v + (align - 1)) & !(align - 1)
}
