//! Channel operations over the mapped control block and buffer region.
//!
//! A `Channel` is one process's view of a channel's two shared objects.
//! The broker constructs it with [`Channel::allocate`]; clients with
//! [`Channel::map`] after receiving the descriptors. Every operation that
//! touches slot lists, reference counts, owner bits or `next_ordinal` runs
//! under the CCB's robust mutex; buffer contents are protected by slot
//! ownership instead (a busy slot is written only by its publisher, an
//! active slot is immutable while referenced).

use core::mem::size_of;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr;

use crate::layout::{
    self, ChannelControlBlock, MAX_CHANNEL_NAME, MessagePrefix, MessageSlot, PREFIX_SIZE, SlotList,
    SlotListElement, prefix_flags,
};
use crate::mmap::MemfdRegion;
use crate::mutex::{LockRecovery, SharedMutex};

/// A participant's handle on one slot: the slot id plus the ordinal it
/// carried when the reference was taken. The ordinal disambiguates slot
/// reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub id: i32,
    pub ordinal: i64,
}

/// Result of activating a slot.
#[derive(Debug, Clone, Copy)]
pub struct PublishedMessage {
    /// Replacement slot for the publisher, if one could be acquired.
    pub new_slot: Option<i32>,
    /// Ordinal assigned to the published message.
    pub ordinal: i64,
    /// Monotonic timestamp assigned to the published message.
    pub timestamp: u64,
    /// Whether subscribers should be woken.
    pub notify: bool,
}

/// Where a slot currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotListKind {
    Active,
    Busy,
    Free,
    /// On no list — only ever seen if an invariant is broken.
    Orphaned,
}

/// Point-in-time copy of one slot's metadata, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub id: i32,
    pub list: SlotListKind,
    pub ref_count: i16,
    pub reliable_ref_count: i16,
    pub ordinal: i64,
    pub owner_count: u32,
}

/// Point-in-time copy of a channel's shared state, taken under the lock.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub next_ordinal: i64,
    pub total_bytes: i64,
    pub total_messages: i64,
    pub slots: Vec<SlotSnapshot>,
    /// Active-list ordinals in list order (front to back).
    pub active_ordinals: Vec<i64>,
}

/// One process's mapping of a channel.
#[derive(Debug)]
pub struct Channel {
    name: String,
    num_slots: i32,
    slot_size: i32,
    ccb: MemfdRegion,
    buffers: MemfdRegion,
}

// SAFETY: the mappings are shared across processes by design; everything
// mutable is guarded by the embedded robust mutex or by slot ownership.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    /// Create and initialize the shared objects for a new channel.
    /// Broker side.
    pub fn allocate(name: &str, slot_size: i32, num_slots: i32) -> io::Result<Self> {
        if slot_size <= 0 || num_slots <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "slot_size and num_slots must be positive",
            ));
        }
        let ccb_size = layout::ccb_size(num_slots as usize);
        let buffers_size = layout::buffers_size(num_slots as usize, slot_size as usize);
        if ccb_size > i32::MAX as usize || buffers_size > i32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel dimensions overflow offset arithmetic",
            ));
        }
        // Offset 0 is the list null sentinel; the header guarantees the
        // slot array never starts there.
        const { assert!(layout::slots_offset() != 0) };

        let ccb = MemfdRegion::create(&format!("herald-ccb.{name}"), ccb_size)?;
        let buffers = MemfdRegion::create(&format!("herald-buf.{name}"), buffers_size)?;

        let channel = Self {
            name: name.to_string(),
            num_slots,
            slot_size,
            ccb,
            buffers,
        };

        // SAFETY: freshly created mapping, no other process can see it yet.
        unsafe {
            let hdr = channel.hdr();
            let name_bytes = name.as_bytes();
            let copy_len = name_bytes.len().min(MAX_CHANNEL_NAME - 1);
            (*hdr).name = [0; MAX_CHANNEL_NAME];
            (&mut (*hdr).name)[..copy_len].copy_from_slice(&name_bytes[..copy_len]);
            (*hdr).num_slots = num_slots;
            (*hdr).slot_size = slot_size;
            (*hdr).next_ordinal = 0;
            (*hdr).total_bytes = 0;
            (*hdr).total_messages = 0;
            (*hdr).active_list = SlotList { first: 0, last: 0 };
            (*hdr).busy_list = SlotList { first: 0, last: 0 };
            (*hdr).free_list = SlotList { first: 0, last: 0 };
            (*hdr).lock_owner = -1;
            (*hdr).lock_owner_reliable = 0;
            SharedMutex::init(&raw mut (*hdr).lock)?;

            for id in 0..num_slots {
                let slot = channel.slot_ptr(id);
                (*slot).element = SlotListElement { prev: 0, next: 0 };
                (*slot).id = id;
                (*slot).ref_count = 0;
                (*slot).reliable_ref_count = 0;
                (*slot).ordinal = 0;
                (*slot).message_size = 0;
                (*slot).owners.clear_all();
                channel.list_push_back(&raw mut (*hdr).free_list, &raw mut (*slot).element);
            }
        }

        Ok(channel)
    }

    /// Map an existing channel from descriptors received over the control
    /// socket. Client side.
    pub fn map(name: &str, ccb_fd: OwnedFd, buffers_fd: OwnedFd) -> io::Result<Self> {
        let ccb = MemfdRegion::from_fd(ccb_fd)?;
        if ccb.len() < size_of::<ChannelControlBlock>() {
            return Err(bad_segment("control block smaller than its header"));
        }

        // SAFETY: length checked above; the header is plain data.
        let (num_slots, slot_size) = unsafe {
            let hdr = ccb.region().as_ptr() as *const ChannelControlBlock;
            ((*hdr).num_slots, (*hdr).slot_size)
        };
        if num_slots <= 0 || slot_size <= 0 {
            return Err(bad_segment("control block carries no slots"));
        }
        if ccb.len() != layout::ccb_size(num_slots as usize) {
            return Err(bad_segment("control block size disagrees with slot count"));
        }

        let buffers = MemfdRegion::from_fd(buffers_fd)?;
        if buffers.len() != layout::buffers_size(num_slots as usize, slot_size as usize) {
            return Err(bad_segment("buffer region size disagrees with control block"));
        }

        Ok(Self {
            name: name.to_string(),
            num_slots,
            slot_size,
            ccb,
            buffers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_slots(&self) -> i32 {
        self.num_slots
    }

    /// Payload bytes per slot, not counting the prefix.
    pub fn slot_size(&self) -> i32 {
        self.slot_size
    }

    /// Control-block descriptor, for handing to clients.
    pub fn ccb_fd(&self) -> BorrowedFd<'_> {
        self.ccb.fd()
    }

    /// Buffer-region descriptor, for handing to clients.
    pub fn buffers_fd(&self) -> BorrowedFd<'_> {
        self.buffers.fd()
    }

    // ------------------------------------------------------------------
    // Slot allocation and activation (publisher side)
    // ------------------------------------------------------------------

    /// Take a slot for filling.
    ///
    /// Prefers the free list, then the oldest unreferenced active slot.
    /// Reliable callers refuse to pass a slot that a reliable subscriber
    /// still references, so `None` is their backpressure signal; for
    /// unreliable callers `None` means the channel is truly out of slots.
    pub fn find_free_slot(&self, reliable: bool, owner: i32) -> io::Result<Option<i32>> {
        let _guard = self.lock(owner, reliable)?;
        // SAFETY: lock held.
        Ok(unsafe { self.find_free_slot_locked(reliable, owner, None) })
    }

    /// Publish the message in `slot_id` and try to take a replacement.
    ///
    /// The caller must own `slot_id` on the busy list and have written
    /// `message_size` payload bytes into its buffer. `omit_prefix` is for
    /// bridges that copied a pre-stamped prefix in with the payload.
    pub fn activate_slot_and_get_another(
        &self,
        slot_id: i32,
        message_size: i64,
        owner: i32,
        reliable: bool,
        is_activation: bool,
        omit_prefix: bool,
    ) -> io::Result<PublishedMessage> {
        let _guard = self.lock(owner, reliable)?;
        // SAFETY: lock held; slot_id is owned by the caller.
        unsafe {
            let hdr = self.hdr();
            let slot = self.slot_ptr(slot_id);

            let ordinal = (*hdr).next_ordinal;
            (*hdr).next_ordinal += 1;
            let timestamp = monotonic_ns();

            (*slot).ordinal = ordinal;
            (*slot).message_size = message_size;

            if !omit_prefix {
                let prefix = self.prefix_ptr(slot_id);
                (*prefix).message_size = message_size as i32;
                (*prefix).ordinal = ordinal;
                (*prefix).timestamp = timestamp;
                (*prefix).flags = if is_activation {
                    prefix_flags::ACTIVATE
                } else {
                    0
                };
            }

            (*hdr).total_bytes += message_size;
            (*hdr).total_messages += 1;

            // Ordinals are assigned under this lock, so appending keeps the
            // active list sorted.
            self.list_remove(&raw mut (*hdr).busy_list, &raw mut (*slot).element);
            (*slot).owners.clear(owner as usize);
            self.list_push_back(&raw mut (*hdr).active_list, &raw mut (*slot).element);

            // The replacement hunt must not take back the slot we just
            // activated, or the newest message on a tightly-sized channel
            // could never be read. A caller that gets nothing re-hunts on
            // its next publish attempt, by which time subscribers may have
            // moved their references along.
            let new_slot = self.find_free_slot_locked(reliable, owner, Some(slot_id));

            Ok(PublishedMessage {
                new_slot,
                ordinal,
                timestamp,
                notify: true,
            })
        }
    }

    // ------------------------------------------------------------------
    // Slot selection (subscriber side)
    // ------------------------------------------------------------------

    /// Move to the oldest message newer than the one currently held, or to
    /// the front of the active list if nothing is held. Returns `None`
    /// (ownership unchanged) when there is nothing newer.
    pub fn next_slot(
        &self,
        current: Option<SlotRef>,
        reliable: bool,
        owner: i32,
    ) -> io::Result<Option<SlotRef>> {
        let _guard = self.lock(owner, reliable)?;
        // SAFETY: lock held.
        unsafe {
            // If the held ordinal left the active list (slot reused), the
            // search below lands on the oldest surviving message.
            let threshold = current.map(|c| c.ordinal).unwrap_or(i64::MIN);

            let hdr = self.hdr();
            let mut off = (*hdr).active_list.first;
            let mut target: *mut MessageSlot = ptr::null_mut();
            while off != 0 {
                let slot = self.elem_at(off) as *mut MessageSlot;
                if (*slot).ordinal > threshold {
                    target = slot;
                    break;
                }
                off = (*slot).element.next;
            }

            Ok(self.take_ref_locked(current, target, reliable, owner))
        }
    }

    /// Move to the newest active message. Returns `None` (ownership
    /// unchanged) when the list is empty or the newest is already held.
    pub fn last_slot(
        &self,
        current: Option<SlotRef>,
        reliable: bool,
        owner: i32,
    ) -> io::Result<Option<SlotRef>> {
        let _guard = self.lock(owner, reliable)?;
        // SAFETY: lock held.
        unsafe {
            let hdr = self.hdr();
            let last = (*hdr).active_list.last;
            let mut target: *mut MessageSlot = ptr::null_mut();
            if last != 0 {
                let slot = self.elem_at(last) as *mut MessageSlot;
                let already_held =
                    current.is_some_and(|c| c.id == (*slot).id && c.ordinal == (*slot).ordinal);
                if !already_held {
                    target = slot;
                }
            }

            Ok(self.take_ref_locked(current, target, reliable, owner))
        }
    }

    /// Search the active list for the message with exactly this timestamp.
    /// On a hit, ownership moves to the found slot; on a miss nothing
    /// changes. `scratch` is caller-supplied so rare searches allocate
    /// nothing per call.
    pub fn find_slot_by_timestamp(
        &self,
        current: Option<SlotRef>,
        timestamp: u64,
        reliable: bool,
        owner: i32,
        scratch: &mut Vec<(i32, u64)>,
    ) -> io::Result<Option<SlotRef>> {
        let _guard = self.lock(owner, reliable)?;
        // SAFETY: lock held.
        unsafe {
            scratch.clear();
            let hdr = self.hdr();
            let mut off = (*hdr).active_list.first;
            while off != 0 {
                let slot = self.elem_at(off) as *mut MessageSlot;
                let prefix = self.prefix_ptr((*slot).id);
                scratch.push(((*slot).id, (*prefix).timestamp));
                off = (*slot).element.next;
            }

            // Timestamps are taken under the same lock as ordinals, so the
            // snapshot is sorted and binary search applies.
            let target = match scratch.binary_search_by(|&(_, ts)| ts.cmp(&timestamp)) {
                Ok(idx) => self.slot_ptr(scratch[idx].0),
                Err(_) => ptr::null_mut(),
            };

            Ok(self.take_ref_locked(current, target, reliable, owner))
        }
    }

    // ------------------------------------------------------------------
    // Participant cleanup
    // ------------------------------------------------------------------

    /// Remove every trace of a departed participant: clear its owner bits,
    /// drop the references they represented, and return any slot it was
    /// filling to the free list.
    pub fn cleanup_owner(&self, owner: i32, reliable: bool) -> io::Result<()> {
        let _guard = self.lock(owner, reliable)?;
        // SAFETY: lock held.
        unsafe { self.cleanup_owner_locked(owner, reliable) };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffer access
    // ------------------------------------------------------------------

    /// Pointer to the payload bytes of a slot (just past the prefix).
    pub fn payload_ptr(&self, slot_id: i32) -> *mut u8 {
        assert!(slot_id >= 0 && slot_id < self.num_slots, "slot out of range");
        let off = layout::buffer_stride(self.slot_size as usize) * slot_id as usize + PREFIX_SIZE;
        self.buffers.region().offset(off)
    }

    /// Mutable payload view of a busy slot.
    ///
    /// # Safety
    ///
    /// The caller must own `slot_id` on the busy list; nothing else may
    /// read or write the buffer until activation.
    pub unsafe fn payload_mut<'a>(&'a self, slot_id: i32) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(slot_id), self.slot_size as usize) }
    }

    /// Payload view of an active slot.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference on `slot_id` (so it cannot be
    /// re-acquired and rewritten).
    pub unsafe fn payload<'a>(&'a self, slot_id: i32, len: usize) -> &'a [u8] {
        let len = len.min(self.slot_size as usize);
        unsafe { std::slice::from_raw_parts(self.payload_ptr(slot_id), len) }
    }

    /// Copy of a slot's message prefix. Valid for slots the caller holds a
    /// reference on.
    pub fn prefix(&self, slot_id: i32) -> MessagePrefix {
        // SAFETY: the prefix of a referenced slot is immutable.
        unsafe { *self.prefix_ptr(slot_id) }
    }

    /// Message size recorded for a slot the caller holds.
    pub fn slot_message_size(&self, slot_id: i32) -> i64 {
        assert!(slot_id >= 0 && slot_id < self.num_slots, "slot out of range");
        // SAFETY: plain read of caller-held slot metadata.
        unsafe { (*self.slot_ptr(slot_id)).message_size }
    }

    /// Current reference count of a slot. Diagnostic only.
    pub fn slot_ref_count(&self, slot_id: i32) -> i16 {
        assert!(slot_id >= 0 && slot_id < self.num_slots, "slot out of range");
        // SAFETY: plain read, diagnostic accuracy only.
        unsafe { (*self.slot_ptr(slot_id)).ref_count }
    }

    /// Channel statistics: `(total_bytes, total_messages)`.
    pub fn counters(&self) -> io::Result<(i64, i64)> {
        let _guard = self.lock(-1, false)?;
        // SAFETY: lock held.
        unsafe {
            let hdr = self.hdr();
            Ok(((*hdr).total_bytes, (*hdr).total_messages))
        }
    }

    /// Consistent copy of the channel's shared state.
    pub fn snapshot(&self) -> io::Result<ChannelSnapshot> {
        let _guard = self.lock(-1, false)?;
        // SAFETY: lock held.
        unsafe {
            let hdr = self.hdr();
            let mut slots = Vec::with_capacity(self.num_slots as usize);
            for id in 0..self.num_slots {
                let slot = self.slot_ptr(id);
                let list = if self.list_contains(&raw const (*hdr).active_list, slot) {
                    SlotListKind::Active
                } else if self.list_contains(&raw const (*hdr).busy_list, slot) {
                    SlotListKind::Busy
                } else if self.list_contains(&raw const (*hdr).free_list, slot) {
                    SlotListKind::Free
                } else {
                    SlotListKind::Orphaned
                };
                slots.push(SlotSnapshot {
                    id,
                    list,
                    ref_count: (*slot).ref_count,
                    reliable_ref_count: (*slot).reliable_ref_count,
                    ordinal: (*slot).ordinal,
                    owner_count: (*slot).owners.count(),
                });
            }

            let mut active_ordinals = Vec::new();
            let mut off = (*hdr).active_list.first;
            while off != 0 {
                let slot = self.elem_at(off) as *mut MessageSlot;
                active_ordinals.push((*slot).ordinal);
                off = (*slot).element.next;
            }

            Ok(ChannelSnapshot {
                next_ordinal: (*hdr).next_ordinal,
                total_bytes: (*hdr).total_bytes,
                total_messages: (*hdr).total_messages,
                slots,
                active_ordinals,
            })
        }
    }

    /// Take the CCB lock and leak it, the way a crashing participant
    /// would. Call from a thread that then exits.
    #[doc(hidden)]
    pub fn seize_lock_and_abandon(&self, owner: i32, reliable: bool) -> io::Result<()> {
        let guard = self.lock(owner, reliable)?;
        std::mem::forget(guard);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn hdr(&self) -> *mut ChannelControlBlock {
        self.ccb.region().as_ptr() as *mut ChannelControlBlock
    }

    fn slot_ptr(&self, id: i32) -> *mut MessageSlot {
        debug_assert!(id >= 0 && id < self.num_slots);
        let off = layout::slots_offset() + id as usize * size_of::<MessageSlot>();
        self.ccb.region().offset(off) as *mut MessageSlot
    }

    fn prefix_ptr(&self, slot_id: i32) -> *mut MessagePrefix {
        let off = layout::buffer_stride(self.slot_size as usize) * slot_id as usize;
        self.buffers.region().offset(off) as *mut MessagePrefix
    }

    fn elem_at(&self, off: i32) -> *mut SlotListElement {
        self.ccb.region().offset(off as usize) as *mut SlotListElement
    }

    fn elem_offset(&self, elem: *mut SlotListElement) -> i32 {
        (elem as usize - self.ccb.region().as_ptr() as usize) as i32
    }

    /// Lock the CCB, recovering shared state if the previous holder died
    /// inside its critical section.
    fn lock(&self, owner: i32, reliable: bool) -> io::Result<CcbGuard<'_>> {
        // SAFETY: the header lives for as long as self.
        let mutex = unsafe { &(*self.hdr()).lock };
        match mutex.lock()? {
            LockRecovery::Clean => {}
            LockRecovery::OwnerDied => {
                // SAFETY: we hold the lock (in inconsistent state).
                unsafe {
                    let hdr = self.hdr();
                    let dead = (*hdr).lock_owner;
                    let dead_reliable = (*hdr).lock_owner_reliable != 0;
                    tracing::warn!(
                        channel = %self.name,
                        dead_owner = dead,
                        "recovering channel lock from dead participant"
                    );
                    if dead >= 0 {
                        self.cleanup_owner_locked(dead, dead_reliable);
                    }
                }
                mutex.make_consistent()?;
            }
        }
        // SAFETY: lock held.
        unsafe {
            let hdr = self.hdr();
            (*hdr).lock_owner = owner;
            (*hdr).lock_owner_reliable = reliable as i32;
        }
        Ok(CcbGuard { channel: self })
    }

    /// Core slot hunt. Caller holds the lock. `exclude` shields one slot
    /// from the active-list scan (the one an activation just appended).
    unsafe fn find_free_slot_locked(
        &self,
        reliable: bool,
        owner: i32,
        exclude: Option<i32>,
    ) -> Option<i32> {
        unsafe {
            let hdr = self.hdr();

            let slot: *mut MessageSlot = if (*hdr).free_list.first != 0 {
                let elem = self.elem_at((*hdr).free_list.first);
                self.list_remove(&raw mut (*hdr).free_list, elem);
                elem as *mut MessageSlot
            } else {
                // Hunt the oldest unreferenced active slot. A reliable
                // publisher must not pass a slot a reliable subscriber
                // still references — that reference is the backpressure.
                let mut candidate: *mut MessageSlot = ptr::null_mut();
                let mut off = (*hdr).active_list.first;
                while off != 0 {
                    let slot = self.elem_at(off) as *mut MessageSlot;
                    if exclude != Some((*slot).id) {
                        if (*slot).ref_count == 0 {
                            candidate = slot;
                            break;
                        }
                        if reliable && (*slot).reliable_ref_count > 0 {
                            break;
                        }
                    }
                    off = (*slot).element.next;
                }
                if candidate.is_null() {
                    return None;
                }
                self.list_remove(&raw mut (*hdr).active_list, &raw mut (*candidate).element);
                candidate
            };

            (*slot).owners.clear_all();
            (*slot).owners.set(owner as usize);
            (*slot).ref_count = 0;
            (*slot).reliable_ref_count = 0;
            (*slot).ordinal = 0;
            (*slot).message_size = 0;
            self.list_push_back(&raw mut (*hdr).busy_list, &raw mut (*slot).element);
            Some((*slot).id)
        }
    }

    /// Swap the caller's reference from `current` to `target`. A null
    /// `target` leaves ownership untouched and returns `None`. Caller
    /// holds the lock.
    unsafe fn take_ref_locked(
        &self,
        current: Option<SlotRef>,
        target: *mut MessageSlot,
        reliable: bool,
        owner: i32,
    ) -> Option<SlotRef> {
        unsafe {
            if target.is_null() {
                return None;
            }
            if let Some(cur) = current {
                self.release_ref_locked(cur, reliable, owner);
            }
            (*target).ref_count += 1;
            if reliable {
                (*target).reliable_ref_count += 1;
            }
            (*target).owners.set(owner as usize);
            Some(SlotRef {
                id: (*target).id,
                ordinal: (*target).ordinal,
            })
        }
    }

    unsafe fn release_ref_locked(&self, cur: SlotRef, reliable: bool, owner: i32) {
        if cur.id < 0 || cur.id >= self.num_slots {
            return;
        }
        unsafe {
            let slot = self.slot_ptr(cur.id);
            if !(*slot).owners.contains(owner as usize) {
                // Already swept (participant cleanup raced us out).
                return;
            }
            (*slot).owners.clear(owner as usize);
            if (*slot).ref_count > 0 {
                (*slot).ref_count -= 1;
            }
            if reliable && (*slot).reliable_ref_count > 0 {
                (*slot).reliable_ref_count -= 1;
            }
        }
    }

    /// Owner sweep. Caller holds the lock.
    unsafe fn cleanup_owner_locked(&self, owner: i32, reliable: bool) {
        unsafe {
            let hdr = self.hdr();
            for id in 0..self.num_slots {
                let slot = self.slot_ptr(id);
                if !(*slot).owners.contains(owner as usize) {
                    continue;
                }
                (*slot).owners.clear(owner as usize);

                if self.list_contains(&raw const (*hdr).busy_list, slot) {
                    // The departed participant was filling this slot; the
                    // in-flight message is lost.
                    self.list_remove(&raw mut (*hdr).busy_list, &raw mut (*slot).element);
                    (*slot).ref_count = 0;
                    (*slot).reliable_ref_count = 0;
                    (*slot).ordinal = 0;
                    (*slot).message_size = 0;
                    self.list_push_back(&raw mut (*hdr).free_list, &raw mut (*slot).element);
                } else {
                    if (*slot).ref_count > 0 {
                        (*slot).ref_count -= 1;
                    }
                    if reliable && (*slot).reliable_ref_count > 0 {
                        (*slot).reliable_ref_count -= 1;
                    }
                }
            }
        }
    }

    unsafe fn list_contains(&self, list: *const SlotList, slot: *mut MessageSlot) -> bool {
        unsafe {
            let target = self.elem_offset(&raw mut (*slot).element);
            let mut off = (*list).first;
            while off != 0 {
                if off == target {
                    return true;
                }
                off = (*self.elem_at(off)).next;
            }
            false
        }
    }

    unsafe fn list_push_back(&self, list: *mut SlotList, elem: *mut SlotListElement) {
        unsafe {
            let off = self.elem_offset(elem);
            (*elem).prev = 0;
            (*elem).next = 0;
            if (*list).last == 0 {
                (*list).first = off;
                (*list).last = off;
            } else {
                let last = self.elem_at((*list).last);
                (*last).next = off;
                (*elem).prev = (*list).last;
                (*list).last = off;
            }
        }
    }

    unsafe fn list_remove(&self, list: *mut SlotList, elem: *mut SlotListElement) {
        unsafe {
            if (*elem).prev == 0 {
                (*list).first = (*elem).next;
            } else {
                (*self.elem_at((*elem).prev)).next = (*elem).next;
            }
            if (*elem).next == 0 {
                (*list).last = (*elem).prev;
            } else {
                (*self.elem_at((*elem).next)).prev = (*elem).prev;
            }
            (*elem).prev = 0;
            (*elem).next = 0;
        }
    }
}

/// Holds the CCB lock; resets the holder stamp and unlocks on drop.
struct CcbGuard<'a> {
    channel: &'a Channel,
}

impl Drop for CcbGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the lock.
        unsafe {
            let hdr = self.channel.hdr();
            (*hdr).lock_owner = -1;
            (*hdr).lock_owner_reliable = 0;
            (&(*hdr).lock).unlock();
        }
    }
}

pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into the provided timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn bad_segment(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
