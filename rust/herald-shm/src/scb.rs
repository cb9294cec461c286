//! System control block: the broker's global roster-version table.
//!
//! One shared object per broker, mapped read-only in spirit by every
//! client. Only the broker stores to it, so no lock is needed; the counters
//! are atomics to give cross-process loads and stores defined behaviour.
//! Clients compare the update counters against a cached copy to learn that
//! a channel's roster changed without a control-socket round trip.

use core::mem::size_of;
use core::sync::atomic::{AtomicU16, Ordering};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::mmap::MemfdRegion;

/// Capacity of the channel table. Channel ids live in `[0, MAX_CHANNELS)`.
pub const MAX_CHANNELS: usize = 1024;

/// Per-channel roster counters. 12 bytes of payload, padded to 16.
#[repr(C)]
pub struct ChannelCounters {
    pub num_pub_updates: AtomicU16,
    pub num_sub_updates: AtomicU16,
    pub num_pubs: AtomicU16,
    pub num_reliable_pubs: AtomicU16,
    pub num_subs: AtomicU16,
    pub num_reliable_subs: AtomicU16,
    _pad: [u16; 2],
}

const _: () = assert!(size_of::<ChannelCounters>() == 16);

impl ChannelCounters {
    /// Record a publisher roster change (create or remove).
    pub fn bump_pub_updates(&self) {
        self.num_pub_updates.fetch_add(1, Ordering::Release);
    }

    /// Record a subscriber roster change (create or remove).
    pub fn bump_sub_updates(&self) {
        self.num_sub_updates.fetch_add(1, Ordering::Release);
    }

    pub fn pub_updates(&self) -> u16 {
        self.num_pub_updates.load(Ordering::Acquire)
    }

    pub fn sub_updates(&self) -> u16 {
        self.num_sub_updates.load(Ordering::Acquire)
    }

    /// Adjust the live publisher counts. Broker only.
    pub fn add_pub(&self, reliable: bool, delta: i16) {
        add(&self.num_pubs, delta);
        if reliable {
            add(&self.num_reliable_pubs, delta);
        }
    }

    /// Adjust the live subscriber counts. Broker only.
    pub fn add_sub(&self, reliable: bool, delta: i16) {
        add(&self.num_subs, delta);
        if reliable {
            add(&self.num_reliable_subs, delta);
        }
    }

    /// Zero every counter. Used when a channel id is reused.
    pub fn reset(&self) {
        self.num_pub_updates.store(0, Ordering::Release);
        self.num_sub_updates.store(0, Ordering::Release);
        self.num_pubs.store(0, Ordering::Release);
        self.num_reliable_pubs.store(0, Ordering::Release);
        self.num_subs.store(0, Ordering::Release);
        self.num_reliable_subs.store(0, Ordering::Release);
    }
}

fn add(counter: &AtomicU16, delta: i16) {
    counter.fetch_add(delta as u16, Ordering::Release);
}

/// The whole table: `MAX_CHANNELS` counter records.
#[repr(C)]
pub struct SystemControlBlock {
    pub counters: [ChannelCounters; MAX_CHANNELS],
}

const _: () = assert!(size_of::<SystemControlBlock>() == MAX_CHANNELS * 16);

/// A mapped system control block.
#[derive(Debug)]
pub struct Scb {
    map: MemfdRegion,
}

impl Scb {
    /// Create and zero the table. Broker side.
    pub fn create() -> io::Result<Self> {
        let map = MemfdRegion::create("herald-scb", size_of::<SystemControlBlock>())?;
        Ok(Self { map })
    }

    /// Map the table from a descriptor received during `Init`.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let map = MemfdRegion::from_fd(fd)?;
        if map.len() < size_of::<SystemControlBlock>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "system control block too small",
            ));
        }
        Ok(Self { map })
    }

    /// Counter record for a channel id.
    pub fn counters(&self, channel_id: usize) -> &ChannelCounters {
        assert!(channel_id < MAX_CHANNELS, "channel id out of range");
        // SAFETY: the mapping covers the whole table (checked at map time)
        // and ChannelCounters is all atomics.
        unsafe {
            let scb = &*(self.map.region().as_ptr() as *const SystemControlBlock);
            &scb.counters[channel_id]
        }
    }

    /// The backing descriptor, for the `Init` response.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.map.fd()
    }
}
