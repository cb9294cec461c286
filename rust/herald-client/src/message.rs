//! Message views handed to applications.

/// A received message, borrowing the shared slot buffer directly.
///
/// Zero-copy: `data` points into the channel's buffer region. The slot
/// cannot be overwritten while this subscriber's reference pins it, and
/// the borrow ends before the subscriber can move on.
#[derive(Debug)]
pub struct Message<'a> {
    pub data: &'a [u8],
    pub ordinal: i64,
    /// Monotonic nanoseconds captured at activation.
    pub timestamp: u64,
}

impl Message<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What a publish produced.
#[derive(Debug, Clone, Copy)]
pub struct PublishInfo {
    pub ordinal: i64,
    pub timestamp: u64,
    pub message_size: usize,
}
