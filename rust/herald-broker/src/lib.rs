//! The herald broker.
//!
//! One broker per host. It owns the control socket, allocates every
//! channel's shared memory and trigger objects, keeps the authoritative
//! participant roster, and publishes roster-version counters into the
//! system control block so clients can detect changes without asking.
//!
//! The data plane never passes through here: once a client holds the
//! descriptors from a `CreatePublisher`/`CreateSubscriber` response, it
//! talks shared memory directly.

pub mod handler;
pub mod registry;
pub mod server;

#[cfg(feature = "testing")]
pub mod testing;

pub use registry::Registry;
pub use server::{run, run_blocking, run_until};
