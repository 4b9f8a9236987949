//! promise-bridge
//!
//! Lets a single-threaded, non-reentrant script interpreter call functions
//! implemented by an event-loop host, including functions that complete
//! asynchronously. See [`Bridge`] for the host-side API and [`HostHandle`] for
//! a ready-made Tokio host.

mod runtime;

pub use runtime::*;
