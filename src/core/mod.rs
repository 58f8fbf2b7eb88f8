//! Relay runtime: assembly, lifecycle and the subscriber API.
//!
//! - [`builder`]: wires sources, outbox, detector and dispatcher;
//! - [`relay`]: spawns the pipeline tasks and performs grace-bounded shutdown;
//! - [`shutdown`]: termination signal handling.

mod builder;
mod relay;
mod shutdown;

pub use builder::RelayBuilder;
pub use relay::Relay;
pub use shutdown::wait_for_shutdown_signal;
