//! Agent-to-agent protocol for Switchboard.
//!
//! This module defines how agents talk to each other:
//! - Envelopes grouped by conversation and linked by causation
//! - The closed set of envelope types
//! - A registry resolving agent names to addresses
//! - A pluggable transport with an in-process implementation

pub mod bus;
pub mod envelope;
pub mod registry;
pub mod types;

pub use bus::{LocalBus, Transport};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use registry::{AgentRegistry, RegistryEntry};
pub use types::MessageType;
