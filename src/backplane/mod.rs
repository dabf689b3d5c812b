//! The `backplane` module connects nodes to each other.
//!
//! A [`Medium`] moves raw frames on named channels and comes in two
//! flavours: the in-process [`MemoryBus`] and the networked [`HubClient`],
//! which talks to a [`Hub`] relay. The [`BackplaneAdapter`] turns a medium
//! into envelope-level publish/subscribe plus presence announcements.

pub mod adapter;
pub mod backoff;
pub mod frame;
pub mod hub;
pub mod medium;
pub mod memory;
pub mod network;

pub use adapter::{BackplaneAdapter, EnvelopeHandler, EnvelopeSubscription};
pub use backoff::Backoff;
pub use hub::{Hub, HubHandle};
pub use medium::{Medium, Subscription};
pub use memory::{MemoryBackplane, MemoryBus};
pub use network::HubClient;

#[cfg(test)]
mod tests;
