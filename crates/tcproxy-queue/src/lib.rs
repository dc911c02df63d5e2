//! # tcproxy-queue
//!
//! Everything that talks to the queue:
//! - the [`Coordinator`] seam the reclaimer is written against
//! - Hawk / Bearer request signing shared with the proxy
//! - [`QueueClient`], the reqwest implementation of the coordinator

mod client;
mod coordinator;
pub mod hawk;

pub use client::QueueClient;
pub use coordinator::{Coordinator, QueueError, Reclaim};
pub use hawk::{authorization_header, HawkRequest};
