//! Request/reply over the broker.
//!
//! A server registers an [`RpcHandler`] which consumes the queue
//! `rpc_{actor id}_{request tag}`. A caller's [`RpcClient`] publishes to that queue with
//! a private reply queue and a fresh correlation id, then waits for the matching reply.
//! Failures on the server travel back as a [`HandlingError`](crate::entities::HandlingError)
//! payload on the same reply path.

mod client;
mod handler;

pub use client::RpcClient;
pub use handler::{RpcEvent, RpcHandler};

#[cfg(test)]
#[path = "mod.test.rs"]
mod tests;
