// src/rpc/mod.rs

//! The mailbox protocol: servers executing calls, clients submitting them.

pub mod client;
pub(crate) mod fault;
pub mod server;

pub use client::{call_once, Client, ONE_SHOT_TIMEOUT};
pub use server::{Handler, Rejected, Server, ServerRef, Submission};
