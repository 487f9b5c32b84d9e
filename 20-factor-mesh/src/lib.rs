//! Distributed integer factoring over a best-effort broadcast group.
//!
//! Clients broadcast numbers, workers race to factor them with Pollard's rho,
//! and the first worker to succeed broadcasts the answer. Idle workers poll
//! the group and get handed tasks by whoever currently holds one. There is no
//! coordinator state: duplicate work is tolerated and reconciled by the first
//! result.
//!
//! - [`bignum`] wraps arbitrary-precision integers and their wire encoding.
//! - [`kernel`] finds one nontrivial factor within a bounded effort.
//! - [`protocol`] defines the `Task` / `IdlePoll` / `Result` messages.
//! - [`group`] is the broadcast channel abstraction with TCP and in-process
//!   implementations.
//! - [`broker`] hosts groups for remote members (the `server` role).
//! - [`worker`] and [`client`] are the two actors, each a pure state machine
//!   plus an async driver.
//! - [`cli`] and [`lifecycle`] carry configuration and shutdown into the binary.
//!
//! Integration tests drive the real actors over [`group::LocalHub`] and over
//! TCP through the broker.

pub mod bignum;
pub mod broker;
pub mod cli;
pub mod client;
pub mod group;
pub mod kernel;
pub mod lifecycle;
pub mod protocol;
pub mod worker;
