//! Best-effort broadcast groups.
//!
//! A member joins a named group and can then broadcast to every other member
//! or reply to one member it heard from. There are no join/leave
//! notifications and no delivery or ordering guarantees; the protocol built
//! on top has to tolerate silent loss and peers that come and go.
//!
//! - [`wire`] defines the JSON line frames spoken between members and the broker.
//! - [`tcp`] joins a group hosted by a remote [`crate::broker::Broker`].
//! - [`local`] is an in-process hub with the same semantics.

pub mod local;
pub mod tcp;
pub mod wire;

use std::future::Future;

use anyhow::Result;
use tracing::debug;

use crate::protocol::{Inbound, Message, Outbound};

pub type MemberId = u64;

pub use local::{LocalChannel, LocalHub};
pub use tcp::TcpGroupChannel;

pub trait GroupChannel: Send {
    /// Identity assigned by the group on join. Used as the reply address.
    fn member(&self) -> MemberId;

    /// Sends to every other current member.
    fn broadcast(&mut self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    /// Sends to a single member. Dropped silently if it has left.
    fn reply(
        &mut self,
        to: MemberId,
        message: &Message,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Next decodable message from a peer. `None` once the channel is closed.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    fn recv(&mut self) -> impl Future<Output = Option<Inbound>> + Send;

    fn leave(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

/// Puts an actor's outbound message on the channel.
pub async fn dispatch<C: GroupChannel>(channel: &mut C, outbound: Outbound) -> Result<()> {
    match outbound {
        Outbound::Broadcast(message) => {
            debug!(member = channel.member(), kind = message.kind(), "broadcasting");
            channel.broadcast(&message).await
        }
        Outbound::Reply { to, message } => {
            debug!(member = channel.member(), to, kind = message.kind(), "replying");
            channel.reply(to, &message).await
        }
    }
}
