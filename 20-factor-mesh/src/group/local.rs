use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{GroupChannel, MemberId};
use crate::protocol::{Inbound, Message};

/// An in-process group. Cloning the hub shares the same membership.
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    next_id: MemberId,
    members: HashMap<MemberId, mpsc::UnboundedSender<(MemberId, Value)>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self) -> LocalChannel {
        let (tx, inbox) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let member = state.next_id;
        state.members.insert(member, tx);
        LocalChannel {
            member,
            hub: self.clone(),
            inbox,
        }
    }

    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    /// Delivers a raw payload as if `from` had broadcast it. Lets tests put
    /// bytes on the channel that no well-behaved member would produce.
    pub fn publish_raw(&self, from: MemberId, payload: Value) {
        self.route(from, None, payload);
    }

    fn route(&self, from: MemberId, to: Option<MemberId>, payload: Value) {
        let mut state = self.lock();
        match to {
            Some(to) => match state.members.get(&to) {
                Some(tx) => {
                    let _ = tx.send((from, payload));
                }
                None => debug!(from, to, "dropping reply to departed member"),
            },
            None => {
                state.members.retain(|&id, tx| {
                    id == from || tx.send((from, payload.clone())).is_ok()
                });
            }
        }
    }

    fn remove(&self, member: MemberId) {
        self.lock().members.remove(&member);
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct LocalChannel {
    member: MemberId,
    hub: LocalHub,
    inbox: mpsc::UnboundedReceiver<(MemberId, Value)>,
}

impl GroupChannel for LocalChannel {
    fn member(&self) -> MemberId {
        self.member
    }

    async fn broadcast(&mut self, message: &Message) -> Result<()> {
        self.hub.route(self.member, None, message.to_payload()?);
        Ok(())
    }

    async fn reply(&mut self, to: MemberId, message: &Message) -> Result<()> {
        self.hub.route(self.member, Some(to), message.to_payload()?);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Inbound> {
        loop {
            let (from, payload) = self.inbox.recv().await?;
            match Message::from_payload(payload) {
                Ok(message) => return Some(Inbound { from, message }),
                Err(err) => warn!(member = self.member, from, error = %err, "dropping undecodable message"),
            }
        }
    }

    async fn leave(self) -> Result<()> {
        self.hub.remove(self.member);
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.hub.remove(self.member);
    }
}
