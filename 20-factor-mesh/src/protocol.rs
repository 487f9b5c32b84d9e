//! Messages exchanged between clients and workers over the group channel.
//!
//! Payloads travel as opaque JSON values inside the group frames, so the
//! broker never needs to understand them. Decoding happens at the receiving
//! actor, which drops anything it cannot parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::bignum::BigNum;
use crate::group::MemberId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Task assignment, either broadcast by a client or handed to an idle
    /// worker in reply to its poll.
    Task { n: BigNum },
    /// An idle worker asking any current task holder for work.
    IdlePoll,
    /// A factor was found for `task`.
    Result(Solution),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub task: BigNum,
    pub factor: BigNum,
    /// Milliseconds spent inside kernel slices.
    pub cpu_time: u64,
    /// Rho iterations across all slices.
    pub rho_cycles: u64,
}

impl Solution {
    /// `task / factor`, or zero for a malformed solution with a zero factor.
    pub fn cofactor(&self) -> BigNum {
        self.task.checked_div(&self.factor).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Message {
    pub fn to_payload(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(payload)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Task { .. } => "task",
            Message::IdlePoll => "idle_poll",
            Message::Result(_) => "result",
        }
    }
}

/// A message an actor wants to put on the group channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(Message),
    Reply { to: MemberId, message: Message },
}

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub from: MemberId,
    pub message: Message,
}
