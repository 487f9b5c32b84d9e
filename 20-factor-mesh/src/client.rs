//! Client actor: submits one number and waits for the first factor.

use std::future::Future;

use anyhow::{Result, bail};
use tokio::select;
use tracing::{Instrument, debug, info, info_span};

use crate::{
    bignum::BigNum,
    group::{GroupChannel, MemberId, dispatch},
    protocol::{Inbound, Message, Outbound, Solution},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Send(Outbound),
    /// The first result for the submitted task. Emitted exactly once.
    Finished(Solution),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    member: MemberId,
    task: BigNum,
    outcome: Option<Solution>,
}

impl Client {
    pub fn new(member: MemberId, task: BigNum) -> Self {
        Self {
            member,
            task,
            outcome: None,
        }
    }

    pub fn task(&self) -> &BigNum {
        &self.task
    }

    pub fn outcome(&self) -> Option<&Solution> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn start(&self) -> Vec<ClientAction> {
        info!(member = self.member, task = %self.task, "sending task");
        vec![ClientAction::Send(Outbound::Broadcast(Message::Task {
            n: self.task.clone(),
        }))]
    }

    pub fn handle(&mut self, inbound: Inbound) -> Vec<ClientAction> {
        let Inbound { from, message } = inbound;
        match message {
            Message::IdlePoll if !self.is_finished() => {
                debug!(member = self.member, from, task = %self.task, "handing task to idle worker");
                vec![ClientAction::Send(Outbound::Reply {
                    to: from,
                    message: Message::Task {
                        n: self.task.clone(),
                    },
                })]
            }
            Message::Result(solution) if solution.task == self.task && !self.is_finished() => {
                info!(
                    member = self.member,
                    from,
                    task = %solution.task,
                    factor = %solution.factor,
                    "got result"
                );
                self.outcome = Some(solution.clone());
                vec![ClientAction::Finished(solution)]
            }
            Message::Result(solution) if solution.task == self.task => {
                debug!(member = self.member, from, "ignoring duplicate result");
                Vec::new()
            }
            Message::Result(solution) => {
                debug!(member = self.member, from, task = %solution.task, "ignoring result for another task");
                Vec::new()
            }
            Message::IdlePoll | Message::Task { .. } => Vec::new(),
        }
    }
}

/// Submits `task` and waits for its first result.
///
/// Returns `Ok(None)` when `shutdown` resolves first. A channel that closes
/// before any result arrives is an error.
pub async fn run_client<C, F>(channel: C, task: BigNum, shutdown: F) -> Result<Option<Solution>>
where
    C: GroupChannel,
    F: Future<Output = ()> + Send,
{
    let span = info_span!("client", member = channel.member(), task = %task);
    drive_client(channel, task, shutdown).instrument(span).await
}

async fn drive_client<C, F>(mut channel: C, task: BigNum, shutdown: F) -> Result<Option<Solution>>
where
    C: GroupChannel,
    F: Future<Output = ()> + Send,
{
    let mut client = Client::new(channel.member(), task);
    tokio::pin!(shutdown);

    let mut finished = perform(&mut channel, client.start()).await?;
    while finished.is_none() {
        let inbound = select! {
            biased;
            _ = &mut shutdown => break,
            inbound = channel.recv() => inbound,
        };
        let Some(inbound) = inbound else {
            bail!("group channel closed before task {} was solved", client.task());
        };
        finished = perform(&mut channel, client.handle(inbound)).await?;
    }

    channel.leave().await?;
    Ok(finished)
}

async fn perform<C: GroupChannel>(
    channel: &mut C,
    actions: Vec<ClientAction>,
) -> Result<Option<Solution>> {
    let mut finished = None;
    for action in actions {
        match action {
            ClientAction::Send(outbound) => dispatch(channel, outbound).await?,
            ClientAction::Finished(solution) => finished = Some(solution),
        }
    }
    Ok(finished)
}
