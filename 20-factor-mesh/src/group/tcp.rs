use std::io;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    GroupChannel, MemberId,
    wire::{BrokerToMember, MemberToBroker, read_frame, write_frame},
};
use crate::protocol::{Inbound, Message};

/// Membership in a group hosted by a remote broker.
///
/// A background task reads frames off the socket and queues deliveries, so
/// [`GroupChannel::recv`] only ever waits on an mpsc receiver.
pub struct TcpGroupChannel {
    member: MemberId,
    group: String,
    writer: OwnedWriteHalf,
    inbox: mpsc::UnboundedReceiver<(MemberId, Value)>,
    reader: JoinHandle<()>,
}

impl TcpGroupChannel {
    /// Connects to the broker at `addr` and joins `group`.
    pub async fn join<A>(addr: A, group: &str) -> Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Display + Copy,
    {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        write_frame(
            &mut writer,
            &MemberToBroker::Join {
                group: group.to_string(),
            },
        )
        .await
        .context("failed to send join request")?;

        let member = match read_frame::<_, BrokerToMember>(&mut lines)
            .await
            .context("failed to read join response")?
        {
            Some(BrokerToMember::Joined { member, .. }) => member,
            Some(BrokerToMember::Error { message }) => {
                bail!("broker refused to join group '{group}': {message}")
            }
            Some(other) => bail!("unexpected join response: {other:?}"),
            None => bail!("broker closed the connection during join"),
        };

        info!(member, group, "joined group");

        let (tx, inbox) = mpsc::unbounded_channel();
        let reader = tokio::spawn(forward_deliveries(lines, tx, member));

        Ok(Self {
            member,
            group: group.to_string(),
            writer,
            inbox,
            reader,
        })
    }

    async fn send(&mut self, frame: MemberToBroker) -> Result<()> {
        write_frame(&mut self.writer, &frame)
            .await
            .with_context(|| format!("failed to publish to group '{}'", self.group))
    }
}

impl GroupChannel for TcpGroupChannel {
    fn member(&self) -> MemberId {
        self.member
    }

    async fn broadcast(&mut self, message: &Message) -> Result<()> {
        let payload = message.to_payload()?;
        self.send(MemberToBroker::Publish { payload }).await
    }

    async fn reply(&mut self, to: MemberId, message: &Message) -> Result<()> {
        let payload = message.to_payload()?;
        self.send(MemberToBroker::Reply { to, payload }).await
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

    async fn leave(mut self) -> Result<()> {
        if let Err(err) = write_frame(&mut self.writer, &MemberToBroker::Leave).await {
            debug!(?err, "broker already gone while leaving");
        }
        if let Err(err) = self.writer.shutdown().await {
            debug!(?err, "failed to shutdown group writer cleanly");
        }
        self.reader.abort();
        info!(member = self.member, group = %self.group, "left group");
        Ok(())
    }
}

async fn forward_deliveries(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    tx: mpsc::UnboundedSender<(MemberId, Value)>,
    member: MemberId,
) {
    loop {
        match read_frame::<_, BrokerToMember>(&mut lines).await {
            Ok(Some(BrokerToMember::Deliver { from, payload })) => {
                if tx.send((from, payload)).is_err() {
                    break;
                }
            }
            Ok(Some(BrokerToMember::Error { message })) => {
                warn!(member, %message, "broker reported an error");
            }
            Ok(Some(BrokerToMember::Joined { .. })) => {
                debug!(member, "ignoring duplicate join acknowledgement");
            }
            Ok(None) => {
                info!(member, "broker closed the connection");
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(member, error = %err, "dropping malformed frame");
            }
            Err(err) => {
                warn!(member, error = %err, "group connection failed");
                break;
            }
        }
    }
}
