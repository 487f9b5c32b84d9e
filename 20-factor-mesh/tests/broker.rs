use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use factor_mesh::{
    bignum::BigNum,
    broker::Broker,
    group::{
        GroupChannel, TcpGroupChannel,
        wire::{BrokerToMember, MemberToBroker, read_frame, write_frame},
    },
    protocol::{Inbound, Message},
};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct RunningBroker {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl RunningBroker {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let broker = Broker::new(listener);
        let addr = broker.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(broker.run_until(async move {
            let _ = shutdown_rx.await;
        }));
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    async fn join(&self, group: &str) -> Result<TcpGroupChannel> {
        TcpGroupChannel::join(self.addr, group).await
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await.context("broker task panicked")?
    }
}

async fn next(channel: &mut TcpGroupChannel) -> Result<Inbound> {
    timeout(WAIT, channel.recv())
        .await
        .context("timed out waiting for a message")?
        .context("channel closed")
}

async fn stays_quiet(channel: &mut TcpGroupChannel) -> bool {
    timeout(QUIET, channel.recv()).await.is_err()
}

#[tokio::test]
async fn broadcast_reaches_every_other_member() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let mut alice = broker.join("vslab").await?;
    let mut bob = broker.join("vslab").await?;
    let mut carol = broker.join("vslab").await?;
    assert_ne!(alice.member(), bob.member());

    alice.broadcast(&Message::IdlePoll).await?;

    for peer in [&mut bob, &mut carol] {
        let inbound = next(peer).await?;
        assert_eq!(inbound.from, alice.member());
        assert_eq!(inbound.message, Message::IdlePoll);
    }
    assert!(stays_quiet(&mut alice).await, "sender must not hear itself");

    for member in [alice, bob, carol] {
        member.leave().await?;
    }
    broker.stop().await
}

#[tokio::test]
async fn replies_are_addressed_and_unroutable_ones_vanish() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let mut alice = broker.join("vslab").await?;
    let mut bob = broker.join("vslab").await?;
    let carol = broker.join("vslab").await?;
    let task = Message::Task {
        n: BigNum::from(8051),
    };

    alice.reply(bob.member(), &task).await?;
    let inbound = next(&mut bob).await?;
    assert_eq!(inbound.from, alice.member());
    assert_eq!(inbound.message, task);

    let departed = carol.member();
    carol.leave().await?;
    alice.reply(departed, &task).await?;
    assert!(stays_quiet(&mut bob).await);

    // The sender is unaffected by the dropped reply.
    alice.broadcast(&Message::IdlePoll).await?;
    assert_eq!(next(&mut bob).await?.message, Message::IdlePoll);

    alice.leave().await?;
    bob.leave().await?;
    broker.stop().await
}

#[tokio::test]
async fn groups_do_not_leak_into_each_other() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let mut alice = broker.join("vslab").await?;
    let mut outsider = broker.join("other").await?;
    let mut bob = broker.join("vslab").await?;

    alice.broadcast(&Message::IdlePoll).await?;
    assert_eq!(next(&mut bob).await?.from, alice.member());
    assert!(stays_quiet(&mut outsider).await);

    broker.stop().await
}

#[tokio::test]
async fn malformed_frames_and_payloads_are_dropped() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let mut bob = broker.join("vslab").await?;

    let stream = TcpStream::connect(broker.addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    write_frame(
        &mut writer,
        &MemberToBroker::Join {
            group: "vslab".into(),
        },
    )
    .await?;
    let joined = read_frame::<_, BrokerToMember>(&mut lines).await?;
    let Some(BrokerToMember::Joined { member: rogue, .. }) = joined else {
        anyhow::bail!("expected a join acknowledgement");
    };

    writer.write_all(b"this is not json\n").await?;
    write_frame(
        &mut writer,
        &MemberToBroker::Publish {
            payload: json!({"type": "task", "n": [7]}),
        },
    )
    .await?;
    write_frame(
        &mut writer,
        &MemberToBroker::Publish {
            payload: json!({"type": "idle_poll"}),
        },
    )
    .await?;

    let inbound = next(&mut bob).await?;
    assert_eq!(inbound.from, rogue);
    assert_eq!(inbound.message, Message::IdlePoll);

    broker.stop().await
}

#[tokio::test]
async fn empty_group_name_is_refused() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let Err(err) = broker.join("   ").await else {
        anyhow::bail!("joining a blank group should fail");
    };
    assert!(err.to_string().contains("group name cannot be empty"));
    broker.stop().await
}

#[tokio::test]
async fn members_hear_when_the_broker_goes_away() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let mut alice = broker.join("vslab").await?;
    broker.stop().await?;

    let closed = timeout(WAIT, async {
        while alice.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "recv should return None once the broker is gone");
    Ok(())
}
