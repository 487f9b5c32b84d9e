//! The `server` role: hosts named groups for remote members.
//!
//! Holds no task state. Every group is a Tokio `broadcast` channel of routed
//! frames; each member session subscribes to its group and forwards the
//! frames addressed to it. Slow members lag and lose frames, which is the
//! best-effort delivery the protocol is designed for.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use anyhow::Result;
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines},
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, broadcast},
};
use tracing::{debug, info, warn};

use crate::group::{
    MemberId,
    wire::{BrokerToMember, MemberToBroker, read_frame, write_frame},
};

const GROUP_CAPACITY: usize = 256;

pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Admits members until `shutdown` resolves, then closes every group.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = ?err, "failed to accept member connection");
                        continue;
                    }
                },
            };
            debug!(%peer, members = state.member_count(), "connection accepted, awaiting join");

            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state).await {
                    warn!(%peer, error = ?err, "member connection closed with error");
                }
            });
        }

        close_groups(&state).await;
        Ok(())
    }
}

/// Tells every member the broker is going away, then closes all groups so
/// their sessions end and the connections drop.
async fn close_groups(state: &BrokerState) {
    info!(members = state.member_count(), "broker shutting down");
    for (group, sender) in state.close_all().await {
        if sender
            .send(Routed::notice("broker shutting down".to_string()))
            .is_err()
        {
            debug!(group = %group, "no members left to notify");
        }
    }
}

/// One frame on a group's fan-out channel.
#[derive(Debug, Clone, PartialEq)]
struct Routed {
    /// `None` for broker notices.
    from: Option<MemberId>,
    /// `None` for broadcasts.
    to: Option<MemberId>,
    body: RoutedBody,
}

#[derive(Debug, Clone, PartialEq)]
enum RoutedBody {
    Payload(Value),
    Notice(String),
}

impl Routed {
    fn notice(message: String) -> Self {
        Self {
            from: None,
            to: None,
            body: RoutedBody::Notice(message),
        }
    }

    /// The frame `member` should receive, if any.
    fn frame_for(&self, member: MemberId) -> Option<BrokerToMember> {
        if self.from == Some(member) {
            return None;
        }
        if self.to.is_some_and(|to| to != member) {
            return None;
        }
        match (&self.body, self.from) {
            (RoutedBody::Payload(payload), Some(from)) => Some(BrokerToMember::Deliver {
                from,
                payload: payload.clone(),
            }),
            (RoutedBody::Notice(message), _) => Some(BrokerToMember::Error {
                message: message.clone(),
            }),
            (RoutedBody::Payload(_), None) => None,
        }
    }
}

struct BrokerState {
    groups: Mutex<HashMap<String, broadcast::Sender<Routed>>>,
    next_id: AtomicU64,
    /// Members past the handshake, across all groups.
    members: AtomicUsize,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            members: AtomicUsize::new(0),
        }
    }

    fn next_id(&self) -> MemberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn member_count(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }

    /// Hands out an id and counts the member in. Returns the new total.
    fn admit(&self) -> (MemberId, usize) {
        let member = self.next_id();
        let members = self.members.fetch_add(1, Ordering::Relaxed) + 1;
        (member, members)
    }

    /// Counts a member out. Returns the remaining total.
    fn depart(&self) -> usize {
        self.members.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    async fn subscribe(&self, group: &str) -> broadcast::Receiver<Routed> {
        let mut groups = self.groups.lock().await;
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .subscribe()
    }

    async fn route(&self, group: &str, routed: Routed) {
        let groups = self.groups.lock().await;
        let Some(sender) = groups.get(group) else {
            debug!(group, "dropping frame for unknown group");
            return;
        };
        if let Err(error) = sender.send(routed) {
            debug!(?error, group, "no members left to receive frame");
        }
    }

    /// Forgets a group once its last member is gone.
    async fn release(&self, group: &str) {
        let mut groups = self.groups.lock().await;
        if groups
            .get(group)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            groups.remove(group);
            info!(group, "group is empty, released");
        }
    }

    #[cfg(test)]
    async fn group_names(&self) -> Vec<String> {
        self.groups.lock().await.keys().cloned().collect()
    }

    async fn close_all(&self) -> HashMap<String, broadcast::Sender<Routed>> {
        std::mem::take(&mut *self.groups.lock().await)
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<BrokerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let group = perform_handshake(&mut lines, &mut writer).await?;
    let inbox = state.subscribe(&group).await;
    let (member, members) = state.admit();

    let session = match write_frame(
        &mut writer,
        &BrokerToMember::Joined {
            member,
            group: group.clone(),
        },
    )
    .await
    {
        Ok(()) => {
            info!(?peer, member, group = %group, members, "member joined");
            run_member_session(&state, &group, member, inbox, &mut lines, &mut writer).await
        }
        Err(err) => {
            drop(inbox);
            Err(err.into())
        }
    };
    state.release(&group).await;
    let members = state.depart();
    info!(?peer, member, group = %group, members, "member left");

    session
}

async fn perform_handshake<R, W>(lines: &mut Lines<R>, writer: &mut W) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let group = match read_frame::<_, MemberToBroker>(lines).await? {
        Some(MemberToBroker::Join { group }) => group.trim().to_string(),
        Some(_) => anyhow::bail!("expected join request first"),
        None => anyhow::bail!("connection closed before handshake"),
    };

    if group.is_empty() {
        write_frame(
            writer,
            &BrokerToMember::Error {
                message: "group name cannot be empty".to_string(),
            },
        )
        .await?;
        anyhow::bail!("group name cannot be empty");
    }

    Ok(group)
}

async fn run_member_session<R, W>(
    state: &BrokerState,
    group: &str,
    member: MemberId,
    mut inbox: broadcast::Receiver<Routed>,
    lines: &mut Lines<R>,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            frame = read_frame::<_, MemberToBroker>(lines) => {
                if !handle_member_frame(frame, writer, state, group, member).await? {
                    break;
                }
            }
            routed = inbox.recv() => {
                if !handle_routed(routed, writer, member).await? {
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn handle_member_frame<W>(
    frame: std::io::Result<Option<MemberToBroker>>,
    writer: &mut W,
    state: &BrokerState,
    group: &str,
    member: MemberId,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let frame = match frame {
        Ok(frame) => frame,
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            warn!(member, error = %err, "dropping malformed frame");
            return Ok(true);
        }
        Err(err) => return Err(err.into()),
    };

    match frame {
        Some(MemberToBroker::Publish { payload }) => {
            state
                .route(
                    group,
                    Routed {
                        from: Some(member),
                        to: None,
                        body: RoutedBody::Payload(payload),
                    },
                )
                .await;
            Ok(true)
        }
        Some(MemberToBroker::Reply { to, payload }) => {
            state
                .route(
                    group,
                    Routed {
                        from: Some(member),
                        to: Some(to),
                        body: RoutedBody::Payload(payload),
                    },
                )
                .await;
            Ok(true)
        }
        Some(MemberToBroker::Join { .. }) => {
            write_frame(
                writer,
                &BrokerToMember::Error {
                    message: "already joined".to_string(),
                },
            )
            .await?;
            Ok(true)
        }
        Some(MemberToBroker::Leave) | None => Ok(false),
    }
}

async fn handle_routed<W>(
    routed: Result<Routed, broadcast::error::RecvError>,
    writer: &mut W,
    member: MemberId,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match routed {
        Ok(routed) => {
            let Some(frame) = routed.frame_for(member) else {
                return Ok(true);
            };
            if let Err(err) = write_frame(writer, &frame).await {
                debug!(?err, member, "failed to deliver frame");
                return Ok(false);
            }
            Ok(true)
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(member, skipped, "member lagged, frames dropped");
            Ok(true)
        }
        Err(broadcast::error::RecvError::Closed) => Ok(false),
    }
}
