//! Worker actor.
//!
//! [`Worker`] is the idle/busy state machine. It never touches the network:
//! it consumes [`WorkerEvent`]s and returns [`WorkerAction`]s, which keeps
//! every protocol rule testable without sockets or timers. [`run_worker`]
//! owns a `Worker`, a group channel and the factor kernel, and turns actions
//! into broadcasts, replies and timer changes.
//!
//! The kernel runs on the blocking pool in bounded slices. Between slices the
//! loop goes back to the mailbox, so a `Result` for the task being worked on
//! is seen promptly and the rest of the search is abandoned.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    select,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{Instrument, Span, debug, field, info, info_span, warn};

use crate::{
    bignum::BigNum,
    group::{GroupChannel, MemberId, dispatch},
    kernel::{Effort, FactorKernel, FactorOutcome},
    protocol::{Inbound, Message, Outbound, Solution},
};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Delay between idle-polls while nothing is being worked on.
    pub poll_interval: Duration,
    /// How long a just-finished task value is refused if offered again.
    pub completed_ttl: Duration,
    /// Budget for one kernel slice.
    pub effort: Effort,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_secs(10);
        Self {
            poll_interval,
            completed_ttl: poll_interval * 3,
            effort: Effort::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Idle,
    Working(Job),
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => f.write_str("IDLE"),
            WorkerState::Working(job) => write!(f, "{}", job.task),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub task: BigNum,
    pub cpu_time: Duration,
    pub rho_cycles: u64,
    /// The kernel reported that no factor can exist; keep holding the task
    /// but stop spending slices on it.
    pub parked: bool,
}

impl Job {
    fn new(task: BigNum) -> Self {
        Self {
            task,
            cpu_time: Duration::ZERO,
            rho_cycles: 0,
            parked: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Something a peer sent over the group channel.
    Peer(Inbound),
    /// The self-scheduled idle-poll timer fired. Never originates from a peer.
    PollTimer,
    /// A kernel slice for `task` returned.
    SliceFinished {
        task: BigNum,
        outcome: FactorOutcome,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    Send(Outbound),
    /// Fire [`WorkerEvent::PollTimer`] after the delay, replacing any pending timer.
    SchedulePoll(Duration),
    CancelPoll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    member: MemberId,
    state: WorkerState,
    /// Tasks finished here or seen solved, keyed to when that first happened.
    recently_completed: HashMap<BigNum, Instant>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(member: MemberId, config: WorkerConfig) -> Self {
        Self {
            member,
            state: WorkerState::Idle,
            recently_completed: HashMap::new(),
            config,
        }
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn current_task(&self) -> Option<&BigNum> {
        match &self.state {
            WorkerState::Idle => None,
            WorkerState::Working(job) => Some(&job.task),
        }
    }

    /// The task the kernel should be running on, if any.
    pub fn slice_task(&self) -> Option<&BigNum> {
        match &self.state {
            WorkerState::Working(job) if !job.parked => Some(&job.task),
            _ => None,
        }
    }

    /// A fresh worker polls for work right away.
    pub fn start(&self) -> Vec<WorkerAction> {
        vec![WorkerAction::SchedulePoll(Duration::ZERO)]
    }

    pub fn handle(&mut self, event: WorkerEvent, now: Instant) -> Vec<WorkerAction> {
        match event {
            WorkerEvent::Peer(Inbound { from, message }) => match message {
                Message::Task { n } => self.on_task(from, n, now),
                Message::IdlePoll => self.on_idle_poll(from),
                Message::Result(solution) => self.on_result(solution, now),
            },
            WorkerEvent::PollTimer => self.on_poll_timer(),
            WorkerEvent::SliceFinished {
                task,
                outcome,
                elapsed,
            } => self.on_slice_finished(task, outcome, elapsed, now),
        }
    }

    fn on_task(&mut self, from: MemberId, n: BigNum, now: Instant) -> Vec<WorkerAction> {
        match &self.state {
            WorkerState::Working(job) if job.task == n => {
                debug!(member = self.member, from, task = %n, "already working on offered task");
                Vec::new()
            }
            WorkerState::Working(job) => {
                debug!(member = self.member, from, task = %job.task, offered = %n, "busy, ignoring task");
                Vec::new()
            }
            WorkerState::Idle if self.just_completed(&n, now) => {
                debug!(member = self.member, from, task = %n, "task was just completed, ignoring");
                Vec::new()
            }
            WorkerState::Idle => {
                info!(member = self.member, from, task = %n, "got task");
                self.state = WorkerState::Working(Job::new(n));
                vec![WorkerAction::CancelPoll]
            }
        }
    }

    fn on_idle_poll(&self, from: MemberId) -> Vec<WorkerAction> {
        match &self.state {
            WorkerState::Working(job) => {
                debug!(member = self.member, from, task = %job.task, "sharing task with idle worker");
                vec![WorkerAction::Send(Outbound::Reply {
                    to: from,
                    message: Message::Task {
                        n: job.task.clone(),
                    },
                })]
            }
            WorkerState::Idle => Vec::new(),
        }
    }

    fn on_result(&mut self, solution: Solution, now: Instant) -> Vec<WorkerAction> {
        let holds_task = matches!(&self.state, WorkerState::Working(job) if job.task == solution.task);
        self.remember_completed(solution.task.clone(), now);

        if !holds_task {
            return Vec::new();
        }

        info!(
            member = self.member,
            task = %solution.task,
            factor = %solution.factor,
            "got result from a peer, deleting task"
        );
        self.state = WorkerState::Idle;
        vec![WorkerAction::SchedulePoll(Duration::ZERO)]
    }

    fn on_poll_timer(&self) -> Vec<WorkerAction> {
        match &self.state {
            WorkerState::Idle => {
                debug!(
                    member = self.member,
                    next_in = ?self.config.poll_interval,
                    "sending idle poll"
                );
                vec![
                    WorkerAction::Send(Outbound::Broadcast(Message::IdlePoll)),
                    WorkerAction::SchedulePoll(self.config.poll_interval),
                ]
            }
            WorkerState::Working(_) => {
                debug!(member = self.member, state = %self.state, "busy, idle poll suppressed");
                Vec::new()
            }
        }
    }

    fn on_slice_finished(
        &mut self,
        task: BigNum,
        outcome: FactorOutcome,
        elapsed: Duration,
        now: Instant,
    ) -> Vec<WorkerAction> {
        let WorkerState::Working(job) = &mut self.state else {
            return Vec::new();
        };
        if job.task != task {
            debug!(member = self.member, task = %task, "discarding stale slice");
            return Vec::new();
        }

        job.cpu_time += elapsed;
        job.rho_cycles += outcome.iterations();
        let hopeless = outcome.is_hopeless();

        match outcome {
            FactorOutcome::Found { factor, .. } => {
                let solution = Solution {
                    task: task.clone(),
                    factor,
                    cpu_time: u64::try_from(job.cpu_time.as_millis()).unwrap_or(u64::MAX),
                    rho_cycles: job.rho_cycles,
                };
                info!(
                    member = self.member,
                    task = %solution.task,
                    factor = %solution.factor,
                    cpu_time = solution.cpu_time,
                    rho_cycles = solution.rho_cycles,
                    "sending result"
                );
                self.state = WorkerState::Idle;
                self.remember_completed(task, now);
                vec![
                    WorkerAction::Send(Outbound::Broadcast(Message::Result(solution))),
                    WorkerAction::SchedulePoll(Duration::ZERO),
                ]
            }
            FactorOutcome::Exhausted { .. } if hopeless => {
                info!(member = self.member, task = %task, "no nontrivial factor exists, holding task");
                job.parked = true;
                Vec::new()
            }
            FactorOutcome::Exhausted { .. } => Vec::new(),
        }
    }

    fn just_completed(&self, task: &BigNum, now: Instant) -> bool {
        self.recently_completed
            .get(task)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.config.completed_ttl)
    }

    /// A value already remembered is left untouched, so repeated results
    /// never change the worker. Expired entries are pruned on insert only.
    fn remember_completed(&mut self, task: BigNum, now: Instant) {
        if self.recently_completed.contains_key(&task) {
            return;
        }
        let ttl = self.config.completed_ttl;
        self.recently_completed
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        self.recently_completed.insert(task, now);
    }
}

struct Slice {
    task: BigNum,
    handle: JoinHandle<(FactorOutcome, Duration)>,
}

impl Slice {
    fn spawn<K: FactorKernel>(kernel: Arc<K>, task: BigNum, effort: Effort) -> Self {
        let n = task.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let started = std::time::Instant::now();
            let outcome = kernel.find_factor(&n, effort, &mut rand::thread_rng());
            (outcome, started.elapsed())
        });
        Self { task, handle }
    }
}

async fn join_slice(in_flight: &mut Option<Slice>) -> Result<WorkerEvent> {
    let Some(slice) = in_flight.as_mut() else {
        return std::future::pending().await;
    };
    let (outcome, elapsed) = (&mut slice.handle)
        .await
        .context("factor kernel slice failed")?;
    Ok(WorkerEvent::SliceFinished {
        task: slice.task.clone(),
        outcome,
        elapsed,
    })
}

/// Runs one worker until `shutdown` resolves or the channel closes.
///
/// Only transport failures are returned as errors; everything the protocol
/// can throw at a worker is absorbed by the state machine.
pub async fn run_worker<C, K, F>(
    mut channel: C,
    config: WorkerConfig,
    kernel: Arc<K>,
    shutdown: F,
) -> Result<()>
where
    C: GroupChannel,
    K: FactorKernel,
    F: Future<Output = ()> + Send,
{
    let span = info_span!(
        "worker",
        member = channel.member(),
        state = %WorkerState::Idle
    );
    drive_worker(channel, config, kernel, shutdown, span.clone())
        .instrument(span)
        .await
}

/// The worker loop. Every log line inside carries the `worker{member, state}`
/// span, and `state` is kept current after each event.
async fn drive_worker<C, K, F>(
    mut channel: C,
    config: WorkerConfig,
    kernel: Arc<K>,
    shutdown: F,
    span: Span,
) -> Result<()>
where
    C: GroupChannel,
    K: FactorKernel,
    F: Future<Output = ()> + Send,
{
    let effort = config.effort;
    let mut worker = Worker::new(channel.member(), config);
    let mut poll_at: Option<Instant> = None;
    let mut in_flight: Option<Slice> = None;
    tokio::pin!(shutdown);

    info!(member = worker.member(), "worker started");
    perform(&mut channel, &mut poll_at, worker.start()).await?;

    loop {
        let wanted = worker.slice_task().cloned();
        let running = in_flight.as_ref().map(|slice| slice.task.clone());
        if wanted != running {
            in_flight = wanted.map(|task| Slice::spawn(Arc::clone(&kernel), task, effort));
        }

        let event = select! {
            biased;
            _ = &mut shutdown => break,
            inbound = channel.recv() => match inbound {
                Some(inbound) => WorkerEvent::Peer(inbound),
                None => {
                    warn!(member = worker.member(), "group channel closed");
                    break;
                }
            },
            _ = sleep_until(poll_at.unwrap_or_else(Instant::now)), if poll_at.is_some() => {
                poll_at = None;
                WorkerEvent::PollTimer
            }
            finished = join_slice(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                finished?
            }
        };

        let actions = worker.handle(event, Instant::now());
        span.record("state", field::display(worker.state()));
        perform(&mut channel, &mut poll_at, actions).await?;
    }

    info!(member = worker.member(), state = %worker.state(), "worker stopping");
    channel.leave().await
}

async fn perform<C: GroupChannel>(
    channel: &mut C,
    poll_at: &mut Option<Instant>,
    actions: Vec<WorkerAction>,
) -> Result<()> {
    for action in actions {
        match action {
            WorkerAction::Send(outbound) => dispatch(channel, outbound).await?,
            WorkerAction::SchedulePoll(delay) => *poll_at = Some(Instant::now() + delay),
            WorkerAction::CancelPoll => *poll_at = None,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: MemberId = 7;

    fn worker() -> Worker {
        Worker::new(1, WorkerConfig::default())
    }

    fn from_peer(message: Message) -> WorkerEvent {
        WorkerEvent::Peer(Inbound {
            from: PEER,
            message,
        })
    }

    fn task(n: i64) -> WorkerEvent {
        from_peer(Message::Task { n: BigNum::from(n) })
    }

    fn solution(task: i64, factor: i64) -> Solution {
        Solution {
            task: BigNum::from(task),
            factor: BigNum::from(factor),
            cpu_time: 1,
            rho_cycles: 10,
        }
    }

    fn result(task: i64, factor: i64) -> WorkerEvent {
        from_peer(Message::Result(solution(task, factor)))
    }

    fn finished(n: i64, outcome: FactorOutcome, millis: u64) -> WorkerEvent {
        WorkerEvent::SliceFinished {
            task: BigNum::from(n),
            outcome,
            elapsed: Duration::from_millis(millis),
        }
    }

    fn working_on(n: i64) -> Worker {
        let mut worker = worker();
        worker.handle(task(n), Instant::now());
        worker
    }

    #[test]
    fn starts_idle_and_polls_immediately() {
        let worker = worker();
        assert_eq!(worker.state(), &WorkerState::Idle);
        assert_eq!(worker.start(), vec![WorkerAction::SchedulePoll(Duration::ZERO)]);
    }

    #[test]
    fn state_shown_in_logs_follows_the_task() {
        let mut worker = worker();
        assert_eq!(worker.state().to_string(), "IDLE");
        worker.handle(task(8051), Instant::now());
        assert_eq!(worker.state().to_string(), "8051");
        worker.handle(result(8051, 83), Instant::now());
        assert_eq!(worker.state().to_string(), "IDLE");
    }

    #[test]
    fn idle_poll_timer_broadcasts_and_reschedules() {
        let mut worker = worker();
        let actions = worker.handle(WorkerEvent::PollTimer, Instant::now());
        assert_eq!(
            actions,
            vec![
                WorkerAction::Send(Outbound::Broadcast(Message::IdlePoll)),
                WorkerAction::SchedulePoll(Duration::from_secs(10)),
            ]
        );
    }

    #[test]
    fn idle_worker_adopts_exactly_the_offered_task() {
        let mut worker = worker();
        let actions = worker.handle(task(21), Instant::now());
        assert_eq!(actions, vec![WorkerAction::CancelPoll]);
        assert_eq!(worker.current_task(), Some(&BigNum::from(21)));
        assert_eq!(worker.slice_task(), Some(&BigNum::from(21)));
    }

    #[test]
    fn busy_worker_never_polls_and_keeps_its_task() {
        let mut worker = working_on(21);
        assert!(worker.handle(WorkerEvent::PollTimer, Instant::now()).is_empty());
        assert!(worker.handle(task(35), Instant::now()).is_empty());
        assert!(worker.handle(task(21), Instant::now()).is_empty());
        assert_eq!(worker.current_task(), Some(&BigNum::from(21)));
    }

    #[test]
    fn busy_worker_shares_its_task_with_idle_pollers() {
        let mut worker = working_on(21);
        let actions = worker.handle(from_peer(Message::IdlePoll), Instant::now());
        assert_eq!(
            actions,
            vec![WorkerAction::Send(Outbound::Reply {
                to: PEER,
                message: Message::Task {
                    n: BigNum::from(21)
                },
            })]
        );

        let mut idle = self::worker();
        assert!(idle.handle(from_peer(Message::IdlePoll), Instant::now()).is_empty());
    }

    #[test]
    fn own_factor_is_broadcast_with_accumulated_metrics() {
        let mut worker = working_on(8051);
        let now = Instant::now();
        assert!(worker
            .handle(finished(8051, FactorOutcome::Exhausted { iterations: 100 }, 4), now)
            .is_empty());

        let found = FactorOutcome::Found {
            factor: BigNum::from(83),
            iterations: 25,
        };
        let actions = worker.handle(finished(8051, found, 3), now);
        assert_eq!(
            actions,
            vec![
                WorkerAction::Send(Outbound::Broadcast(Message::Result(Solution {
                    task: BigNum::from(8051),
                    factor: BigNum::from(83),
                    cpu_time: 7,
                    rho_cycles: 125,
                }))),
                WorkerAction::SchedulePoll(Duration::ZERO),
            ]
        );
        assert_eq!(worker.state(), &WorkerState::Idle);
    }

    #[test]
    fn peer_result_clears_the_matching_task() {
        let mut worker = working_on(21);
        let actions = worker.handle(result(21, 3), Instant::now());
        assert_eq!(actions, vec![WorkerAction::SchedulePoll(Duration::ZERO)]);
        assert_eq!(worker.state(), &WorkerState::Idle);
    }

    #[test]
    fn duplicate_result_is_a_no_op() {
        let now = Instant::now();
        let mut once = working_on(21);
        once.handle(result(21, 3), now);

        let mut twice = once.clone();
        let actions = twice.handle(result(21, 3), now + Duration::from_millis(5));

        assert!(actions.is_empty());
        assert_eq!(once, twice);
    }

    #[test]
    fn late_duplicate_result_does_not_revive_an_older_completion() {
        let start = Instant::now();
        let mut worker = working_on(21);
        worker.handle(result(21, 3), start);
        worker.handle(result(15, 5), start + Duration::from_millis(1));

        let before = worker.clone();
        let actions = worker.handle(result(21, 7), start + Duration::from_millis(2));
        assert!(actions.is_empty());
        assert_eq!(worker, before);

        // A slow holder still handing out 15 must not restart the work.
        assert!(worker
            .handle(task(15), start + Duration::from_millis(3))
            .is_empty());
        assert!(worker
            .handle(task(21), start + Duration::from_millis(3))
            .is_empty());
        assert_eq!(worker.state(), &WorkerState::Idle);
    }

    #[test]
    fn expired_completions_are_forgotten_once_something_new_finishes() {
        let start = Instant::now();
        let ttl = WorkerConfig::default().completed_ttl;
        let mut worker = working_on(21);
        worker.handle(result(21, 3), start);

        let later = start + ttl + Duration::from_secs(1);
        worker.handle(result(15, 5), later);
        assert_eq!(worker.recently_completed.len(), 1);
        assert!(worker.recently_completed.contains_key(&BigNum::from(15)));
    }

    #[test]
    fn result_for_another_task_is_ignored() {
        let mut worker = working_on(21);
        assert!(worker.handle(result(15, 5), Instant::now()).is_empty());
        assert_eq!(worker.current_task(), Some(&BigNum::from(21)));
    }

    #[test]
    fn just_completed_task_is_refused_until_the_window_passes() {
        let start = Instant::now();
        let mut worker = working_on(21);
        worker.handle(result(21, 7), start);

        assert!(worker.handle(task(21), start + Duration::from_secs(1)).is_empty());
        assert_eq!(worker.state(), &WorkerState::Idle);

        let later = start + WorkerConfig::default().completed_ttl + Duration::from_secs(1);
        assert_eq!(worker.handle(task(21), later), vec![WorkerAction::CancelPoll]);
        assert_eq!(worker.current_task(), Some(&BigNum::from(21)));
    }

    #[test]
    fn a_different_task_is_adopted_right_after_completion() {
        let now = Instant::now();
        let mut worker = working_on(21);
        worker.handle(result(21, 7), now);
        assert_eq!(worker.handle(task(15), now), vec![WorkerAction::CancelPoll]);
    }

    #[test]
    fn stale_slices_are_discarded() {
        let mut worker = working_on(21);
        let found = FactorOutcome::Found {
            factor: BigNum::from(5),
            iterations: 1,
        };
        assert!(worker.handle(finished(15, found.clone(), 1), Instant::now()).is_empty());
        assert_eq!(worker.current_task(), Some(&BigNum::from(21)));

        let mut idle = self::worker();
        assert!(idle.handle(finished(15, found, 1), Instant::now()).is_empty());
        assert_eq!(idle.state(), &WorkerState::Idle);
    }

    #[test]
    fn prime_task_is_held_but_no_longer_searched() {
        let mut worker = working_on(97);
        let actions = worker.handle(
            finished(97, FactorOutcome::Exhausted { iterations: 0 }, 0),
            Instant::now(),
        );
        assert!(actions.is_empty());
        assert_eq!(worker.current_task(), Some(&BigNum::from(97)));
        assert_eq!(worker.slice_task(), None);

        let shared = worker.handle(from_peer(Message::IdlePoll), Instant::now());
        assert_eq!(shared.len(), 1);

        worker.handle(result(97, 97), Instant::now());
        assert_eq!(worker.state(), &WorkerState::Idle);
    }

    #[test]
    fn losing_racer_clears_without_a_second_broadcast() {
        let now = Instant::now();
        let mut winner = working_on(21);
        let mut loser = working_on(21);

        let found = FactorOutcome::Found {
            factor: BigNum::from(3),
            iterations: 0,
        };
        let actions = winner.handle(finished(21, found, 0), now);
        let Some(WorkerAction::Send(Outbound::Broadcast(Message::Result(won)))) = actions.first()
        else {
            panic!("winner should broadcast a result, got {actions:?}");
        };

        let actions = loser.handle(from_peer(Message::Result(won.clone())), now);
        assert!(actions
            .iter()
            .all(|action| !matches!(action, WorkerAction::Send(_))));
        assert_eq!(loser.state(), &WorkerState::Idle);

        // The loser's own slice for 21 finishing afterwards is stale.
        let late = FactorOutcome::Found {
            factor: BigNum::from(7),
            iterations: 0,
        };
        assert!(loser.handle(finished(21, late, 0), now).is_empty());
    }
}
