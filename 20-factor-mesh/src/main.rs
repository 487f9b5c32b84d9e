use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    net::TcpListener,
    select,
    task::JoinSet,
};
use tracing::{info, warn};

use factor_mesh::{
    bignum::BigNum,
    broker::Broker,
    cli::{Cli, ClientArgs, Mode, WorkerArgs},
    client::run_client,
    group::TcpGroupChannel,
    kernel::PollardRho,
    lifecycle::shutdown_channel,
    protocol::Solution,
    worker::run_worker,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match &cli.mode {
        Mode::Server => run_server(&cli).await,
        Mode::Worker(args) => run_workers(&cli, args).await,
        Mode::Client(ClientArgs {
            number: Some(number),
        }) => submit_once(&cli, number.clone()).await,
        Mode::Client(ClientArgs { number: None }) => run_prompt(&cli).await,
    }
}

async fn run_server(cli: &Cli) -> Result<()> {
    let addr = cli.addr();
    let listener = TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let broker = Broker::new(listener);
    let local = broker.local_addr()?;
    info!("published group channel at {}", local);
    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(trigger.trigger_on_ctrl_c());
    if let Err(err) = broker.run_until(shutdown.wait()).await {
        warn!("broker exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_workers(cli: &Cli, args: &WorkerArgs) -> Result<()> {
    let addr = cli.addr();
    let (trigger, shutdown) = shutdown_channel();
    let kernel = Arc::new(PollardRho);
    let mut workers = JoinSet::new();

    for _ in 0..args.workers.max(1) {
        let channel = TcpGroupChannel::join(addr.as_str(), &cli.group).await?;
        workers.spawn(run_worker(
            channel,
            args.config(),
            Arc::clone(&kernel),
            shutdown.clone().wait(),
        ));
    }
    tokio::spawn(trigger.trigger_on_ctrl_c());

    while let Some(joined) = workers.join_next().await {
        joined.context("worker task panicked")??;
    }
    Ok(())
}

async fn submit_once(cli: &Cli, number: BigNum) -> Result<()> {
    let addr = cli.addr();
    let channel = TcpGroupChannel::join(addr.as_str(), &cli.group).await?;
    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(trigger.trigger_on_ctrl_c());

    let mut stdout = tokio::io::stdout();
    match run_client(channel, number, shutdown.wait()).await? {
        Some(solution) => write_line(&mut stdout, &describe(&solution)).await?,
        None => info!("interrupted before a factor was found"),
    }
    Ok(())
}

async fn run_prompt(cli: &Cli) -> Result<()> {
    let addr = cli.addr();
    let (trigger, shutdown) = shutdown_channel();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut submissions = JoinSet::new();

    prompt(&mut stdout).await?;
    loop {
        select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if !line.is_empty() {
                    match line.parse::<BigNum>() {
                        Ok(number) => {
                            let channel = TcpGroupChannel::join(addr.as_str(), &cli.group).await?;
                            submissions.spawn(run_client(channel, number, shutdown.clone().wait()));
                        }
                        Err(err) => write_line(&mut stdout, &err.to_string()).await?,
                    }
                }
                prompt(&mut stdout).await?;
            }
            Some(joined) = submissions.join_next() => {
                report(&mut stdout, joined).await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!(error = ?err, "failed to listen for ctrl-c");
                }
                trigger.trigger();
                break;
            }
        }
    }

    // Outstanding submissions finish on their own, or stop once triggered.
    while let Some(joined) = submissions.join_next().await {
        report(&mut stdout, joined).await?;
    }
    Ok(())
}

async fn report(
    stdout: &mut Stdout,
    joined: Result<Result<Option<Solution>>, tokio::task::JoinError>,
) -> Result<()> {
    match joined.context("client task panicked")? {
        Ok(Some(solution)) => write_line(stdout, &describe(&solution)).await,
        Ok(None) => Ok(()),
        Err(err) => {
            warn!(error = ?err, "client failed");
            Ok(())
        }
    }
}

fn describe(solution: &Solution) -> String {
    format!(
        "{} = {} * {} (cpu_time: {}ms, rho_cycles: {})",
        solution.task,
        solution.factor,
        solution.cofactor(),
        solution.cpu_time,
        solution.rho_cycles
    )
}

async fn prompt(stdout: &mut Stdout) -> Result<()> {
    stdout.write_all(b"Enter a number: ").await?;
    stdout.flush().await?;
    Ok(())
}

async fn write_line(stdout: &mut Stdout, line: &str) -> Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
