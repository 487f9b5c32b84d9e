use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{bignum::BigNum, kernel::Effort, worker::WorkerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Broker host. The server binds to it; workers and clients connect to it.
    #[arg(short = 'H', long, global = true, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port. Use 0 with `server` for an ephemeral port.
    #[arg(short, long, global = true, default_value_t = 5000)]
    pub port: u16,

    /// Name of the group every role joins.
    #[arg(short, long, global = true, default_value = "vslab")]
    pub group: String,

    #[command(subcommand)]
    pub mode: Mode,
}

impl Cli {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Host the group channel until interrupted.
    Server,
    /// Join the group and factor whatever tasks come along.
    Worker(WorkerArgs),
    /// Submit numbers and print their factors.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Independent worker actors to run in this process.
    #[arg(short, long, default_value_t = 1)]
    pub workers: usize,

    /// Seconds between idle-polls.
    #[arg(long, default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Rho iterations per kernel slice before the mailbox is checked again.
    #[arg(long, default_value_t = 20_000)]
    pub slice_iterations: u64,
}

impl WorkerArgs {
    pub fn config(&self) -> WorkerConfig {
        let poll_interval = Duration::from_secs(self.poll_interval_secs);
        WorkerConfig {
            poll_interval,
            completed_ttl: poll_interval * 3,
            effort: Effort::iterations(self.slice_iterations),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Factor this number and exit instead of prompting.
    #[arg(short, long)]
    pub number: Option<BigNum>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_deployment() {
        let cli = Cli::try_parse_from(["factor_mesh", "worker"]).expect("parse");
        assert_eq!(cli.addr(), "127.0.0.1:5000");
        assert_eq!(cli.group, "vslab");
        let Mode::Worker(args) = cli.mode else {
            panic!("expected worker mode");
        };
        assert_eq!(args.workers, 1);
        assert_eq!(args.config(), WorkerConfig::default());
    }

    #[test]
    fn global_options_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "factor_mesh",
            "client",
            "--number",
            "123456789012345678901234567890",
            "-H",
            "10.0.0.2",
            "-p",
            "7000",
        ])
        .expect("parse");
        assert_eq!(cli.addr(), "10.0.0.2:7000");
        let Mode::Client(args) = cli.mode else {
            panic!("expected client mode");
        };
        assert_eq!(
            args.number,
            Some("123456789012345678901234567890".parse().expect("number"))
        );
    }

    #[test]
    fn rejects_a_non_numeric_task() {
        assert!(Cli::try_parse_from(["factor_mesh", "client", "-n", "twelve"]).is_err());
    }

    #[test]
    fn worker_flags_build_the_config() {
        let cli = Cli::try_parse_from([
            "factor_mesh",
            "worker",
            "--poll-interval-secs",
            "2",
            "--slice-iterations",
            "500",
        ])
        .expect("parse");
        let Mode::Worker(args) = cli.mode else {
            panic!("expected worker mode");
        };
        let config = args.config();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.completed_ttl, Duration::from_secs(6));
        assert_eq!(config.effort, Effort::iterations(500));
    }
}
