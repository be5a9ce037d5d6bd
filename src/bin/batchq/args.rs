use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub(crate) const DEFAULT_PORT: u16 = 11400;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t, global = true)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Runs the submission and status front end.
    Serve {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        listen: ListenArgs,
    },
    /// Claims and runs batches of jobs.
    Worker {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Moves delayed jobs back onto their queues once their retry delay is up.
    Requeuer {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Recovers jobs held by workers that stopped heartbeating.
    Janitor {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Runs the front end, workers, requeuer and janitor in one process
    /// against an in-memory store. Nothing survives a restart.
    Standalone {
        /// YAML file with engine settings.
        #[arg(short, long, env = "BATCHQ_CONFIG")]
        config: Option<PathBuf>,
        #[command(flatten)]
        listen: ListenArgs,
        /// Number of workers to run.
        #[arg(short, long, default_value_t = 2)]
        workers: usize,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Submits a test job to a running front end.
    Submit {
        #[command(flatten)]
        server: ServerArgs,
        #[arg(long)]
        org_id: String,
        #[arg(long)]
        app_version_id: String,
        /// Path of the test to run.
        #[arg(long)]
        test: String,
        /// emulator, device, or browserstack.
        #[arg(long)]
        target: String,
        /// 1 (lowest) to 10 (highest).
        #[arg(long, default_value_t = 5)]
        priority: u32,
        /// Retries after the first failure, 0 to 5.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// Shows a job's current record.
    Status {
        #[command(flatten)]
        server: ServerArgs,
        job_id: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct StoreArgs {
    /// Redis instance holding the shared store.
    #[arg(
        long,
        env = "BATCHQ_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub(crate) redis_url: String,
    /// YAML file with engine settings.
    #[arg(short, long, env = "BATCHQ_CONFIG")]
    pub(crate) config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ListenArgs {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub(crate) port: u16,
}

#[derive(clap::Args, Debug)]
pub(crate) struct WorkerArgs {
    /// Fixed worker identity. A restarted worker with the same identity
    /// recovers its own unfinished batch at startup. Random if unset.
    #[arg(long)]
    pub(crate) worker_id: Option<String>,
    /// Program run once per batch as
    /// `<program> [args..] <app_version_id> <target> <job_id>=<test_path>..`.
    /// Batches are simulated if unset.
    #[arg(long)]
    pub(crate) executor: Option<PathBuf>,
    /// Extra leading arguments for the executor program.
    #[arg(long = "executor-arg", allow_hyphen_values = true)]
    pub(crate) executor_args: Vec<String>,
    /// Chance in 0.0 to 1.0 that a simulated batch fails.
    #[arg(long, default_value_t = 0.5, value_parser = parse_rate)]
    pub(crate) failure_rate: f64,
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not between 0.0 and 1.0"))
    }
}

#[derive(clap::Args, Debug)]
pub(crate) struct ServerArgs {
    /// Front end to connect to.
    #[arg(
        short,
        long,
        env = "BATCHQ_SERVER",
        default_value_t = format!("127.0.0.1:{DEFAULT_PORT}")
    )]
    pub(crate) server: String,
}
