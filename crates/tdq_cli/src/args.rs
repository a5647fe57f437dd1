use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Test distribution queue
///
/// The tdq cli
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    #[clap(flatten)]
    pub logging: LoggingArgs,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct LoggingArgs {
    /// Emit logs as JSON lines.
    #[clap(long, global = true)]
    pub log_json: bool,

    /// Write logs to daily-rotated files in this directory instead of stderr.
    #[clap(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts a queue, serving until interrupted.
    Start {
        /// The queue's TOML run configuration.
        #[clap(long, required = true)]
        config: PathBuf,

        /// Overrides the bind address of the run configuration.
        #[clap(long)]
        bind: Option<SocketAddr>,
    },
    /// Schedules tests on a running queue and waits for their results.
    Run {
        /// Address of the queue to connect to.
        #[clap(long, env = "TDQ_QUEUE_ADDR")]
        queue_addr: SocketAddr,

        /// JSON file with the list of test entry configurations to run.
        #[clap(long, required = true)]
        tests: PathBuf,

        /// How to split the tests into buckets.
        #[clap(long, value_enum, default_value_t = Strategy::Progressive)]
        strategy: Strategy,

        /// Tests per bucket, for the fixed-bucket-size strategy.
        #[clap(long, required_if_eq("strategy", "fixed-bucket-size"))]
        bucket_size: Option<usize>,

        /// Defaults to a random id.
        #[clap(long)]
        job_id: Option<String>,

        /// Defaults to the job id.
        #[clap(long)]
        job_group_id: Option<String>,

        /// 0 to 999.
        #[clap(long, default_value_t = 500)]
        priority: u16,

        /// 0 to 999.
        #[clap(long, default_value_t = 500)]
        group_priority: u16,

        /// Deletes the job from the queue once its results are in.
        #[clap(long)]
        delete: bool,
    },
    /// Prints the state of a job.
    State {
        #[clap(long, env = "TDQ_QUEUE_ADDR")]
        queue_addr: SocketAddr,

        #[clap(long, required = true)]
        job_id: String,
    },
    /// Prints the results collected so far for a job, as JSON.
    Results {
        #[clap(long, env = "TDQ_QUEUE_ADDR")]
        queue_addr: SocketAddr,

        #[clap(long, required = true)]
        job_id: String,
    },
    /// Deletes a job and everything the queue holds for it.
    Delete {
        #[clap(long, env = "TDQ_QUEUE_ADDR")]
        queue_addr: SocketAddr,

        #[clap(long, required = true)]
        job_id: String,
    },
    /// Prints the version of a running queue.
    Version {
        #[clap(long, env = "TDQ_QUEUE_ADDR")]
        queue_addr: SocketAddr,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    Individual,
    EquallyDivided,
    Progressive,
    Unsplit,
    FixedBucketSize,
}
