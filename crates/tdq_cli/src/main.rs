mod args;
mod config;
mod logging;

use std::{path::Path, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;
use tdq_queue::Queue;
use tdq_utils::{
    decay::ExpDecay,
    exit::ExitStatus,
    net_protocol::{
        ids::{JobGroupId, JobId, RequestId},
        models::TestEntryConfiguration,
        queue::{PrioritizedJob, Priority, ScheduleStrategy},
    },
};
use tdq_workers::QueueClient;

use args::{Cli, Command, Strategy};
use config::QueueRunConfiguration;

fn main() -> ExitCode {
    let Cli { logging, command } = Cli::parse();

    let _log_guard = match logging::init(logging.log_json, logging.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("could not set up logging: {error:#}");
            return ExitStatus::Error.into();
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("could not start the async runtime: {error}");
            return ExitStatus::Error.into();
        }
    };

    match runtime.block_on(run_command(command)) {
        Ok(status) => status.into(),
        Err(error) => {
            tracing::error!("{error:#}");
            eprintln!("error: {error:#}");
            ExitStatus::Error.into()
        }
    }
}

async fn run_command(command: Command) -> anyhow::Result<ExitStatus> {
    match command {
        Command::Start { config, bind } => start(&config, bind).await,
        Command::Run {
            queue_addr,
            tests,
            strategy,
            bucket_size,
            job_id,
            job_group_id,
            priority,
            group_priority,
            delete,
        } => {
            let job_id = JobId::new(job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
            let prioritized_job = PrioritizedJob {
                job_group_id: JobGroupId::new(job_group_id.unwrap_or_else(|| job_id.to_string())),
                job_group_priority: Priority::new(group_priority)?,
                job_id,
                job_priority: Priority::new(priority)?,
            };
            let strategy = schedule_strategy(strategy, bucket_size)?;
            run_tests(QueueClient::new(queue_addr), &tests, strategy, prioritized_job, delete).await
        }
        Command::State { queue_addr, job_id } => {
            let state = QueueClient::new(queue_addr)
                .job_state(JobId::new(job_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(ExitStatus::Success)
        }
        Command::Results { queue_addr, job_id } => {
            let results = QueueClient::new(queue_addr)
                .job_results(JobId::new(job_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(ExitStatus::Success)
        }
        Command::Delete { queue_addr, job_id } => {
            QueueClient::new(queue_addr)
                .delete_job(JobId::new(job_id.as_str()))
                .await?;
            println!("deleted job {job_id}");
            Ok(ExitStatus::Success)
        }
        Command::Version { queue_addr } => {
            let version = QueueClient::new(queue_addr).queue_version().await?;
            println!("{version}");
            Ok(ExitStatus::Success)
        }
    }
}

fn schedule_strategy(
    strategy: Strategy,
    bucket_size: Option<usize>,
) -> anyhow::Result<ScheduleStrategy> {
    Ok(match strategy {
        Strategy::Individual => ScheduleStrategy::Individual,
        Strategy::EquallyDivided => ScheduleStrategy::EquallyDivided,
        Strategy::Progressive => ScheduleStrategy::Progressive,
        Strategy::Unsplit => ScheduleStrategy::Unsplit,
        Strategy::FixedBucketSize => ScheduleStrategy::FixedBucketSize {
            size: bucket_size.context("--bucket-size is required for fixed-bucket-size")?,
        },
    })
}

/// Serves until a termination signal arrives.
async fn start(config: &Path, bind: Option<std::net::SocketAddr>) -> anyhow::Result<ExitStatus> {
    let mut queue_config = QueueRunConfiguration::load(config)?.into_queue_config()?;
    if let Some(bind) = bind {
        queue_config.bind_addr = bind;
    }

    let mut queue = Queue::start(queue_config).await?;
    println!("tdq queue listening at {}", queue.server_addr());
    println!("Run the following to schedule tests:");
    println!(
        "\ttdq run --queue-addr={} --tests=<tests.json>",
        queue.server_addr()
    );

    let mut signals = Signals::new(TERM_SIGNALS)?;
    let signals_handle = signals.handle();
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutting down queue");
    }
    signals_handle.close();

    queue.shutdown().await?;
    Ok(ExitStatus::Success)
}

async fn run_tests(
    client: QueueClient,
    tests: &Path,
    strategy: ScheduleStrategy,
    prioritized_job: PrioritizedJob,
    delete: bool,
) -> anyhow::Result<ExitStatus> {
    let contents = std::fs::read_to_string(tests)
        .with_context(|| format!("could not read tests from {}", tests.display()))?;
    let test_entry_configurations: Vec<TestEntryConfiguration> = serde_json::from_str(&contents)
        .with_context(|| format!("invalid tests file {}", tests.display()))?;
    let test_count = test_entry_configurations.len();

    let job_id = prioritized_job.job_id.clone();
    let bucket_count = client
        .schedule_tests(
            RequestId::new(uuid::Uuid::new_v4().to_string()),
            strategy,
            test_entry_configurations,
            prioritized_job,
        )
        .await?;
    println!("scheduled {test_count} tests in {bucket_count} buckets as job {job_id}");

    let results = client
        .wait_for_job_results(
            job_id.clone(),
            ExpDecay::quadratic(
                std::time::Duration::from_millis(250),
                std::time::Duration::from_secs(5),
            ),
        )
        .await?;

    let mut passed = 0;
    let mut failed = vec![];
    for testing_result in &results.testing_results {
        passed += testing_result.successful_test_entries().count();
        failed.extend(
            testing_result
                .failed_test_entries()
                .map(|entry| entry.test_name.to_string()),
        );
    }
    failed.sort();

    println!("{passed} passed, {} failed", failed.len());
    for test in &failed {
        println!("\tFAILED {test}");
    }

    if delete {
        client.delete_job(job_id).await?;
    }

    Ok(if failed.is_empty() {
        ExitStatus::Success
    } else {
        ExitStatus::TestsFailed
    })
}
