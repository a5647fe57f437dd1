//! Fixtures shared by the tests of the tdq crates.
//!
//! Tests are named by method; every fixture test lives in the class [TEST_CLASS].

use std::{collections::BTreeSet, time::Duration};

use tdq_utils::{
    net_protocol::{
        ids::{BucketId, JobId, WorkerId},
        models::{
            Bucket, BuildArtifacts, TestConfiguration, TestDestination, TestEntry,
            TestEntryConfiguration, TestEntryResult, TestExecutionBehavior, TestName,
            TestRunResult, TestTimeoutConfiguration, TestType, TestingResult,
        },
        queue::{PrioritizedJob, Priority},
    },
    time::EpochMillis,
};

pub const TEST_CLASS: &str = "FixtureTests";

pub fn test_destination() -> TestDestination {
    TestDestination {
        device_type: "iPhone 15".to_owned(),
        runtime: "iOS 17.0".to_owned(),
    }
}

pub fn build_artifacts() -> BuildArtifacts {
    BuildArtifacts {
        app_bundle: Some("/builds/App.app".to_owned()),
        runner: Some("/builds/Runner.app".to_owned()),
        test_bundle: "/builds/AppTests.xctest".to_owned(),
        additional_app_bundles: vec![],
    }
}

pub fn test_configuration_with_retries(number_of_retries: u32) -> TestConfiguration {
    TestConfiguration {
        build_artifacts: build_artifacts(),
        test_destination: test_destination(),
        test_execution_behavior: TestExecutionBehavior {
            environment: Default::default(),
            number_of_retries,
        },
        test_timeout_configuration: TestTimeoutConfiguration {
            single_test_maximum_duration: Duration::from_secs(60),
            test_runner_maximum_silence_duration: Duration::from_secs(60),
        },
        test_type: TestType::LogicTest,
    }
}

pub fn test_configuration() -> TestConfiguration {
    test_configuration_with_retries(0)
}

pub fn test_entry(method: &str) -> TestEntry {
    TestEntry::new(TestName::new(TEST_CLASS, method))
}

pub fn test_entry_configuration(method: &str) -> TestEntryConfiguration {
    TestEntryConfiguration {
        test_entry: test_entry(method),
        configuration: test_configuration(),
    }
}

pub fn test_entry_configurations(methods: &[&str]) -> Vec<TestEntryConfiguration> {
    methods.iter().map(|m| test_entry_configuration(m)).collect()
}

pub fn bucket_with_retries(bucket_id: &str, methods: &[&str], number_of_retries: u32) -> Bucket {
    Bucket::new(
        BucketId::from(bucket_id),
        methods.iter().map(|m| test_entry(m)).collect(),
        test_configuration_with_retries(number_of_retries),
    )
}

pub fn bucket(bucket_id: &str, methods: &[&str]) -> Bucket {
    bucket_with_retries(bucket_id, methods, 0)
}

pub fn run_result(succeeded: bool) -> TestRunResult {
    TestRunResult {
        succeeded,
        exceptions: vec![],
        duration: Duration::from_millis(250),
        start_time: EpochMillis::from_millis(0),
        host_name: "fixture-host".to_owned(),
    }
}

/// A result for `bucket` with one run per `(method, succeeded)` outcome.
pub fn testing_result(bucket: &Bucket, outcomes: &[(&str, bool)]) -> TestingResult {
    TestingResult {
        bucket_id: bucket.bucket_id.clone(),
        test_destination: bucket.test_destination().clone(),
        unfiltered_results: outcomes
            .iter()
            .map(|(method, succeeded)| TestEntryResult {
                test_entry: test_entry(method),
                test_run_results: vec![run_result(*succeeded)],
            })
            .collect(),
    }
}

/// Every entry of `bucket` passes.
pub fn passing_result(bucket: &Bucket) -> TestingResult {
    TestingResult {
        bucket_id: bucket.bucket_id.clone(),
        test_destination: bucket.test_destination().clone(),
        unfiltered_results: bucket
            .test_entries
            .iter()
            .map(|entry| TestEntryResult {
                test_entry: entry.clone(),
                test_run_results: vec![run_result(true)],
            })
            .collect(),
    }
}

pub fn worker_ids(ids: &[&str]) -> BTreeSet<WorkerId> {
    ids.iter().map(|id| WorkerId::from(*id)).collect()
}

pub fn prioritized_job(job_id: &str) -> PrioritizedJob {
    PrioritizedJob::standalone(JobId::from(job_id))
}

pub fn prioritized_job_with_priority(job_id: &str, job_priority: u16) -> PrioritizedJob {
    PrioritizedJob {
        job_priority: Priority::new(job_priority).expect("priority in range"),
        ..prioritized_job(job_id)
    }
}
