//! Tests, buckets, and their results.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde_derive::{Deserialize, Serialize};

use super::ids::BucketId;
use crate::time::EpochMillis;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestName {
    pub class_name: String,
    pub method_name: String,
}

impl TestName {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class_name, self.method_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestEntry {
    pub test_name: TestName,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Id of the test case in an external test management system, if any.
    #[serde(default)]
    pub case_id: Option<u64>,
}

impl TestEntry {
    pub fn new(test_name: TestName) -> Self {
        Self {
            test_name,
            tags: vec![],
            case_id: None,
        }
    }
}

/// The environment tests execute in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestDestination {
    pub device_type: String,
    pub runtime: String,
}

/// Locations of everything needed to run a test. Opaque to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildArtifacts {
    pub app_bundle: Option<String>,
    pub runner: Option<String>,
    pub test_bundle: String,
    #[serde(default)]
    pub additional_app_bundles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestExecutionBehavior {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// How many more times a failing test may run after its first attempt.
    pub number_of_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestTimeoutConfiguration {
    pub single_test_maximum_duration: Duration,
    pub test_runner_maximum_silence_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestType {
    AppTest,
    LogicTest,
    UiTest,
}

/// Everything about how a test runs except which test it is.
/// Tests sharing a configuration can be batched into one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub build_artifacts: BuildArtifacts,
    pub test_destination: TestDestination,
    pub test_execution_behavior: TestExecutionBehavior,
    pub test_timeout_configuration: TestTimeoutConfiguration,
    pub test_type: TestType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntryConfiguration {
    pub test_entry: TestEntry,
    pub configuration: TestConfiguration,
}

/// A batch of tests executed as one unit by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub bucket_id: BucketId,
    pub test_entries: Vec<TestEntry>,
    pub configuration: TestConfiguration,
}

impl Bucket {
    pub fn new(
        bucket_id: BucketId,
        test_entries: Vec<TestEntry>,
        configuration: TestConfiguration,
    ) -> Self {
        Self {
            bucket_id,
            test_entries,
            configuration,
        }
    }

    /// The same bucket, narrowed down to the given entries.
    pub fn with_test_entries(&self, test_entries: Vec<TestEntry>) -> Self {
        Self {
            bucket_id: self.bucket_id.clone(),
            test_entries,
            configuration: self.configuration.clone(),
        }
    }

    pub fn test_destination(&self) -> &TestDestination {
        &self.configuration.test_destination
    }

    pub fn build_artifacts(&self) -> &BuildArtifacts {
        &self.configuration.build_artifacts
    }

    pub fn number_of_retries(&self) -> u32 {
        self.configuration.test_execution_behavior.number_of_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestException {
    pub reason: String,
    pub file_path: String,
    pub line_number: u32,
}

/// One execution of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub succeeded: bool,
    #[serde(default)]
    pub exceptions: Vec<TestException>,
    pub duration: Duration,
    pub start_time: EpochMillis,
    pub host_name: String,
}

/// All executions of one test within a bucket run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    pub test_run_results: Vec<TestRunResult>,
}

impl TestEntryResult {
    /// A test that was expected to run, but for which no result was ever reported.
    pub fn lost(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            test_run_results: vec![],
        }
    }

    pub fn is_lost(&self) -> bool {
        self.test_run_results.is_empty()
    }

    /// Any successful run counts. Lost results never succeed.
    pub fn succeeded(&self) -> bool {
        self.test_run_results.iter().any(|run| run.succeeded)
    }
}

/// What a worker reports for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub test_destination: TestDestination,
    pub unfiltered_results: Vec<TestEntryResult>,
}

impl TestingResult {
    pub fn successful_test_entries(&self) -> impl Iterator<Item = &TestEntry> {
        self.unfiltered_results
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| &r.test_entry)
    }

    pub fn failed_test_entries(&self) -> impl Iterator<Item = &TestEntry> {
        self.unfiltered_results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| &r.test_entry)
    }

    pub fn all_succeeded(&self) -> bool {
        self.unfiltered_results.iter().all(TestEntryResult::succeeded)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{TestEntry, TestEntryResult, TestName, TestRunResult};
    use crate::time::EpochMillis;

    fn run(succeeded: bool) -> TestRunResult {
        TestRunResult {
            succeeded,
            exceptions: vec![],
            duration: Duration::from_secs(1),
            start_time: EpochMillis::from_millis(0),
            host_name: "host".to_owned(),
        }
    }

    #[test]
    fn lost_result_is_a_failure() {
        let result = TestEntryResult::lost(TestEntry::new(TestName::new("Class", "test")));
        assert!(result.is_lost());
        assert!(!result.succeeded());
    }

    #[test]
    fn any_successful_run_succeeds() {
        let result = TestEntryResult {
            test_entry: TestEntry::new(TestName::new("Class", "test")),
            test_run_results: vec![run(false), run(true)],
        };
        assert!(result.succeeded());
    }

    #[test]
    fn test_entry_defaults_optional_fields() {
        let entry: TestEntry = serde_json::from_str(
            r#"{"test_name":{"class_name":"Class","method_name":"test"}}"#,
        )
        .unwrap();
        assert_eq!(entry, TestEntry::new(TestName::new("Class", "test")));
        assert_eq!(entry.test_name.to_string(), "Class/test");
    }
}
