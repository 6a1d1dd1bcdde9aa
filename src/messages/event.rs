//! Test events produced by the worker and carried in `MSG` frames.
//!
//! Every event serializes to a JSON object tagged with `"$type"`, with the
//! remaining fields in camelCase, e.g.
//! `{"$type":"TestPassed","test":{...},"executionTime":0.01,"output":""}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum TestEvent {
    DiscoveryStarting(DiscoveryStarting),
    TestCaseDiscovered(TestCaseDiscovered),
    DiscoveryComplete(DiscoveryComplete),
    TestAssemblyStarting(TestAssemblyStarting),
    TestCollectionStarting(TestCollectionStarting),
    TestStarting(TestStarting),
    TestPassed(TestPassed),
    TestFailed(TestFailed),
    TestSkipped(TestSkipped),
    TestCollectionFinished(TestCollectionFinished),
    TestAssemblyFinished(TestAssemblyFinished),
    Error(ErrorMessage),
    Diagnostic(DiagnosticMessage),
}

/// Identifier chain shared by all per-test events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestIdentity {
    pub assembly_unique_id: String,
    pub test_collection_unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_class_unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_method_unique_id: Option<String>,
    pub test_case_unique_id: String,
    pub test_unique_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStarting {
    pub assembly_unique_id: String,
    pub assembly_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseDiscovered {
    pub assembly_unique_id: String,
    pub test_collection_unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_class_unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_method_unique_id: Option<String>,
    pub test_case_unique_id: String,
    pub test_case_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryComplete {
    pub assembly_unique_id: String,
    pub test_cases_to_run: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAssemblyStarting {
    pub assembly_unique_id: String,
    pub assembly_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_framework: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCollectionStarting {
    pub assembly_unique_id: String,
    pub test_collection_unique_id: String,
    pub test_collection_display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStarting {
    pub test: TestIdentity,
    pub test_display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPassed {
    pub test: TestIdentity,
    pub execution_time: f64,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFailed {
    pub test: TestIdentity,
    pub execution_time: f64,
    #[serde(default)]
    pub output: String,
    pub exception_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSkipped {
    pub test: TestIdentity,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCollectionFinished {
    pub assembly_unique_id: String,
    pub test_collection_unique_id: String,
    pub execution_time: f64,
    pub tests_total: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
    pub tests_not_run: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAssemblyFinished {
    pub assembly_unique_id: String,
    pub execution_time: f64,
    pub tests_total: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
    pub tests_not_run: u32,
}

/// A failure that is not attributable to a single test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub exception_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticMessage {
    pub message: String,
}

impl ErrorMessage {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    /// Builds an error event from an `anyhow` chain; the outer context becomes
    /// the message and the full chain the stack trace.
    pub fn from_error(exception_type: impl Into<String>, error: &anyhow::Error) -> Self {
        let chain: Vec<String> = error.chain().skip(1).map(|cause| cause.to_string()).collect();
        Self {
            exception_type: exception_type.into(),
            message: error.to_string(),
            stack_trace: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

impl TestEvent {
    /// Name of the variant, identical to the `"$type"` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TestEvent::DiscoveryStarting(_) => "DiscoveryStarting",
            TestEvent::TestCaseDiscovered(_) => "TestCaseDiscovered",
            TestEvent::DiscoveryComplete(_) => "DiscoveryComplete",
            TestEvent::TestAssemblyStarting(_) => "TestAssemblyStarting",
            TestEvent::TestCollectionStarting(_) => "TestCollectionStarting",
            TestEvent::TestStarting(_) => "TestStarting",
            TestEvent::TestPassed(_) => "TestPassed",
            TestEvent::TestFailed(_) => "TestFailed",
            TestEvent::TestSkipped(_) => "TestSkipped",
            TestEvent::TestCollectionFinished(_) => "TestCollectionFinished",
            TestEvent::TestAssemblyFinished(_) => "TestAssemblyFinished",
            TestEvent::Error(_) => "Error",
            TestEvent::Diagnostic(_) => "Diagnostic",
        }
    }

    pub fn assembly_unique_id(&self) -> Option<&str> {
        match self {
            TestEvent::DiscoveryStarting(e) => Some(&e.assembly_unique_id),
            TestEvent::TestCaseDiscovered(e) => Some(&e.assembly_unique_id),
            TestEvent::DiscoveryComplete(e) => Some(&e.assembly_unique_id),
            TestEvent::TestAssemblyStarting(e) => Some(&e.assembly_unique_id),
            TestEvent::TestCollectionStarting(e) => Some(&e.assembly_unique_id),
            TestEvent::TestStarting(e) => Some(&e.test.assembly_unique_id),
            TestEvent::TestPassed(e) => Some(&e.test.assembly_unique_id),
            TestEvent::TestFailed(e) => Some(&e.test.assembly_unique_id),
            TestEvent::TestSkipped(e) => Some(&e.test.assembly_unique_id),
            TestEvent::TestCollectionFinished(e) => Some(&e.assembly_unique_id),
            TestEvent::TestAssemblyFinished(e) => Some(&e.assembly_unique_id),
            TestEvent::Error(_) | TestEvent::Diagnostic(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TestEvent::TestFailed(_))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
