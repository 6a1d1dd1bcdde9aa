use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "1.0";

/// Tokens sent by the runner and handled by the execution engine.
pub mod runner {
    pub const CANCEL: &[u8] = b"CANCEL";
    pub const FIND: &[u8] = b"FIND";
    pub const INFO: &[u8] = b"INFO";
    pub const QUIT: &[u8] = b"QUIT";
    pub const RUN: &[u8] = b"RUN";
}

/// Tokens sent by the execution engine and handled by the runner.
pub mod execution {
    pub const INFO: &[u8] = b"INFO";
    pub const MESSAGE: &[u8] = b"MSG";
}

/// Payload of the runner's `INFO` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEngineInfo {
    pub protocol_version: String,
}

/// Payload of the worker's `INFO` frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionEngineInfo {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "testAssemblyUniqueID", default)]
    pub test_assembly_unique_id: String,
    #[serde(rename = "testFrameworkDisplayName", default)]
    pub test_framework_display_name: String,
}
