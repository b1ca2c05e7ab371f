use std::fmt;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mapping from MIME type to a JSON payload.
pub type MimeBundle = Map<String, Value>;

/// Correlates an execution request with the events it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Request {
    Execute { id: RequestId, python: String },
    Interrupt { interrupt: RequestId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// One unit of execution feedback for a request.
///
/// `Done` is always the last event of a request and is never forwarded to
/// output callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputEvent {
    Stream {
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        execution_count: u32,
        data: MimeBundle,
        metadata: MimeBundle,
    },
    DisplayData {
        data: MimeBundle,
        metadata: MimeBundle,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Value>,
    },
    UpdateDisplayData {
        data: MimeBundle,
        metadata: MimeBundle,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Value>,
    },
    ClearOutput {
        wait: bool,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Done,
}

impl OutputEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, OutputEvent::Done)
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        OutputEvent::Error {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum EngineStatus {
    Ready,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Output {
        id: RequestId,
        #[serde(flatten)]
        event: OutputEvent,
    },
    Status(EngineStatus),
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(Bytes::from)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(frame)
}
