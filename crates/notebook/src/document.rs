//! Serde model of an nbformat 4 notebook.
//!
//! Only the parts the execution flow touches are typed; everything else is
//! kept as raw JSON so a notebook round-trips without losing fields.

use cellrun_kernel::{MimeBundle, OutputEvent, StreamName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    pub nbformat_minor: u32,
    pub cells: Vec<Cell>,
}

impl Notebook {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn code_cells(&self) -> impl Iterator<Item = &CodeCell> {
        self.cells.iter().filter_map(|cell| match cell {
            Cell::Code(code) => Some(code),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum Cell {
    Markdown(MarkdownCell),
    Code(CodeCell),
    Raw(RawCell),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkdownCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: Text,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: Text,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub execution_count: Option<u32>,
    #[serde(default)]
    pub outputs: Vec<CellOutput>,
}

impl CodeCell {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: None,
            source: Text::Single(source.into()),
            metadata: Map::new(),
            execution_count: None,
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: Text,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// nbformat allows multiline strings either whole or split into lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Text {
    Single(String),
    Lines(Vec<String>),
}

impl Text {
    pub fn as_string(&self) -> String {
        match self {
            Text::Single(text) => text.clone(),
            Text::Lines(lines) => lines.concat(),
        }
    }
}

impl From<&str> for Text {
    fn from(text: &str) -> Self {
        Text::Single(text.to_string())
    }
}

/// An output as stored in a code cell. `clear_output`,
/// `update_display_data` and `done` only exist while executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum CellOutput {
    Stream {
        name: StreamName,
        text: Text,
    },
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    ExecuteResult {
        execution_count: Option<u32>,
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl CellOutput {
    pub fn from_event(event: OutputEvent) -> Option<Self> {
        match event {
            OutputEvent::Stream { name, text } => Some(CellOutput::Stream {
                name,
                text: Text::Single(text),
            }),
            OutputEvent::ExecuteResult {
                execution_count,
                data,
                metadata,
            } => Some(CellOutput::ExecuteResult {
                execution_count: Some(execution_count),
                data,
                metadata,
            }),
            OutputEvent::DisplayData { data, metadata, .. } => {
                Some(CellOutput::DisplayData { data, metadata })
            }
            OutputEvent::Error {
                ename,
                evalue,
                traceback,
            } => Some(CellOutput::Error {
                ename,
                evalue,
                traceback,
            }),
            OutputEvent::UpdateDisplayData { .. }
            | OutputEvent::ClearOutput { .. }
            | OutputEvent::Done => None,
        }
    }
}
