use std::collections::HashMap;

use cellrun_kernel::OutputEvent;
use serde_json::Value;
use tracing::debug;

use crate::document::{CellOutput, Text};

/// Accumulates the output events of one execution into the outputs a code
/// cell keeps.
#[derive(Debug, Default)]
pub struct OutputArea {
    outputs: Vec<CellOutput>,
    displays: HashMap<String, Vec<usize>>,
    clear_pending: bool,
}

impl OutputArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::ClearOutput { wait: true } => self.clear_pending = true,
            OutputEvent::ClearOutput { wait: false } => self.clear(),
            OutputEvent::UpdateDisplayData {
                data,
                metadata,
                transient,
            } => {
                let Some(display_id) = display_id(transient.as_ref()) else {
                    debug!("update_display_data without a display id");
                    return;
                };
                for &index in self.displays.get(display_id).into_iter().flatten() {
                    self.outputs[index] = CellOutput::DisplayData {
                        data: data.clone(),
                        metadata: metadata.clone(),
                    };
                }
            }
            OutputEvent::Done => {}
            event => {
                let display = match &event {
                    OutputEvent::DisplayData { transient, .. } => {
                        display_id(transient.as_ref()).map(str::to_string)
                    }
                    _ => None,
                };
                if let Some(output) = CellOutput::from_event(event) {
                    self.push(output, display);
                }
            }
        }
    }

    pub fn outputs(&self) -> &[CellOutput] {
        &self.outputs
    }

    pub fn into_outputs(self) -> Vec<CellOutput> {
        self.outputs
    }

    fn push(&mut self, output: CellOutput, display: Option<String>) {
        if self.clear_pending {
            self.clear();
        }

        if let (
            Some(CellOutput::Stream {
                name: last,
                text: existing,
            }),
            CellOutput::Stream { name, text },
        ) = (self.outputs.last_mut(), &output)
        {
            if *last == *name {
                *existing = Text::Single(existing.as_string() + &text.as_string());
                return;
            }
        }

        if let Some(display) = display {
            self.displays
                .entry(display)
                .or_default()
                .push(self.outputs.len());
        }
        self.outputs.push(output);
    }

    fn clear(&mut self) {
        self.outputs.clear();
        self.displays.clear();
        self.clear_pending = false;
    }
}

fn display_id(transient: Option<&Value>) -> Option<&str> {
    transient?.get("display_id")?.as_str()
}
