#![allow(dead_code)]

use std::time::Duration;

use cellrun_kernel::{Client, EngineState, KernelHandle, OutputEvent, StreamName};
use tokio::time::timeout;

/// Runs `code` and returns its outputs, failing the test instead of hanging.
pub async fn run(client: &Client, code: &str) -> Vec<OutputEvent> {
    let execution = client.submit(code).await.unwrap();

    timeout(Duration::from_secs(5), execution.collect())
        .await
        .expect("execution did not finish")
        .unwrap()
}

pub async fn wait_for_execution(handle: &KernelHandle) {
    let mut state = handle.watch_state();
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, EngineState::Executing(_))),
    )
    .await
    .expect("engine never started executing")
    .unwrap();
}

pub fn stdout(text: &str) -> OutputEvent {
    OutputEvent::Stream {
        name: StreamName::Stdout,
        text: text.to_string(),
    }
}

/// Exception names of the error events among `outputs`.
pub fn enames(outputs: &[OutputEvent]) -> Vec<&str> {
    outputs
        .iter()
        .filter_map(|event| match event {
            OutputEvent::Error { ename, .. } => Some(ename.as_str()),
            _ => None,
        })
        .collect()
}
