use async_trait::async_trait;
use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    transport::Outbox, value::NativeValue, OutputEvent, RequestId, StreamName, WorkerMessage,
};

/// Implementations never see two runs at the same time.
#[async_trait]
pub trait Interpreter: Send + 'static {
    async fn boot(&mut self) -> Result<(), InterpreterError>;

    async fn load_packages(&mut self, names: &[String]) -> Result<(), InterpreterError>;

    /// Installs the package-manager bridge from a wheel.
    async fn install_installer(&mut self, _wheel_url: &str) -> Result<(), InterpreterError> {
        Ok(())
    }

    async fn configure_index(&mut self, _urls: &[String]) -> Result<(), InterpreterError> {
        Ok(())
    }

    async fn install(&mut self, name: &str) -> Result<(), InterpreterError>;

    /// Acquires the kernel, stream and display objects used by `run`.
    async fn attach_kernel(&mut self) -> Result<(), InterpreterError>;

    /// Makes sure the packages providing `modules` are loaded. Modules that
    /// are already importable are left alone.
    async fn load_packages_for_imports(&mut self, modules: &[String])
        -> Result<(), InterpreterError>;

    /// Runs `code` to completion. Output produced while running goes through
    /// `publisher`. The returned value is the kernel's reply; a `status` of
    /// `"error"` with `ename`, `evalue` and `traceback` reports an uncaught
    /// exception.
    async fn run(
        &mut self,
        code: &str,
        publisher: &mut Publisher,
    ) -> Result<NativeValue, InterpreterError>;
}

#[derive(Error, Debug)]
pub enum InterpreterError {
    #[error("runtime failed to boot: {0}")]
    Boot(String),
    #[error("could not install package {package}: {reason}")]
    Install { package: String, reason: String },
    #[error("kernel objects unavailable: {0}")]
    Attach(String),
    #[error("interpreter fault: {0}")]
    Run(String),
}

impl InterpreterError {
    pub fn install(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Install {
            package: package.into(),
            reason: reason.into(),
        }
    }
}

/// Output hooks for one request.
pub struct Publisher {
    id: RequestId,
    outbox: Outbox,
    result_published: bool,
}

impl Publisher {
    pub(crate) fn new(id: RequestId, outbox: Outbox) -> Self {
        Self {
            id,
            outbox,
            result_published: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn stream(&mut self, name: StreamName, text: impl Into<String>) {
        self.post(OutputEvent::Stream {
            name,
            text: text.into(),
        });
    }

    /// Publishes the value of the final expression. Only the first call per
    /// request is forwarded.
    pub fn execute_result(
        &mut self,
        execution_count: u32,
        data: NativeValue,
        metadata: NativeValue,
    ) {
        if self.result_published {
            warn!(request_id = %self.id, "dropping extra execute result");
            return;
        }
        self.result_published = true;

        self.post(OutputEvent::ExecuteResult {
            execution_count,
            data: data.into_bundle(),
            metadata: metadata.into_bundle(),
        });
    }

    pub fn display_data(
        &mut self,
        data: NativeValue,
        metadata: NativeValue,
        transient: NativeValue,
    ) {
        self.post(OutputEvent::DisplayData {
            data: data.into_bundle(),
            metadata: metadata.into_bundle(),
            transient: transient_field(transient),
        });
    }

    pub fn update_display_data(
        &mut self,
        data: NativeValue,
        metadata: NativeValue,
        transient: NativeValue,
    ) {
        self.post(OutputEvent::UpdateDisplayData {
            data: data.into_bundle(),
            metadata: metadata.into_bundle(),
            transient: transient_field(transient),
        });
    }

    pub fn clear_output(&mut self, wait: bool) {
        self.post(OutputEvent::ClearOutput { wait });
    }

    pub(crate) fn post(&mut self, event: OutputEvent) {
        trace!(request_id = %self.id, ?event, "posting output");
        self.outbox.post(&WorkerMessage::Output { id: self.id, event });
    }
}

fn transient_field(transient: NativeValue) -> Option<serde_json::Value> {
    match transient.into_json() {
        serde_json::Value::Null => None,
        value => Some(value),
    }
}
