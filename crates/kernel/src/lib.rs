pub mod client;
pub mod config;
pub mod correlation;
pub mod imports;
pub mod kernel;
pub mod lock;
pub mod message;
pub mod repl;
pub mod transport;
pub mod value;

pub use client::{Client, ClientError, Execution};
pub use config::{ConfigError, KernelConfig, PackageConfig};
pub use kernel::{EngineState, KernelHandle};
pub use message::{
    EngineStatus, MimeBundle, OutputEvent, Request, RequestId, StreamName, WorkerMessage,
};
pub use repl::{Interpreter, InterpreterError, Publisher};
pub use value::NativeValue;

/// Launches an engine around `interpreter` and connects a client to it.
///
/// Must be called from within a Tokio runtime.
pub fn start<I: Interpreter>(interpreter: I, config: KernelConfig) -> (Client, KernelHandle) {
    let (caller, worker) = transport::channel(config.queue_capacity);
    let handle = kernel::launch(interpreter, config, worker);

    (Client::connect(caller), handle)
}
