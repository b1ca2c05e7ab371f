use std::{
    collections::HashMap,
    future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    sync::watch,
    task::{self, JoinHandle},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{KernelConfig, PackageConfig},
    imports::find_imports,
    lock::{Acquire, ExecutionGuard, ExecutionLock},
    message,
    repl::{Interpreter, InterpreterError, Publisher},
    transport::{Outbox, WorkerEnd},
    EngineStatus, OutputEvent, Request, RequestId, WorkerMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Executing(RequestId),
    Failed(String),
}

impl EngineState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, EngineState::Uninitialized | EngineState::Initializing)
    }
}

pub struct KernelHandle {
    state: watch::Receiver<EngineState>,
    task: JoinHandle<()>,
}

impl KernelHandle {
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Waits until initialization has either succeeded or failed.
    pub async fn settled(&mut self) -> EngineState {
        let settled = match self.state.wait_for(EngineState::is_settled).await {
            Ok(state) => Some(state.clone()),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| self.state())
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Starts the engine on its own task. Initialization runs first; requests
/// arriving meanwhile stay queued in the transport.
pub fn launch<I: Interpreter>(
    interpreter: I,
    config: KernelConfig,
    worker: WorkerEnd,
) -> KernelHandle {
    let (state_sender, state) = watch::channel(EngineState::Uninitialized);
    let task = task::spawn(run_kernel(interpreter, config, worker, state_sender));

    KernelHandle { state, task }
}

async fn run_kernel<I: Interpreter>(
    mut interpreter: I,
    config: KernelConfig,
    mut worker: WorkerEnd,
    state: watch::Sender<EngineState>,
) {
    let outbox = worker.outbox();
    state.send_replace(EngineState::Initializing);

    let kernel = match initialize(&mut interpreter, &config.packages).await {
        Ok(()) => {
            info!("kernel ready");
            state.send_replace(EngineState::Ready);
            outbox.post(&WorkerMessage::Status(EngineStatus::Ready));
            Ok(Arc::new(Kernel {
                lock: ExecutionLock::new(interpreter),
                outbox: outbox.clone(),
                state,
                in_flight: Mutex::new(HashMap::new()),
                timeout: config.execution_timeout(),
            }))
        }
        Err(e) => {
            error!(error = %e, "kernel initialization failed");
            let reason = e.to_string();
            state.send_replace(EngineState::Failed(reason.clone()));
            outbox.post(&WorkerMessage::Status(EngineStatus::Failed {
                reason: reason.clone(),
            }));
            Err(reason)
        }
    };

    while let Some(frame) = worker.recv().await {
        let request = match message::decode::<Request>(&frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognized request");
                continue;
            }
        };

        match (&kernel, request) {
            (Ok(kernel), Request::Execute { id, python }) => kernel.submit(id, python),
            (Ok(kernel), Request::Interrupt { interrupt }) => kernel.interrupt(interrupt),
            (Err(reason), Request::Execute { id, .. }) => {
                let mut publisher = Publisher::new(id, outbox.clone());
                publisher.post(OutputEvent::error("KernelInitError", reason.clone()));
                publisher.post(OutputEvent::Done);
            }
            (Err(_), Request::Interrupt { .. }) => {}
        }
    }

    debug!("caller disconnected, kernel loop stopped");
}

async fn initialize<I: Interpreter>(
    interpreter: &mut I,
    packages: &PackageConfig,
) -> Result<(), InterpreterError> {
    interpreter.boot().await?;
    interpreter.load_packages(&packages.preload).await?;
    interpreter.install_installer(&packages.installer_wheel).await?;
    interpreter.configure_index(&packages.index_urls).await?;

    for package in packages.kernel.iter().chain(&packages.extra) {
        debug!(package = %package, "installing package");
        interpreter.install(package).await?;
    }

    interpreter.attach_kernel().await
}

struct Kernel<I> {
    lock: ExecutionLock<I>,
    outbox: Outbox,
    state: watch::Sender<EngineState>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    timeout: Option<Duration>,
}

struct Exec<I> {
    id: RequestId,
    code: String,
    acquire: Acquire<I>,
    cancel: CancellationToken,
}

impl<I: Interpreter> Kernel<I> {
    fn submit(self: &Arc<Self>, id: RequestId, code: String) {
        // Queue position is taken here, in arrival order.
        let acquire = self.lock.acquire();
        let cancel = CancellationToken::new();
        self.in_flight().insert(id, cancel.clone());

        let exec = Exec {
            id,
            code,
            acquire,
            cancel,
        };
        let kernel = self.clone();
        let exec_task = task::spawn(async move { kernel.handle_exec(exec).await });

        let kernel = self.clone();
        task::spawn(async move {
            if let Err(e) = exec_task.await {
                if e.is_panic() {
                    kernel.recover_from_panic(id);
                }
            }
        });
    }

    /// Finishes a request whose task panicked while running. The guard was
    /// dropped during unwinding, so the lock has already moved on.
    fn recover_from_panic(&self, id: RequestId) {
        error!(request_id = %id, "execution panicked");
        let mut publisher = Publisher::new(id, self.outbox.clone());
        publisher.post(OutputEvent::error(
            "InterpreterError",
            "interpreter panicked during execution",
        ));
        publisher.post(OutputEvent::Done);

        self.in_flight().remove(&id);
        self.state.send_if_modified(|state| {
            let stale = *state == EngineState::Executing(id);
            if stale {
                *state = EngineState::Ready;
            }
            stale
        });
    }

    fn interrupt(&self, id: RequestId) {
        match self.in_flight().get(&id) {
            Some(cancel) => {
                info!(request_id = %id, "interrupting");
                cancel.cancel();
            }
            None => debug!(request_id = %id, "interrupt for unknown request"),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_exec(&self, exec: Exec<I>) {
        let Exec {
            id,
            code,
            acquire,
            cancel,
        } = exec;
        let mut publisher = Publisher::new(id, self.outbox.clone());

        let Ok(mut interpreter) = acquire.cancellable(&cancel).await else {
            debug!(request_id = %id, "interrupted while queued");
            publisher.post(interrupted());
            publisher.post(OutputEvent::Done);
            self.in_flight().remove(&id);
            return;
        };

        self.state.send_replace(EngineState::Executing(id));
        debug!(request_id = %id, "executing");

        if let Some(error) = self
            .execute(&mut interpreter, &code, &mut publisher, &cancel)
            .await
        {
            publisher.post(error);
        }
        publisher.post(OutputEvent::Done);

        self.in_flight().remove(&id);
        self.state.send_replace(EngineState::Ready);
        interpreter.release();
        debug!(request_id = %id, "done");
    }

    /// Returns the error event to report, if any.
    async fn execute(
        &self,
        interpreter: &mut ExecutionGuard<I>,
        code: &str,
        publisher: &mut Publisher,
        cancel: &CancellationToken,
    ) -> Option<OutputEvent> {
        let modules = find_imports(code);
        if !modules.is_empty() {
            if let Err(e) = interpreter.load_packages_for_imports(&modules).await {
                warn!(request_id = %publisher.id(), error = %e, "loading imported packages failed");
                return Some(OutputEvent::error("PackageLoadError", e.to_string()));
            }
        }

        let timeout = self.timeout;
        let outcome = tokio::select! {
            outcome = interpreter.run(code, publisher) => outcome,
            _ = cancel.cancelled() => return Some(interrupted()),
            _ = deadline(timeout) => {
                let elapsed = timeout.unwrap_or_default();
                return Some(OutputEvent::error(
                    "TimeoutError",
                    format!("execution exceeded {} ms", elapsed.as_millis()),
                ));
            }
        };

        match outcome {
            Ok(reply) => error_from_reply(reply.into_json()),
            Err(e) => {
                warn!(error = %e, "interpreter fault");
                Some(OutputEvent::error("InterpreterError", e.to_string()))
            }
        }
    }
}

fn interrupted() -> OutputEvent {
    OutputEvent::error("KeyboardInterrupt", "execution was interrupted")
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => sleep(timeout).await,
        None => future::pending::<()>().await,
    }
}

fn error_from_reply(reply: Value) -> Option<OutputEvent> {
    if reply.get("status").and_then(Value::as_str) != Some("error") {
        return None;
    }

    let text = |key: &str| {
        reply
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let traceback = reply
        .get("traceback")
        .and_then(Value::as_array)
        .map(|frames| {
            frames
                .iter()
                .map(|frame| match frame {
                    Value::String(line) => line.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(OutputEvent::Error {
        ename: text("ename"),
        evalue: text("evalue"),
        traceback,
    })
}
