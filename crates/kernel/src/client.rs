use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::{self, JoinHandle},
    time,
};
use tracing::{debug, info, trace, warn};

use crate::{
    correlation::RequestIds,
    message,
    transport::CallerEnd,
    EngineStatus, OutputEvent, Request, RequestId, WorkerMessage,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("engine channel is closed")]
    Disconnected,
    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("engine failed to initialize: {0}")]
    EngineFailed(String),
    #[error("request {0} timed out")]
    TimedOut(RequestId),
    #[error("request {0} ended without a done event")]
    Closed(RequestId),
}

type Routes = Arc<Mutex<HashMap<RequestId, mpsc::UnboundedSender<OutputEvent>>>>;

fn lock_routes(
    routes: &Routes,
) -> MutexGuard<'_, HashMap<RequestId, mpsc::UnboundedSender<OutputEvent>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Client {
    requests: mpsc::Sender<Bytes>,
    ids: RequestIds,
    routes: Routes,
    status: watch::Receiver<Option<EngineStatus>>,
    dispatcher: JoinHandle<()>,
}

impl Client {
    pub fn connect(caller: CallerEnd) -> Self {
        let (requests, events) = caller.into_parts();
        let routes = Routes::default();
        let (status_sender, status) = watch::channel(None);

        let dispatcher = task::spawn(dispatch(events, routes.clone(), status_sender));

        Self {
            requests,
            ids: RequestIds::new(),
            routes,
            status,
            dispatcher,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.status.borrow(), Some(EngineStatus::Ready))
    }

    pub async fn ready(&self) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(Option::is_some)
            .await
            .map(|current| current.clone())
            .map_err(|_| ClientError::Disconnected)?;

        match settled {
            Some(EngineStatus::Ready) => Ok(()),
            Some(EngineStatus::Failed { reason }) => Err(ClientError::EngineFailed(reason)),
            None => Err(ClientError::Disconnected),
        }
    }

    pub async fn submit(&self, code: impl Into<String>) -> Result<Execution, ClientError> {
        let id = self.ids.allocate();
        let frame = message::encode(&Request::Execute {
            id,
            python: code.into(),
        })?;

        // Subscribe before sending so no event can be missed.
        let (sender, events) = mpsc::unbounded_channel();
        lock_routes(&self.routes).insert(id, sender);

        if self.requests.send(frame).await.is_err() {
            lock_routes(&self.routes).remove(&id);
            return Err(ClientError::Disconnected);
        }
        debug!(request_id = %id, "submitted");

        Ok(Execution {
            id,
            events,
            routes: self.routes.clone(),
            done: false,
        })
    }

    pub async fn execute<F>(
        &self,
        code: impl Into<String>,
        mut on_output: F,
    ) -> Result<RequestId, ClientError>
    where
        F: FnMut(OutputEvent),
    {
        let mut execution = self.submit(code).await?;
        while let Some(event) = execution.next().await {
            on_output(event);
        }

        execution.finish()
    }

    /// Like [`Client::execute`], but interrupts the request and gives up
    /// once `timeout` has passed.
    pub async fn execute_with_timeout<F>(
        &self,
        code: impl Into<String>,
        timeout: Duration,
        mut on_output: F,
    ) -> Result<RequestId, ClientError>
    where
        F: FnMut(OutputEvent),
    {
        let mut execution = self.submit(code).await?;
        let id = execution.id();

        let drained = time::timeout(timeout, async {
            while let Some(event) = execution.next().await {
                on_output(event);
            }
        })
        .await;

        match drained {
            Ok(()) => execution.finish(),
            Err(_) => {
                warn!(request_id = %id, ?timeout, "request timed out");
                drop(execution);
                self.interrupt(id).await?;
                Err(ClientError::TimedOut(id))
            }
        }
    }

    pub async fn interrupt(&self, id: RequestId) -> Result<(), ClientError> {
        let frame = message::encode(&Request::Interrupt { interrupt: id })?;
        self.requests
            .send(frame)
            .await
            .map_err(|_| ClientError::Disconnected)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dispatcher.abort();
        lock_routes(&self.routes).clear();
    }
}

/// Events of one submitted request, in emission order.
#[derive(Debug)]
pub struct Execution {
    id: RequestId,
    events: mpsc::UnboundedReceiver<OutputEvent>,
    routes: Routes,
    done: bool,
}

impl Execution {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next output event, or `None` once the request is done or the engine
    /// went away. `done` itself is never returned.
    pub async fn next(&mut self) -> Option<OutputEvent> {
        if self.done {
            return None;
        }

        match self.events.recv().await {
            Some(OutputEvent::Done) => {
                self.done = true;
                None
            }
            event => event,
        }
    }

    pub async fn collect(mut self) -> Result<Vec<OutputEvent>, ClientError> {
        let mut outputs = Vec::new();
        while let Some(event) = self.next().await {
            outputs.push(event);
        }

        self.finish().map(|_| outputs)
    }

    fn finish(&self) -> Result<RequestId, ClientError> {
        if self.done {
            Ok(self.id)
        } else {
            Err(ClientError::Closed(self.id))
        }
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        lock_routes(&self.routes).remove(&self.id);
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<Bytes>,
    routes: Routes,
    status: watch::Sender<Option<EngineStatus>>,
) {
    while let Some(frame) = events.recv().await {
        match message::decode::<WorkerMessage>(&frame) {
            Ok(WorkerMessage::Output { id, event }) => route(&routes, id, event),
            Ok(WorkerMessage::Status(engine_status)) => {
                match &engine_status {
                    EngineStatus::Ready => info!("engine ready"),
                    EngineStatus::Failed { reason } => warn!(%reason, "engine failed"),
                }
                status.send_replace(Some(engine_status));
            }
            Err(e) => debug!(error = %e, "discarding unrecognized message"),
        }
    }

    debug!("engine closed the channel");
    // Pending executions observe the end of their stream.
    lock_routes(&routes).clear();
}

fn route(routes: &Routes, id: RequestId, event: OutputEvent) {
    let mut routes = lock_routes(routes);
    let done = event.is_done();

    let Some(subscriber) = routes.get(&id) else {
        trace!(request_id = %id, "no listener, discarding event");
        return;
    };
    if subscriber.send(event).is_err() {
        trace!(request_id = %id, "listener went away");
    }

    if done {
        routes.remove(&id);
    }
}
