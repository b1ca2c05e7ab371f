use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::SendError};
use tracing::{error, trace};

use crate::message;

pub fn channel(capacity: usize) -> (CallerEnd, WorkerEnd) {
    let (request_sender, request_receiver) = mpsc::channel(capacity.max(1));
    let (event_sender, event_receiver) = mpsc::unbounded_channel();

    let caller = CallerEnd {
        request_sender,
        event_receiver,
    };
    let worker = WorkerEnd {
        request_receiver,
        outbox: Outbox {
            sender: event_sender,
        },
    };

    (caller, worker)
}

pub struct CallerEnd {
    request_sender: mpsc::Sender<Bytes>,
    event_receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl CallerEnd {
    pub async fn send(&self, frame: Bytes) -> Result<(), SendError<Bytes>> {
        self.request_sender.send(frame).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.event_receiver.recv().await
    }

    pub(crate) fn into_parts(self) -> (mpsc::Sender<Bytes>, mpsc::UnboundedReceiver<Bytes>) {
        (self.request_sender, self.event_receiver)
    }
}

pub struct WorkerEnd {
    request_receiver: mpsc::Receiver<Bytes>,
    outbox: Outbox,
}

impl WorkerEnd {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.request_receiver.recv().await
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }
}

/// Sending half of the engine-to-caller direction.
#[derive(Clone)]
pub struct Outbox {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl Outbox {
    pub fn post_frame(&self, frame: Bytes) {
        if self.sender.send(frame).is_err() {
            trace!("caller is gone, dropping frame");
        }
    }

    pub fn post<T: Serialize>(&self, message: &T) {
        match message::encode(message) {
            Ok(frame) => self.post_frame(frame),
            Err(e) => error!(error = %e, "could not encode message"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
