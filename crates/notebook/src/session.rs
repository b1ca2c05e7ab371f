use cellrun_kernel::{Client, ClientError, RequestId};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    document::{Cell, CodeCell, Notebook},
    output::OutputArea,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("cell {0} does not exist")]
    NoSuchCell(usize),
    #[error("cell {0} is not a code cell")]
    NotCode(usize),
}

/// Runs notebook cells against one engine.
///
/// Every cell run takes the next value of a counter shared across the whole
/// session, the number shown next to the cell.
pub struct NotebookSession {
    client: Client,
    next_count: u32,
}

impl NotebookSession {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            next_count: 1,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The count the next cell run will get.
    pub fn next_count(&self) -> u32 {
        self.next_count
    }

    /// Runs `cell`, replacing its outputs with the ones this run produces.
    ///
    /// The outputs collected so far are kept on the cell even when the run
    /// ends with an error.
    pub async fn run_cell(&mut self, cell: &mut CodeCell) -> Result<RequestId, SessionError> {
        cell.execution_count = Some(self.next_count);
        self.next_count += 1;
        cell.outputs.clear();

        let mut area = OutputArea::new();
        let result = self
            .client
            .execute(cell.source.as_string(), |event| area.apply(event))
            .await;
        cell.outputs = area.into_outputs();

        let id = result?;
        debug!(request_id = %id, count = ?cell.execution_count, "cell finished");
        Ok(id)
    }

    pub async fn run_at(
        &mut self,
        notebook: &mut Notebook,
        index: usize,
    ) -> Result<RequestId, SessionError> {
        match notebook.cells.get_mut(index) {
            Some(Cell::Code(cell)) => self.run_cell(cell).await,
            Some(_) => Err(SessionError::NotCode(index)),
            None => Err(SessionError::NoSuchCell(index)),
        }
    }

    /// Runs every code cell of `notebook` from top to bottom, stopping at
    /// the first cell the engine could not run.
    pub async fn run_all(
        &mut self,
        notebook: &mut Notebook,
    ) -> Result<Vec<RequestId>, SessionError> {
        let mut ids = Vec::new();
        for cell in &mut notebook.cells {
            if let Cell::Code(cell) = cell {
                ids.push(self.run_cell(cell).await?);
            }
        }

        info!(cells = ids.len(), "notebook run finished");
        Ok(ids)
    }
}
