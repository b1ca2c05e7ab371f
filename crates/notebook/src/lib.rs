pub mod document;
pub mod output;
pub mod session;

pub use document::{Cell, CellOutput, CodeCell, MarkdownCell, Notebook, RawCell, Text};
pub use output::OutputArea;
pub use session::{NotebookSession, SessionError};
