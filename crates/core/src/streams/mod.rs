//! Lecture streams: what should be recorded, and what has happened so far.

mod sqlite;
mod store;
mod types;

pub use sqlite::SqliteStreamStore;
pub use store::StreamStore;
pub use types::{
    DuePremiere, DueStream, NewStream, SourceState, SourceVariant, Stream, StreamSource,
};
