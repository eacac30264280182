use chrono::{DateTime, Duration, Utc};

use super::types::{DuePremiere, DueStream, NewStream, SourceVariant, Stream};
use crate::registry::StoreError;
use crate::silence::Silence;

/// Persistence for lecture streams and their per-source progress.
pub trait StreamStore: Send + Sync {
    fn create_stream(&self, stream: &NewStream) -> Result<i64, StoreError>;

    fn get_stream(&self, id: i64) -> Result<Option<Stream>, StoreError>;

    /// Streams starting within `lookahead` of `now` that have not ended and
    /// still have sources without a worker.
    fn due_streams(
        &self,
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Vec<DueStream>, StoreError>;

    /// Premieres starting within `lookahead` of `now` not yet dispatched.
    fn due_premieres(
        &self,
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Vec<DuePremiere>, StoreError>;

    /// Remember that a worker accepted a source, bound to `slot_name`.
    fn record_dispatch(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        worker_id: &str,
        slot_name: &str,
    ) -> Result<(), StoreError>;

    fn record_premiere_dispatch(
        &self,
        stream_id: i64,
        worker_id: &str,
        slot_name: &str,
    ) -> Result<(), StoreError>;

    fn set_live(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        live_url: &str,
    ) -> Result<(), StoreError>;

    fn set_finished(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn set_recording(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        path: &str,
        duration_secs: f64,
    ) -> Result<(), StoreError>;

    fn set_published(
        &self,
        stream_id: i64,
        variant: SourceVariant,
        vod_url: &str,
        thumbnail_url: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Replace the stored silence intervals of a stream.
    fn set_silences(&self, stream_id: i64, silences: &[Silence]) -> Result<(), StoreError>;
}
