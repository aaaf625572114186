//! Observer trait for run events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::PipelineConfigBuilder::observer`] to follow a run as it
//! moves through its phases and slices.
//!
//! # Example
//!
//! ```rust
//! use edgequake_bookmeta::{PipelineConfig, PipelineObserver, Phase};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct SliceCounter {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineObserver for SliceCounter {
//!     fn on_slice_complete(&self, document_id: &str, index: usize, total: usize) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{document_id}: slice {}/{} ({n} done)", index + 1, total);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .observer(Arc::new(SliceCounter { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::state::Phase;
use std::sync::Arc;

/// Called by the orchestrator as a run progresses.
///
/// All methods default to no-ops. With `run_batch`, events from different
/// documents arrive concurrently; use atomics or a `Mutex` for shared state.
pub trait PipelineObserver: Send + Sync {
    /// Called once the document has been opened.
    fn on_run_start(&self, document_id: &str, page_count: usize) {
        let _ = (document_id, page_count);
    }

    /// Called on every state transition.
    fn on_phase(&self, document_id: &str, phase: Phase) {
        let _ = (document_id, phase);
    }

    /// Called before a slice is cut and sent to the model.
    ///
    /// * `index`: 0-based position in the slicing plan
    /// * `range`: 1-based inclusive page range, e.g. `"11-20"`
    fn on_slice_start(&self, document_id: &str, index: usize, total: usize, range: &str) {
        let _ = (document_id, index, total, range);
    }

    /// Called when a slice produced a batch.
    fn on_slice_complete(&self, document_id: &str, index: usize, total: usize) {
        let _ = (document_id, index, total);
    }

    /// Called when a slice was recorded as failed.
    fn on_slice_error(&self, document_id: &str, index: usize, total: usize, error: &str) {
        let _ = (document_id, index, total, error);
    }

    /// Called once with the terminal phase (`Persisted` or `Failed`).
    fn on_run_complete(&self, document_id: &str, phase: Phase) {
        let _ = (document_id, phase);
    }
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Type stored in [`crate::config::PipelineConfig`].
pub type Observer = Arc<dyn PipelineObserver>;
