//! Slice extraction: upload → generate → delete → parse.
//!
//! Upload and generation each run under the extraction [`RetryPolicy`].
//! The uploaded file is deleted exactly once after generation finishes,
//! whatever the outcome; a failed delete is logged and otherwise ignored
//! (the provider expires the file on its own). Parse failures are never
//! retried: asking again for the same pages rarely fixes a schema error
//! and costs another full upload.

use crate::config::PipelineConfig;
use crate::error::{ExtractionFailure, ModelError};
use crate::pipeline::response::{parse_extraction, ExtractionBatch};
use crate::pipeline::slice::Slicer;
use crate::pipeline::source::SourceDocument;
use crate::prompts::extraction_instructions;
use crate::retry::{call_with_policy, Exhausted, RetryPolicy};
use crate::state::{SliceJob, SliceOutcome};
use crate::vision::{GenerationRequest, VisionModel};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Slices are always PDF: DjVu sources are converted when opened.
const SLICE_MIME: &str = "application/pdf";

/// Drives one [`VisionModel`] under the extraction retry policy.
#[derive(Clone)]
pub struct ExtractionClient {
    model: Arc<dyn VisionModel>,
    policy: RetryPolicy,
    temperature: f32,
    max_output_tokens: usize,
}

impl std::fmt::Debug for ExtractionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionClient")
            .field("model", &self.model.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ExtractionClient {
    pub fn new(model: Arc<dyn VisionModel>, config: &PipelineConfig) -> Self {
        Self {
            model,
            policy: config.extraction_retry,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Ask one question, optionally about one attached PDF.
    ///
    /// The attachment is uploaded, used, and deleted within this call.
    pub async fn ask(
        &self,
        attachment: Option<&Path>,
        instructions: &str,
        label: &str,
    ) -> Result<String, Exhausted<ModelError>> {
        let mut files = Vec::with_capacity(1);
        if let Some(path) = attachment {
            let upload_label = format!("{} upload", label);
            let remote = call_with_policy(&self.policy, &upload_label, |_| self.model.upload(path, SLICE_MIME)).await?;
            files.push(remote);
        }

        let result = call_with_policy(&self.policy, label, |_| {
            self.model.generate(GenerationRequest {
                files: &files,
                instructions,
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            })
        })
        .await;

        for file in &files {
            match self.model.delete(file).await {
                Ok(()) => debug!("{}: deleted {}", label, file.name),
                Err(e) => warn!("{}: could not delete {}: {}", label, file.name, e),
            }
        }
        result
    }

    /// Extract one already-written slice.
    pub async fn extract(&self, slice_path: &Path, job: &SliceJob) -> Result<ExtractionBatch, ExtractionFailure> {
        let label = format!("slice {}", job.range);
        let instructions = extraction_instructions(job.range.purpose);
        let raw = self
            .ask(Some(slice_path), &instructions, &label)
            .await
            .map_err(|e| ExtractionFailure::ModelFailed {
                range: job.range,
                attempts: e.attempts,
                detail: e.error.to_string(),
            })?;
        parse_extraction(&raw, job.range, job.chunk)
    }
}

/// Slice and extract one job. Never fails: errors become
/// [`SliceOutcome::Failed`].
pub async fn run_job(
    slicer: &Slicer,
    client: &ExtractionClient,
    document: &SourceDocument,
    job: SliceJob,
) -> SliceOutcome {
    let slice = match slicer.slice(document, job.range).await {
        Ok(slice) => slice,
        Err(e) => {
            return SliceOutcome::Failed {
                job,
                failure: ExtractionFailure::SliceFailed {
                    range: job.range,
                    detail: e.to_string(),
                },
            }
        }
    };
    match client.extract(&slice.path, &job).await {
        Ok(batch) => SliceOutcome::Batch { job, batch },
        Err(failure) => SliceOutcome::Failed { job, failure },
    }
    // `slice` drops here and removes its temporary file.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PageRange, RangePurpose};
    use crate::vision::RemoteFile;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted model: pops generate results in order, counts lifecycle calls.
    struct Scripted {
        replies: Mutex<Vec<Result<String, ModelError>>>,
        uploads: AtomicUsize,
        generates: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<String, ModelError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                uploads: AtomicUsize::new(0),
                generates: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            }
        }
    }

    impl VisionModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn upload<'a>(&'a self, _path: &'a Path, mime: &'a str) -> BoxFuture<'a, Result<RemoteFile, ModelError>> {
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(RemoteFile {
                    name: format!("files/{}", n),
                    uri: format!("mem://{}", n),
                    mime_type: mime.to_string(),
                    expires_at: None,
                })
            })
        }
        fn generate<'a>(&'a self, _r: GenerationRequest<'a>) -> BoxFuture<'a, Result<String, ModelError>> {
            self.generates.fetch_add(1, Ordering::SeqCst);
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ModelError::Malformed { detail: "script exhausted".into() }));
            Box::pin(async move { next })
        }
        fn delete<'a>(&'a self, _f: &'a RemoteFile) -> BoxFuture<'a, Result<(), ModelError>> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn client(model: Arc<Scripted>) -> ExtractionClient {
        let config = PipelineConfig::builder()
            .extraction_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 2.0,
                jitter: Duration::ZERO,
                timeout: Duration::from_secs(5),
            })
            .build()
            .unwrap();
        ExtractionClient::new(model, &config)
    }

    fn bib_job() -> SliceJob {
        SliceJob {
            index: 0,
            range: PageRange::new(100, 109, RangePurpose::Bibliography),
            chunk: 2,
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_and_file_deleted_once() {
        let model = Arc::new(Scripted::new(vec![
            Err(ModelError::Transient { status: Some(503), detail: "overloaded".into() }),
            Ok(r#"{"citations": [{"raw_text": "Kelley, General Topology, 1955"}]}"#.into()),
        ]));
        let batch = client(model.clone()).extract(Path::new("/tmp/x.pdf"), &bib_job()).await.unwrap();
        assert_eq!(batch.citations.len(), 1);
        assert_eq!(batch.citations[0].chunk, 2);
        assert_eq!(model.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(model.generates.load(Ordering::SeqCst), 2);
        assert_eq!(model.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parse_failure_is_not_retried() {
        let model = Arc::new(Scripted::new(vec![Ok("I could not read the pages.".into())]));
        let err = client(model.clone()).extract(Path::new("/tmp/x.pdf"), &bib_job()).await.unwrap_err();
        assert!(matches!(err, ExtractionFailure::ParseFailure { .. }));
        assert_eq!(model.generates.load(Ordering::SeqCst), 1);
        assert_eq!(model.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let transient = || Err(ModelError::Transient { status: None, detail: "reset".into() });
        let model = Arc::new(Scripted::new(vec![transient(), transient(), transient()]));
        let err = client(model.clone()).extract(Path::new("/tmp/x.pdf"), &bib_job()).await.unwrap_err();
        match err {
            ExtractionFailure::ModelFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(model.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn text_only_question_uploads_nothing() {
        let model = Arc::new(Scripted::new(vec![Ok("{}".into())]));
        let out = client(model.clone()).ask(None, "resolve", "reflection").await.unwrap();
        assert_eq!(out, "{}");
        assert_eq!(model.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(model.deletes.load(Ordering::SeqCst), 0);
    }
}
