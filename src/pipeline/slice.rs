//! Document slicing: cut a page range out of the source into its own PDF.
//!
//! pdfium is not async-safe, so every call runs inside
//! `tokio::task::spawn_blocking` and binds, opens, works and closes within
//! that one closure. Only one range's pages are ever decoded at a time and
//! the source handle is dropped before the call returns.
//!
//! Slices live in their own `TempDir`; dropping a [`DocumentSlice`] removes
//! the file, so a phase that bails out early cannot leak one.

use crate::error::SliceError;
use crate::model::PageRange;
use crate::pipeline::source::SourceDocument;
use futures::future::BoxFuture;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;

/// Page-level access to a paginated document.
///
/// [`PdfiumBackend`] is the production implementation; tests substitute
/// an in-memory fake.
pub trait DocumentBackend: Send + Sync {
    fn page_count<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<usize, SliceError>>;

    /// Text of the given 0-based pages, in the order requested. Pages without
    /// a text layer yield an empty string.
    fn page_texts<'a>(
        &'a self,
        path: &'a Path,
        pages: &'a [usize],
    ) -> BoxFuture<'a, Result<Vec<String>, SliceError>>;

    /// Write `range` of the document at `path` as a standalone PDF at `dest`.
    fn write_slice<'a>(
        &'a self,
        path: &'a Path,
        range: PageRange,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), SliceError>>;
}

/// [`DocumentBackend`] over the pdfium C++ library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
}

impl PdfiumBackend {
    /// Bind to the library named by `PDFIUM_LIB_PATH`, else the system one.
    pub fn from_env() -> Self {
        Self {
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }
}

pub(crate) fn bind_pdfium(library_path: Option<&Path>) -> Result<Pdfium, SliceError> {
    let bindings = match library_path {
        Some(p) => Pdfium::bind_to_library(p),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| SliceError::Binding(e.to_string()))?;
    Ok(Pdfium::new(bindings))
}

fn corrupt(path: &Path, e: impl std::fmt::Debug) -> SliceError {
    SliceError::CorruptSource {
        path: path.to_path_buf(),
        detail: format!("{:?}", e),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, SliceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SliceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SliceError::Binding(format!("pdfium task panicked: {}", e)))?
}

impl DocumentBackend for PdfiumBackend {
    fn page_count<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<usize, SliceError>> {
        let lib = self.library_path.clone();
        let path = path.to_path_buf();
        Box::pin(blocking(move || {
            let pdfium = bind_pdfium(lib.as_deref())?;
            let document = pdfium
                .load_pdf_from_file(&path, None)
                .map_err(|e| corrupt(&path, e))?;
            let count = document.pages().len() as usize;
            Ok(count)
        }))
    }

    fn page_texts<'a>(
        &'a self,
        path: &'a Path,
        pages: &'a [usize],
    ) -> BoxFuture<'a, Result<Vec<String>, SliceError>> {
        let lib = self.library_path.clone();
        let path = path.to_path_buf();
        let indices = pages.to_vec();
        Box::pin(blocking(move || {
            let pdfium = bind_pdfium(lib.as_deref())?;
            let document = pdfium
                .load_pdf_from_file(&path, None)
                .map_err(|e| corrupt(&path, e))?;
            let doc_pages = document.pages();
            let total = doc_pages.len() as usize;

            let mut texts = Vec::with_capacity(indices.len());
            for idx in indices {
                if idx >= total {
                    texts.push(String::new());
                    continue;
                }
                let text = doc_pages
                    .get(idx as u16)
                    .ok()
                    .and_then(|page| page.text().ok().map(|t| t.all()))
                    .unwrap_or_default();
                texts.push(text);
            }
            Ok(texts)
        }))
    }

    fn write_slice<'a>(
        &'a self,
        path: &'a Path,
        range: PageRange,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), SliceError>> {
        let lib = self.library_path.clone();
        let path = path.to_path_buf();
        let dest = dest.to_path_buf();
        Box::pin(blocking(move || {
            let io = |e: PdfiumError| SliceError::Io {
                range,
                detail: format!("{:?}", e),
            };
            let pdfium = bind_pdfium(lib.as_deref())?;
            let source = pdfium
                .load_pdf_from_file(&path, None)
                .map_err(|e| corrupt(&path, e))?;
            let total = source.pages().len() as usize;
            if range.end >= total {
                return Err(SliceError::OutOfRange { range, total });
            }
            let mut slice = pdfium.create_new_pdf().map_err(io)?;
            slice
                .pages_mut()
                .copy_page_range_from_document(&source, range.start as u16..=range.end as u16, 0)
                .map_err(io)?;
            slice.save_to_file(&dest).map_err(io)?;
            Ok(())
        }))
    }
}

/// A page range written to its own file. Removed from disk on drop.
#[derive(Debug)]
pub struct DocumentSlice {
    pub range: PageRange,
    pub path: PathBuf,
    _dir: TempDir,
}

impl DocumentSlice {
    pub fn page_count(&self) -> usize {
        self.range.len()
    }
}

/// Cuts [`DocumentSlice`]s out of a [`SourceDocument`].
#[derive(Clone)]
pub struct Slicer {
    backend: Arc<dyn DocumentBackend>,
}

impl Slicer {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Write `range` of `document` to a fresh temporary file.
    pub async fn slice(&self, document: &SourceDocument, range: PageRange) -> Result<DocumentSlice, SliceError> {
        if range.end >= document.page_count {
            return Err(SliceError::OutOfRange {
                range,
                total: document.page_count,
            });
        }
        let dir = tempfile::Builder::new()
            .prefix("bookmeta-slice-")
            .tempdir()
            .map_err(|e| SliceError::Io {
                range,
                detail: e.to_string(),
            })?;
        let path = dir
            .path()
            .join(format!("{}_p{}-{}.pdf", document.document_id_slug(), range.start + 1, range.end + 1));

        self.backend
            .write_slice(document.working_path(), range, &path)
            .await?;
        debug!("Sliced {} pages {} → {}", document.document_id, range, path.display());

        Ok(DocumentSlice {
            range,
            path,
            _dir: dir,
        })
    }
}
