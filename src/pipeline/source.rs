//! Source resolution: validate an input path and open it as a [`SourceDocument`].
//!
//! The format is decided by magic bytes, never by extension: `%PDF` for PDF,
//! `AT&T` for DjVu. DjVu sources are converted to PDF once per run with
//! `ddjvu` (into a `TempDir` owned by the document) and their text layer is
//! read with `djvutxt`, because pdfium can neither open nor read them.
//!
//! The SHA-256 fingerprint is computed by streaming the file in 64 KiB
//! blocks; the document body is never held in memory.

use crate::error::PipelineError;
use crate::model::{DocumentFormat, DocumentKind};
use crate::pipeline::slice::DocumentBackend;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

/// Pages sampled to decide whether a document has a text layer.
const KIND_SAMPLE_PAGES: usize = 12;

/// Immutable handle to the document of one run.
#[derive(Debug)]
pub struct SourceDocument {
    pub document_id: String,
    /// Path the caller supplied.
    pub path: PathBuf,
    pub format: DocumentFormat,
    pub kind: DocumentKind,
    pub page_count: usize,
    /// SHA-256 of the original file, lower-case hex.
    pub fingerprint: String,
    /// PDF used for text and slicing (the converted file for DjVu).
    working_path: PathBuf,
    /// `djvutxt` output, one entry per page.
    sidecar_text: Option<Arc<Vec<String>>>,
    _workdir: Option<TempDir>,
}

impl SourceDocument {
    /// Validate, fingerprint and open `path`.
    pub async fn open(
        path: &Path,
        document_id: &str,
        backend: &dyn DocumentBackend,
        scanned_chars_per_page: usize,
    ) -> Result<Self, PipelineError> {
        let format = detect_format(path)?;
        let fingerprint = fingerprint_file(path).await?;

        let (working_path, sidecar_text, workdir) = match format {
            DocumentFormat::Pdf => (path.to_path_buf(), None, None),
            DocumentFormat::Djvu => {
                let workdir = tempfile::Builder::new()
                    .prefix("bookmeta-djvu-")
                    .tempdir()
                    .map_err(|e| PipelineError::Internal(e.to_string()))?;
                let pdf = convert_djvu(path, workdir.path()).await?;
                let text = djvu_text(path).await;
                (pdf, text.map(Arc::new), Some(workdir))
            }
        };

        let page_count = backend
            .page_count(&working_path)
            .await
            .map_err(|e| PipelineError::Unreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        let mut doc = Self {
            document_id: document_id.to_string(),
            path: path.to_path_buf(),
            format,
            kind: DocumentKind::TextLayer,
            page_count,
            fingerprint,
            working_path,
            sidecar_text,
            _workdir: workdir,
        };

        let sample = sample_pages(page_count, KIND_SAMPLE_PAGES);
        let texts = doc.page_texts(backend, &sample).await.unwrap_or_default();
        doc.kind = classify_kind(&texts, scanned_chars_per_page);

        info!(
            "Opened {} ({:?}, {:?}, {} pages, sha256 {}…)",
            doc.path.display(),
            doc.format,
            doc.kind,
            doc.page_count,
            &doc.fingerprint[..12.min(doc.fingerprint.len())]
        );
        Ok(doc)
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Filesystem-safe form of the document id.
    pub fn document_id_slug(&self) -> String {
        self.document_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .take(48)
            .collect()
    }

    pub fn has_text_layer(&self) -> bool {
        self.kind == DocumentKind::TextLayer
    }

    /// Text of the given pages; the `djvutxt` sidecar wins when present.
    pub async fn page_texts(
        &self,
        backend: &dyn DocumentBackend,
        pages: &[usize],
    ) -> Result<Vec<String>, crate::error::SliceError> {
        if let Some(sidecar) = &self.sidecar_text {
            return Ok(pages
                .iter()
                .map(|&p| sidecar.get(p).cloned().unwrap_or_default())
                .collect());
        }
        backend.page_texts(&self.working_path, pages).await
    }
}

/// Read the first four bytes and map them to a format.
pub fn detect_format(path: &Path) -> Result<DocumentFormat, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => {
            return Err(PipelineError::FileNotFound {
                path: path.to_path_buf(),
            })
        }
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return Err(PipelineError::Unreadable {
            path: path.to_path_buf(),
            detail: "file is shorter than 4 bytes".into(),
        });
    }
    match &magic {
        b"%PDF" => Ok(DocumentFormat::Pdf),
        b"AT&T" => Ok(DocumentFormat::Djvu),
        _ => Err(PipelineError::UnsupportedFormat {
            path: path.to_path_buf(),
            magic,
        }),
    }
}

/// Streamed SHA-256 of the file, lower-case hex.
pub async fn fingerprint_file(path: &Path) -> Result<String, PipelineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let unreadable = |e: std::io::Error| PipelineError::Unreadable {
            path: path.clone(),
            detail: e.to_string(),
        };
        let mut file = std::fs::File::open(&path).map_err(unreadable)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(unreadable)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("fingerprint task panicked: {}", e)))?
}

async fn convert_djvu(path: &Path, workdir: &Path) -> Result<PathBuf, PipelineError> {
    let out = workdir.join("converted.pdf");
    debug!("ddjvu -format=pdf {} {}", path.display(), out.display());
    let status = Command::new("ddjvu")
        .arg("-format=pdf")
        .arg(path)
        .arg(&out)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| PipelineError::Unreadable {
            path: path.to_path_buf(),
            detail: format!("could not run ddjvu: {}", e),
        })?;
    if !status.success() || !out.exists() {
        return Err(PipelineError::Unreadable {
            path: path.to_path_buf(),
            detail: format!("ddjvu failed ({})", status),
        });
    }
    Ok(out)
}

/// `djvutxt` output split on form feeds. `None` when the tool is missing or
/// the document has no text layer.
async fn djvu_text(path: &Path) -> Option<Vec<String>> {
    let output = Command::new("djvutxt")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let pages: Vec<String> = text.split('\x0c').map(str::to_string).collect();
    if pages.iter().all(|p| p.trim().is_empty()) {
        None
    } else {
        Some(pages)
    }
}

/// Up to `n` page indices spread evenly over the document.
pub fn sample_pages(page_count: usize, n: usize) -> Vec<usize> {
    if page_count <= n {
        return (0..page_count).collect();
    }
    let step = page_count as f64 / n as f64;
    let mut pages: Vec<usize> = (0..n).map(|i| (i as f64 * step) as usize).collect();
    pages.dedup();
    pages
}

/// `Scanned` when the sampled pages average fewer than `threshold` characters.
pub fn classify_kind(texts: &[String], threshold: usize) -> DocumentKind {
    if texts.is_empty() {
        return DocumentKind::Scanned;
    }
    let chars: usize = texts.iter().map(|t| t.trim().chars().count()).sum();
    if chars / texts.len() < threshold {
        DocumentKind::Scanned
    } else {
        DocumentKind::TextLayer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn detects_pdf_and_djvu_by_magic() {
        let pdf = write_temp(b"%PDF-1.7\n");
        assert_eq!(detect_format(pdf.path()).unwrap(), DocumentFormat::Pdf);
        let djvu = write_temp(b"AT&TFORM\0\0");
        assert_eq!(detect_format(djvu.path()).unwrap(), DocumentFormat::Djvu);
    }

    #[test]
    fn rejects_other_formats() {
        let png = write_temp(b"\x89PNG\r\n");
        assert!(matches!(
            detect_format(png.path()),
            Err(PipelineError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        assert!(matches!(
            detect_format(Path::new("/no/such/book.pdf")),
            Err(PipelineError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fingerprint_is_sha256_hex() {
        let f = write_temp(b"abc");
        let fp = fingerprint_file(f.path()).await.unwrap();
        assert_eq!(fp, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn sampling_spreads_over_document() {
        assert_eq!(sample_pages(5, 12), vec![0, 1, 2, 3, 4]);
        let s = sample_pages(120, 12);
        assert_eq!(s.len(), 12);
        assert_eq!(s[0], 0);
        assert_eq!(s[1], 10);
    }

    #[test]
    fn low_text_volume_is_scanned() {
        let empty = vec![String::new(); 4];
        assert_eq!(classify_kind(&empty, 40), DocumentKind::Scanned);
        let text = vec!["x".repeat(500); 4];
        assert_eq!(classify_kind(&text, 40), DocumentKind::TextLayer);
    }
}
