//! Persistence gateway: one atomic commit per run.
//!
//! A run hands over a complete [`RunRecord`]. The gateway writes the book,
//! its chapters and its bibliography in a single transaction, so a failed
//! run never leaves part of a book behind. Re-committing the same
//! `document_id` replaces the previous rows; committing a DOI that already
//! anchors another book is rejected with [`PersistenceError::DuplicateDoi`].
//!
//! [`SqliteGateway`] is the production store: WAL journal, foreign keys on,
//! chapters and bibliography entries cascade with their book, and a partial
//! unique index keeps DOIs unique among books that have one.
//!
//! Citations resolved to a zbl id also land in `book_citations`, the
//! book → cited work graph, queried with [`SqliteGateway::cited_works`] and
//! [`SqliteGateway::citing_books`].

use crate::embed::{embedding_from_blob, embedding_to_blob};
use crate::error::PersistenceError;
use crate::model::{Audience, BibEntryRecord, BookRecord, ChapterRecord, RunRecord};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Transactional sink for finished runs.
pub trait PersistenceGateway: Send + Sync {
    /// Write everything in `run` or nothing.
    fn commit<'a>(&'a self, run: &'a RunRecord) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

/// Downstream full-text indexer, fed after a successful commit.
pub trait SearchIndexer: Send + Sync {
    /// `pages` are `(0-based page, text)` pairs sampled from the document.
    fn index<'a>(
        &'a self,
        book: &'a BookRecord,
        pages: &'a [(usize, String)],
    ) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS books (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id        TEXT NOT NULL UNIQUE,
    path               TEXT NOT NULL,
    file_name          TEXT NOT NULL,
    format             TEXT NOT NULL,
    kind               TEXT NOT NULL,
    page_count         INTEGER NOT NULL,
    fingerprint        TEXT NOT NULL,
    title              TEXT,
    authors            TEXT NOT NULL,
    year               INTEGER,
    isbn               TEXT,
    doi                TEXT,
    publisher          TEXT,
    msc                TEXT NOT NULL,
    zbl_id             TEXT,
    trust_score        REAL,
    summary            TEXT,
    description        TEXT,
    audience           TEXT,
    has_exercises      INTEGER NOT NULL,
    has_solutions      INTEGER NOT NULL,
    index_terms        TEXT NOT NULL,
    provenance         TEXT NOT NULL,
    needs_review       TEXT NOT NULL,
    partial_extraction INTEGER NOT NULL,
    status             TEXT NOT NULL,
    embedding          BLOB,
    updated_at         INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_books_doi ON books(doi) WHERE doi IS NOT NULL;

CREATE TABLE IF NOT EXISTS chapters (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    book_id  INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    title    TEXT NOT NULL,
    level    INTEGER NOT NULL,
    page     INTEGER
);

CREATE TABLE IF NOT EXISTS bib_entries (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    book_id      INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    position     INTEGER NOT NULL,
    raw_text     TEXT NOT NULL,
    title        TEXT,
    author       TEXT,
    year         INTEGER,
    resolved_doi    TEXT,
    resolved_zbl_id TEXT,
    confidence      REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS book_citations (
    book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    zbl_id  TEXT NOT NULL,
    PRIMARY KEY (book_id, zbl_id)
);

CREATE INDEX IF NOT EXISTS idx_chapters_book ON chapters(book_id);
CREATE INDEX IF NOT EXISTS idx_bib_entries_book ON bib_entries(book_id);
CREATE INDEX IF NOT EXISTS idx_book_citations_zbl ON book_citations(zbl_id);

CREATE VIRTUAL TABLE IF NOT EXISTS pages_fts USING fts5(
    document_id UNINDEXED,
    page_number UNINDEXED,
    content,
    tokenize = 'porter unicode61 remove_diacritics 1'
);
"#;

/// Open pragmas and create the schema.
pub fn init_database(conn: &Connection) -> Result<(), PersistenceError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|e| PersistenceError::Storage(format!("encode: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, PersistenceError> {
    serde_json::from_str(text).map_err(|e| PersistenceError::Storage(format!("decode: {e}")))
}

/// Document id of the other book that holds `doi`, if any.
fn doi_owner(tx: &Transaction<'_>, doi: &str, document_id: &str) -> Result<Option<String>, PersistenceError> {
    Ok(tx
        .query_row(
            "SELECT document_id FROM books WHERE doi = ?1 AND document_id != ?2",
            params![doi, document_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// A write refused by the partial unique index on `books.doi`.
fn is_doi_collision(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, Some(msg))
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE && msg.contains("books.doi")
    )
}

fn upsert_book(tx: &Transaction<'_>, book: &BookRecord) -> Result<i64, PersistenceError> {
    if let Some(doi) = &book.doi {
        if let Some(existing) = doi_owner(tx, doi, &book.document_id)? {
            return Err(PersistenceError::DuplicateDoi {
                doi: doi.clone(),
                existing,
            });
        }
    }
    write_book(tx, book)
}

/// Insert or replace the book row. A DOI taken since the pre-check (another
/// connection committed it first) is still reported as a duplicate.
fn write_book(tx: &Transaction<'_>, book: &BookRecord) -> Result<i64, PersistenceError> {
    let written = tx.execute(
        "INSERT INTO books (
             document_id, path, file_name, format, kind, page_count, fingerprint,
             title, authors, year, isbn, doi, publisher, msc, zbl_id, trust_score,
             summary, description, audience, has_exercises, has_solutions, index_terms,
             provenance, needs_review, partial_extraction, status, embedding, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                   ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)
         ON CONFLICT(document_id) DO UPDATE SET
             path = excluded.path,
             file_name = excluded.file_name,
             format = excluded.format,
             kind = excluded.kind,
             page_count = excluded.page_count,
             fingerprint = excluded.fingerprint,
             title = excluded.title,
             authors = excluded.authors,
             year = excluded.year,
             isbn = excluded.isbn,
             doi = excluded.doi,
             publisher = excluded.publisher,
             msc = excluded.msc,
             zbl_id = excluded.zbl_id,
             trust_score = excluded.trust_score,
             summary = excluded.summary,
             description = excluded.description,
             audience = excluded.audience,
             has_exercises = excluded.has_exercises,
             has_solutions = excluded.has_solutions,
             index_terms = excluded.index_terms,
             provenance = excluded.provenance,
             needs_review = excluded.needs_review,
             partial_extraction = excluded.partial_extraction,
             status = excluded.status,
             embedding = excluded.embedding,
             updated_at = excluded.updated_at",
        params![
            book.document_id,
            book.path.to_string_lossy(),
            book.file_name,
            to_json(&book.format)?,
            to_json(&book.kind)?,
            book.page_count as i64,
            book.fingerprint,
            book.title,
            to_json(&book.authors)?,
            book.year.map(i64::from),
            book.isbn,
            book.doi,
            book.publisher,
            to_json(&book.msc)?,
            book.zbl_id,
            book.trust_score,
            book.summary,
            book.description,
            book.audience.map(|a| a.as_str()),
            book.has_exercises,
            book.has_solutions,
            to_json(&book.index_terms)?,
            to_json(&book.provenance)?,
            to_json(&book.needs_review)?,
            book.partial_extraction,
            book.status.as_str(),
            book.embedding.as_deref().map(embedding_to_blob),
            book.updated_at as i64,
        ],
    );
    match written {
        Ok(_) => {}
        Err(e) if is_doi_collision(&e) => {
            let doi = book.doi.clone().unwrap_or_default();
            let existing = doi_owner(tx, &doi, &book.document_id)?.unwrap_or_default();
            return Err(PersistenceError::DuplicateDoi { doi, existing });
        }
        Err(e) => return Err(e.into()),
    }

    let id = tx.query_row(
        "SELECT id FROM books WHERE document_id = ?1",
        params![book.document_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// The whole commit, inside one transaction.
pub fn commit_blocking(conn: &mut Connection, run: &RunRecord) -> Result<(), PersistenceError> {
    let tx = conn.transaction()?;
    let book_id = upsert_book(&tx, &run.book)?;

    tx.execute("DELETE FROM chapters WHERE book_id = ?1", params![book_id])?;
    tx.execute("DELETE FROM bib_entries WHERE book_id = ?1", params![book_id])?;
    tx.execute("DELETE FROM book_citations WHERE book_id = ?1", params![book_id])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO chapters (book_id, position, title, level, page) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for ch in &run.chapters {
            insert.execute(params![book_id, ch.position as i64, ch.title, ch.level, ch.page])?;
        }
        let mut insert = tx.prepare(
            "INSERT INTO bib_entries (book_id, position, raw_text, title, author, year, resolved_doi, resolved_zbl_id, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        let mut cite = tx.prepare("INSERT OR IGNORE INTO book_citations (book_id, zbl_id) VALUES (?1, ?2)")?;
        for e in &run.bib_entries {
            insert.execute(params![
                book_id,
                e.position as i64,
                e.raw_text,
                e.title,
                e.author,
                e.year.map(i64::from),
                e.resolved_doi,
                e.resolved_zbl_id,
                e.confidence,
            ])?;
            if let Some(zbl_id) = &e.resolved_zbl_id {
                cite.execute(params![book_id, zbl_id])?;
            }
        }
    }
    tx.commit()?;
    debug!(
        "Committed {} ({} chapters, {} bib entries)",
        run.book.document_id,
        run.chapters.len(),
        run.bib_entries.len()
    );
    Ok(())
}

/// Read back what was committed for `document_id`.
pub fn load_blocking(conn: &Connection, document_id: &str) -> Result<Option<RunRecord>, PersistenceError> {
    let row = conn
        .query_row(
            "SELECT id, path, file_name, format, kind, page_count, fingerprint, title, authors, year,
                    isbn, doi, publisher, msc, zbl_id, summary, description, provenance, needs_review,
                    partial_extraction, status, embedding, updated_at,
                    trust_score, audience, has_exercises, has_solutions, index_terms
             FROM books WHERE document_id = ?1",
            params![document_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    (
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, i64>(5)?,
                        r.get::<_, String>(6)?,
                    ),
                    (
                        r.get::<_, Option<String>>(7)?,
                        r.get::<_, String>(8)?,
                        r.get::<_, Option<i64>>(9)?,
                        r.get::<_, Option<String>>(10)?,
                        r.get::<_, Option<String>>(11)?,
                        r.get::<_, Option<String>>(12)?,
                        r.get::<_, String>(13)?,
                        r.get::<_, Option<String>>(14)?,
                    ),
                    (
                        r.get::<_, Option<String>>(15)?,
                        r.get::<_, Option<String>>(16)?,
                        r.get::<_, String>(17)?,
                        r.get::<_, String>(18)?,
                        r.get::<_, bool>(19)?,
                        r.get::<_, String>(20)?,
                        r.get::<_, Option<Vec<u8>>>(21)?,
                        r.get::<_, i64>(22)?,
                    ),
                    (
                        r.get::<_, Option<f64>>(23)?,
                        r.get::<_, Option<String>>(24)?,
                        r.get::<_, bool>(25)?,
                        r.get::<_, bool>(26)?,
                        r.get::<_, String>(27)?,
                    ),
                ))
            },
        )
        .optional()?;
    let Some((id, file, meta, rest, extra)) = row else {
        return Ok(None);
    };
    let (path, file_name, format, kind, page_count, fingerprint) = file;
    let (title, authors, year, isbn, doi, publisher, msc, zbl_id) = meta;
    let (summary, description, provenance, needs_review, partial_extraction, status, embedding, updated_at) =
        rest;
    let (trust_score, audience, has_exercises, has_solutions, index_terms) = extra;

    let book = BookRecord {
        document_id: document_id.to_string(),
        path: PathBuf::from(path),
        file_name,
        format: from_json(&format)?,
        kind: from_json(&kind)?,
        page_count: page_count as usize,
        fingerprint,
        title,
        authors: from_json(&authors)?,
        year: year.and_then(|y| u16::try_from(y).ok()),
        isbn,
        doi,
        publisher,
        msc: from_json(&msc)?,
        zbl_id,
        trust_score,
        summary,
        description,
        audience: audience.as_deref().and_then(Audience::parse),
        has_exercises,
        has_solutions,
        index_terms: from_json(&index_terms)?,
        provenance: from_json(&provenance)?,
        needs_review: from_json(&needs_review)?,
        partial_extraction,
        status: from_json(&format!("\"{}\"", status))?,
        embedding: embedding.as_deref().map(embedding_from_blob),
        updated_at: updated_at as u64,
    };

    let mut stmt = conn.prepare("SELECT position, title, level, page FROM chapters WHERE book_id = ?1 ORDER BY position")?;
    let chapters = stmt
        .query_map(params![id], |r| {
            Ok(ChapterRecord {
                position: r.get::<_, i64>(0)? as usize,
                title: r.get(1)?,
                level: r.get(2)?,
                page: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT position, raw_text, title, author, year, resolved_doi, resolved_zbl_id, confidence
         FROM bib_entries WHERE book_id = ?1 ORDER BY position",
    )?;
    let bib_entries = stmt
        .query_map(params![id], |r| {
            Ok(BibEntryRecord {
                position: r.get::<_, i64>(0)? as usize,
                raw_text: r.get(1)?,
                title: r.get(2)?,
                author: r.get(3)?,
                year: r.get::<_, Option<i64>>(4)?.and_then(|y| u16::try_from(y).ok()),
                resolved_doi: r.get(5)?,
                resolved_zbl_id: r.get(6)?,
                confidence: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(RunRecord {
        book,
        chapters,
        bib_entries,
    }))
}

/// SQLite-backed [`PersistenceGateway`] and [`SearchIndexer`].
///
/// One connection behind a mutex; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGateway").field("path", &self.path).finish()
    }
}

impl SqliteGateway {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        init_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        init_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PersistenceError::Storage("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PersistenceError::Storage(format!("storage task failed: {e}")))?
    }

    pub async fn load(&self, document_id: &str) -> Result<Option<RunRecord>, PersistenceError> {
        let document_id = document_id.to_string();
        self.with_conn(move |conn| load_blocking(conn, &document_id)).await
    }

    pub async fn book_count(&self) -> Result<usize, PersistenceError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM books", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    /// Remove a book; its chapters and bibliography go with it.
    pub async fn delete(&self, document_id: &str) -> Result<bool, PersistenceError> {
        let document_id = document_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM pages_fts WHERE document_id = ?1", params![document_id])?;
            Ok(conn.execute("DELETE FROM books WHERE document_id = ?1", params![document_id])? > 0)
        })
        .await
    }

    /// zbl ids cited by a book, sorted.
    pub async fn cited_works(&self, document_id: &str) -> Result<Vec<String>, PersistenceError> {
        let document_id = document_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.zbl_id FROM book_citations c JOIN books b ON b.id = c.book_id
                 WHERE b.document_id = ?1 ORDER BY c.zbl_id",
            )?;
            let rows = stmt
                .query_map(params![document_id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Documents whose bibliography cites `zbl_id`, sorted.
    pub async fn citing_books(&self, zbl_id: &str) -> Result<Vec<String>, PersistenceError> {
        let zbl_id = zbl_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT b.document_id FROM book_citations c JOIN books b ON b.id = c.book_id
                 WHERE c.zbl_id = ?1 ORDER BY b.document_id",
            )?;
            let rows = stmt
                .query_map(params![zbl_id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Documents whose indexed page text matches an FTS5 query.
    pub async fn search_pages(&self, query: &str, limit: usize) -> Result<Vec<(String, usize)>, PersistenceError> {
        let query = query.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT document_id, page_number FROM pages_fts WHERE pages_fts MATCH ?1 ORDER BY rank LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![query, limit as i64], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

impl PersistenceGateway for SqliteGateway {
    fn commit<'a>(&'a self, run: &'a RunRecord) -> BoxFuture<'a, Result<(), PersistenceError>> {
        let run = run.clone();
        Box::pin(self.with_conn(move |conn| commit_blocking(conn, &run)))
    }
}

impl SearchIndexer for SqliteGateway {
    fn index<'a>(
        &'a self,
        book: &'a BookRecord,
        pages: &'a [(usize, String)],
    ) -> BoxFuture<'a, Result<(), PersistenceError>> {
        let document_id = book.document_id.clone();
        let pages = pages.to_vec();
        Box::pin(self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM pages_fts WHERE document_id = ?1", params![document_id])?;
            {
                let mut insert =
                    tx.prepare("INSERT INTO pages_fts (document_id, page_number, content) VALUES (?1, ?2, ?3)")?;
                for (page, text) in pages.iter().filter(|(_, t)| !t.trim().is_empty()) {
                    insert.execute(params![document_id, *page as i64, text])?;
                }
            }
            tx.commit()?;
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentFormat, DocumentKind, Field, Provenance, VerificationStatus};
    use std::collections::BTreeMap;

    fn book(document_id: &str, doi: Option<&str>) -> BookRecord {
        let mut provenance = BTreeMap::new();
        provenance.insert(Field::Title, Provenance::RegistryLookup);
        BookRecord {
            document_id: document_id.into(),
            path: PathBuf::from(format!("/library/{document_id}.pdf")),
            file_name: format!("{document_id}.pdf"),
            format: DocumentFormat::Pdf,
            kind: DocumentKind::TextLayer,
            page_count: 320,
            fingerprint: "ab".repeat(32),
            title: Some("General Topology".into()),
            authors: vec!["Ryszard Engelking".into()],
            year: Some(1989),
            isbn: Some("9783885380061".into()),
            doi: doi.map(str::to_string),
            publisher: Some("Heldermann".into()),
            msc: vec!["54-01".into()],
            zbl_id: Some("0684.54001".into()),
            trust_score: Some(0.97),
            summary: None,
            description: None,
            audience: Some(Audience::Graduate),
            has_exercises: true,
            has_solutions: false,
            index_terms: vec!["net".into(), "filter".into()],
            provenance,
            needs_review: vec![Field::Year],
            partial_extraction: true,
            status: VerificationStatus::Conflict,
            embedding: Some(vec![0.5, -0.25]),
            updated_at: 1_700_000_000,
        }
    }

    fn run(document_id: &str, doi: Option<&str>) -> RunRecord {
        RunRecord {
            book: book(document_id, doi),
            chapters: vec![
                ChapterRecord { position: 0, title: "Topological spaces".into(), level: 1, page: Some(13) },
                ChapterRecord { position: 1, title: "Compact spaces".into(), level: 1, page: Some(135) },
            ],
            bib_entries: vec![
                BibEntryRecord {
                    position: 0,
                    raw_text: "P. Alexandroff, P. Urysohn, Mémoire sur les espaces topologiques compacts, 1929.".into(),
                    title: None,
                    author: Some("P. Alexandroff".into()),
                    year: Some(1929),
                    resolved_doi: None,
                    resolved_zbl_id: None,
                    confidence: 0.0,
                },
                BibEntryRecord {
                    position: 1,
                    raw_text: "J. L. Kelley, General Topology, Van Nostrand, 1955.".into(),
                    title: Some("General Topology".into()),
                    author: Some("J. L. Kelley".into()),
                    year: Some(1955),
                    resolved_doi: Some("10.1000/kelley".into()),
                    resolved_zbl_id: Some("0066.16604".into()),
                    confidence: 0.93,
                },
            ],
        }
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        conn
    }

    #[test]
    fn commit_then_load_returns_same_record() {
        let mut c = conn();
        let r = run("engelking", Some("10.1007/978-3-642-10750-2"));
        commit_blocking(&mut c, &r).unwrap();
        assert_eq!(load_blocking(&c, "engelking").unwrap(), Some(r));
        assert_eq!(load_blocking(&c, "missing").unwrap(), None);
    }

    #[test]
    fn recommit_replaces_children() {
        let mut c = conn();
        commit_blocking(&mut c, &run("engelking", None)).unwrap();
        let mut again = run("engelking", None);
        again.chapters.truncate(1);
        again.bib_entries.clear();
        commit_blocking(&mut c, &again).unwrap();
        let loaded = load_blocking(&c, "engelking").unwrap().unwrap();
        assert_eq!(loaded.chapters.len(), 1);
        assert!(loaded.bib_entries.is_empty());
        let n: i64 = c.query_row("SELECT COUNT(*) FROM books", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn duplicate_doi_is_rejected_and_nothing_written() {
        let mut c = conn();
        commit_blocking(&mut c, &run("first", Some("10.1000/x"))).unwrap();
        let err = commit_blocking(&mut c, &run("second", Some("10.1000/x"))).unwrap_err();
        match err {
            PersistenceError::DuplicateDoi { existing, .. } => assert_eq!(existing, "first"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(load_blocking(&c, "second").unwrap(), None);
        // Books without a DOI never collide.
        commit_blocking(&mut c, &run("third", None)).unwrap();
        commit_blocking(&mut c, &run("fourth", None)).unwrap();
    }

    #[test]
    fn doi_taken_between_check_and_write_is_a_duplicate() {
        let mut c = conn();
        commit_blocking(&mut c, &run("first", Some("10.1000/x"))).unwrap();
        let tx = c.transaction().unwrap();
        match write_book(&tx, &book("second", Some("10.1000/x"))).unwrap_err() {
            PersistenceError::DuplicateDoi { doi, existing } => {
                assert_eq!(doi, "10.1000/x");
                assert_eq!(existing, "first");
            }
            other => panic!("unexpected {other:?}"),
        }
        tx.rollback().unwrap();
        assert_eq!(load_blocking(&c, "second").unwrap(), None);
    }

    #[test]
    fn deleting_a_book_cascades() {
        let mut c = conn();
        commit_blocking(&mut c, &run("engelking", None)).unwrap();
        c.execute("DELETE FROM books WHERE document_id = 'engelking'", []).unwrap();
        let n: i64 = c.query_row("SELECT COUNT(*) FROM chapters", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn gateway_commits_and_indexes() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let r = run("engelking", None);
        gw.commit(&r).await.unwrap();
        assert_eq!(gw.book_count().await.unwrap(), 1);
        let pages = vec![(0, "General Topology by Ryszard Engelking".to_string()), (1, "   ".to_string())];
        gw.index(&r.book, &pages).await.unwrap();
        let hits = gw.search_pages("topology", 5).await.unwrap();
        assert_eq!(hits, vec![("engelking".to_string(), 0)]);
        assert!(gw.delete("engelking").await.unwrap());
        assert_eq!(gw.book_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn citation_graph_follows_commits() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        gw.commit(&run("engelking", None)).await.unwrap();
        gw.commit(&run("munkres", None)).await.unwrap();
        assert_eq!(gw.cited_works("engelking").await.unwrap(), vec!["0066.16604".to_string()]);
        assert_eq!(
            gw.citing_books("0066.16604").await.unwrap(),
            vec!["engelking".to_string(), "munkres".to_string()]
        );

        let mut again = run("munkres", None);
        again.bib_entries.truncate(1);
        gw.commit(&again).await.unwrap();
        assert_eq!(gw.citing_books("0066.16604").await.unwrap(), vec!["engelking".to_string()]);
        assert!(gw.cited_works("munkres").await.unwrap().is_empty());

        assert!(gw.delete("engelking").await.unwrap());
        assert!(gw.citing_books("0066.16604").await.unwrap().is_empty());
    }
}
