//! Pipeline phases for metadata resolution.
//!
//! Each submodule implements one step; the orchestrator strings them
//! together and owns the data in between.
//!
//! ## Data Flow
//!
//! ```text
//! source ──▶ locate ──▶ slice ──▶ extract ──▶ verify ──▶ reflect ──▶ resolve
//! (open)     (markers)  (pdfium)  (model)     (registry) (model)     (precedence)
//! ```
//!
//! 1. [`source`]: validate the file, fingerprint it, convert DjVu, count pages
//! 2. [`locate`]: find the ToC and bibliography from page text
//! 3. [`slice`]: cut a page range into its own PDF; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 4. [`extract`]: upload, generate, delete, then [`response`] parses the JSON
//! 5. [`verify`]: check identifier claims against the registries
//! 6. [`reflect`]: one more model call for fields that still disagree
//! 7. [`resolve`]: merge batches and settle each field by precedence
//!
//! [`filename`] contributes the lowest-precedence claims.

pub mod extract;
pub mod filename;
pub mod locate;
pub mod reflect;
pub mod resolve;
pub mod response;
pub mod slice;
pub mod source;
pub mod verify;
