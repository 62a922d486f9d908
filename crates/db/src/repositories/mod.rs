//! Repository implementations.

mod tracked_document;

pub use tracked_document::TrackedDocumentRepository;
