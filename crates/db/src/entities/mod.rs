//! Database entities.

pub mod tracked_document;

pub use tracked_document::Entity as TrackedDocument;
