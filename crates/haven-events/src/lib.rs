//! `haven-events` — event sources and the document ingestion pipeline.
//!
//! A fixed registry of sources feeds the dispatcher: the device-state feed
//! (push boundary), the document-indexing completion feed, and webhook
//! ingress (HMAC / bearer authenticated). Document ingestion is a pipeline
//! of processors producing indexable content items; rows land in storage
//! in one transaction and a completion event is published.

pub mod error;
pub mod indexing;
pub mod sources;
pub mod webhook;

pub use error::{EventsError, Result};
pub use indexing::{DocumentIndexer, HashEmbeddingGenerator, IndexableContent};
pub use sources::{EventSource, EventSourceRegistry, PushSource};
