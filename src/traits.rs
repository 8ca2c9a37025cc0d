//! Capability interfaces (traits) at the system's seams.
//!
//! The pipeline, planner, nudger, and sync engine are parameterized by these
//! and composed by value, so tests can swap in fakes without touching the
//! workflow code.

mod connectors;
mod provider;

pub use connectors::{
    FetchWindow, ItemSource, ProviderItem, ProviderPage, RemoteChange, RemoteChangePage,
    RemoteTask, RemoteTaskDraft, TaskManagerClient, TokenRefresher,
};
pub use provider::{ChatMessage, Chatter, Embedder, Notifier, ResponseFormat, VectorStore};
