//! consultd - single-instance coordination daemon for AI consultations.
//!
//! One daemon per user owns the conversation store, broadcasts state
//! changes to every connected client, fronts the external chat-completion
//! providers, and serves retrieval over a local RAG corpus.

pub mod api;
pub mod config;
pub mod consult;
pub mod conversations;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod paths;
pub mod provider;
pub mod rag;
pub mod secrets;
pub mod server;
pub mod store;
pub mod telemetry;

pub use config::{ConfigService, DaemonConfig};
pub use consult::{ConsultOptions, ConsultationOrchestrator};
pub use conversations::ConversationService;
pub use error::{DaemonError, Result};
pub use hub::{Event, EventHub};
pub use paths::DaemonPaths;
pub use rag::RagPipeline;
pub use server::run_daemon;
pub use store::Store;
