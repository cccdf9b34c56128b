// Public fallible APIs in this crate share one error contract (`OmError`).
#![allow(
    clippy::missing_errors_doc,
    reason = "crate-wide fallible API uses one explicit error type; per-item boilerplate would duplicate contract"
)]

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod memory;
pub mod model;
pub mod observer;
pub mod om;
pub mod reflector;
pub mod store;
pub mod tokens;

pub use context::{AssembledContext, ContextAssembler, ObservationFormatter};
pub use error::{OmError, Result};
pub use events::{CycleFailure, CycleKind, OmEvent, OmListener};
pub use memory::{ObservationalMemory, ObservationalMemoryBuilder, OmStatus};
pub use model::{LanguageModel, ModelError, ModelPrompt, ModelSettings};
pub use om::{OmMessage, OmRecord, OmScope, OmScopeBinding};
pub use store::{InMemoryOmStore, OmStore, SqliteOmStore};
pub use tokens::{TokenAccountant, TokenCounter};
