//! Collaborators the stage actors call out to

pub mod audit;
pub mod context;
pub mod execution;
pub mod generation;
pub mod session;

pub use audit::{AuditError, AuditStore, Direction, SqliteAuditStore, TranscriptEntry};
pub use context::{
    CacheError, CachedContextStore, ContextCache, ContextLookup, ContextStore,
    HttpProfileSource, MemoryContextCache, ProfileError, ProfileSource, StaticProfileSource,
};
pub use execution::{
    AcceptingActionExecutor, ActionExecutor, ActionRequest, ExecutionError, HttpActionExecutor,
};
pub use generation::{
    LlmResponseGenerator, ResponseGenerator, ResponseRequest, TemplateResponseGenerator,
};
pub use session::{
    MemorySessionStore, SessionError, SessionState, SessionStatus, SessionStore,
};
