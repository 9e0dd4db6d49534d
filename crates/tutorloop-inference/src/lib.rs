pub mod engine;
pub mod error;
pub mod formatter;
pub mod poller;
pub mod worker;

pub use engine::{GenerationEngine, GenerationParams, ScriptedEngine, ServerEngine};
pub use error::{FormattingError, GenerationError, PollingError, StreamingError, TurnError};
pub use formatter::{MessageSanitizer, PromptFormatter};
pub use poller::Poller;
pub use worker::{Job, TurnOutcome, UserLocks, UserTurn, Worker};
