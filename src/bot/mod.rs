//! Per-character bot connections
//!
//! A [`BotConnection`] owns one gateway session and feeds every inbound
//! message through its [`MessagePipeline`].

mod connection;
mod outcome;
mod pipeline;
mod rate_limiter;

pub use connection::{BotConnection, ConnectionState, HandledMessage};
pub use outcome::{IgnoreReason, PipelineOutcome};
pub use pipeline::{history_to_turns, MessagePipeline, PipelineSettings};
pub use rate_limiter::RateLimiter;
