#![forbid(unsafe_code)]

//! Continuous queries over unbounded event streams.
//!
//! Producers publish events through a [`StreamRegistry`]. A streaming query
//! takes ownership of its input streams, runs a single cooperative event
//! loop and emits closed windows on its result channel as they complete.
//! Stream joins deliver their matches to the registry's match handler.

mod buffer;
mod engine;
mod join;
mod registry;
mod window;

pub use buffer::{InsertOutcome, StreamBuffer, StreamEvent};
pub use engine::{StreamInputs, StreamPlan, StreamingEngine};
pub use join::{JoinSide, JoinStep, MatchHandler, StreamJoin, StreamMatch};
pub use registry::{StreamRegistry, StreamSender};
pub use window::{WindowResult, WindowSnapshot, WindowedAggregator, WINDOW_END, WINDOW_START};
