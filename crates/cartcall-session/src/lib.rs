//! cartcall-session: voice session orchestration
//!
//! This crate turns a fluctuating real-time transport into one coherent call
//! state: it normalizes raw transport events, drives the call lifecycle and
//! reconnection policy, folds transcripts and tool calls into a turn log and
//! a cart, and publishes immutable snapshots for the UI.

mod adapter;
pub mod bridge;
pub mod cart;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod machine;
pub mod normalizer;
pub mod orchestrator;
pub mod projector;

pub use bridge::{Coalescer, Snapshot};
pub use cart::{CartLine, CartState, OrderConfirmation};
pub use config::{RetryConfig, SessionConfig};
pub use conversation::ConversationTurn;
pub use error::{Error, Result};
pub use events::{
    AddArgs, Notice, OrderArgs, RemoveArgs, SearchArgs, SessionEvent, Speaker, ToolArgs,
    ToolCallKind, ToolResultStatus, UpdateArgs,
};
pub use handle::SessionHandle;
pub use machine::{
    ConnectionHealth, Effect, Phase, PhaseChange, Session, SessionError, SessionMachine,
    SessionStats, TurnTaking,
};
pub use normalizer::normalize;
pub use orchestrator::Orchestrator;
pub use projector::{Projector, ToolCall, ToolCallStatus};
