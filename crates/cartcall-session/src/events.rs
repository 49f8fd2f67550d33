//! Canonical session event types

use cartcall_transport::TransportErrorKind;
use serde::{Deserialize, Serialize};

/// Who produced a piece of conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// The closed set of actions the agent may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    SearchProducts,
    AddToCart,
    UpdateCartItem,
    RemoveFromCart,
    PlaceOrder,
}

impl ToolCallKind {
    /// Look up a kind by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "search_products" => Some(ToolCallKind::SearchProducts),
            "add_to_cart" => Some(ToolCallKind::AddToCart),
            "update_cart_item" => Some(ToolCallKind::UpdateCartItem),
            "remove_from_cart" => Some(ToolCallKind::RemoveFromCart),
            "place_order" => Some(ToolCallKind::PlaceOrder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallKind::SearchProducts => "search_products",
            ToolCallKind::AddToCart => "add_to_cart",
            ToolCallKind::UpdateCartItem => "update_cart_item",
            ToolCallKind::RemoveFromCart => "remove_from_cart",
            ToolCallKind::PlaceOrder => "place_order",
        }
    }
}

impl std::fmt::Display for ToolCallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn one() -> u32 {
    1
}

/// Arguments of `search_products`. Filters are kept verbatim; search has no cart effect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(flatten)]
    pub filters: serde_json::Map<String, serde_json::Value>,
}

/// Arguments of `add_to_cart`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddArgs {
    #[serde(alias = "item_id", alias = "product_id")]
    pub item: String,
    #[serde(default = "one", alias = "qty")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Arguments of `update_cart_item`; a quantity of zero removes the line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateArgs {
    #[serde(alias = "item_id", alias = "product_id")]
    pub item: String,
    #[serde(alias = "qty")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Arguments of `remove_from_cart`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveArgs {
    #[serde(alias = "item_id", alias = "product_id")]
    pub item: String,
}

/// Arguments of `place_order`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
}

/// Typed tool-call arguments; the variant determines the kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arguments", rename_all = "snake_case")]
pub enum ToolArgs {
    SearchProducts(SearchArgs),
    AddToCart(AddArgs),
    UpdateCartItem(UpdateArgs),
    RemoveFromCart(RemoveArgs),
    PlaceOrder(OrderArgs),
}

impl ToolArgs {
    pub fn kind(&self) -> ToolCallKind {
        match self {
            ToolArgs::SearchProducts(_) => ToolCallKind::SearchProducts,
            ToolArgs::AddToCart(_) => ToolCallKind::AddToCart,
            ToolArgs::UpdateCartItem(_) => ToolCallKind::UpdateCartItem,
            ToolArgs::RemoveFromCart(_) => ToolCallKind::RemoveFromCart,
            ToolArgs::PlaceOrder(_) => ToolCallKind::PlaceOrder,
        }
    }
}

/// Outcome reported by the agent for a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Applied,
    Failed,
}

/// Canonical events consumed by the session state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionUp,
    ConnectionDown {
        kind: TransportErrorKind,
        message: String,
    },
    UserSpeechStarted,
    UserSpeechStopped,
    AgentSpeechStarted,
    AgentSpeechStopped,
    PartialTranscript {
        speaker: Speaker,
        text: String,
        seq: u64,
    },
    FinalTranscript {
        speaker: Speaker,
        text: String,
        seq: u64,
    },
    ToolCallRequested {
        id: String,
        args: ToolArgs,
        seq: u64,
    },
    ToolCallResult {
        id: String,
        status: ToolResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    QualitySample {
        latency_ms: f64,
        packet_loss: f64,
    },
    /// The agent ended the conversation gracefully
    AgentClosed,
    FatalError {
        kind: TransportErrorKind,
        message: String,
    },
    /// A payload that could not be mapped onto any other variant
    Malformed {
        raw: String,
        reason: String,
    },
}

impl SessionEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionUp => "connection_up",
            SessionEvent::ConnectionDown { .. } => "connection_down",
            SessionEvent::UserSpeechStarted => "user_speech_started",
            SessionEvent::UserSpeechStopped => "user_speech_stopped",
            SessionEvent::AgentSpeechStarted => "agent_speech_started",
            SessionEvent::AgentSpeechStopped => "agent_speech_stopped",
            SessionEvent::PartialTranscript { .. } => "partial_transcript",
            SessionEvent::FinalTranscript { .. } => "final_transcript",
            SessionEvent::ToolCallRequested { .. } => "tool_call_requested",
            SessionEvent::ToolCallResult { .. } => "tool_call_result",
            SessionEvent::QualitySample { .. } => "quality_sample",
            SessionEvent::AgentClosed => "agent_closed",
            SessionEvent::FatalError { .. } => "fatal_error",
            SessionEvent::Malformed { .. } => "malformed",
        }
    }
}

/// Non-blocking problem surfaced to the UI while the call continues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// An event payload could not be understood
    Malformed { reason: String },
    /// The agent reported that an action failed
    ToolCallFailure {
        id: String,
        tool: ToolCallKind,
        message: String,
    },
    /// A result arrived for a tool call that was never requested
    UnknownToolCall { id: String },
    /// A sequence number was used twice
    SequenceConflict { seq: u64 },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Malformed { reason } => write!(f, "ignored malformed event: {}", reason),
            Notice::ToolCallFailure { id, tool, message } => {
                write!(f, "{} ({}) failed: {}", tool, id, message)
            }
            Notice::UnknownToolCall { id } => write!(f, "result for unknown tool call {}", id),
            Notice::SequenceConflict { seq } => write!(f, "sequence number {} reused", seq),
        }
    }
}
