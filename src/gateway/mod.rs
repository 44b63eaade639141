//! The chat gateway: admission, upstream call, HTTP surface.

mod adapter;
mod server;
mod upstream;

pub use adapter::{AdmissionLimits, CheckRequest, CheckResult, FailurePolicy, GatewayAdapter};
pub use server::{serve_router, source_address, AppState, GatewayServer, TOKEN_HEADER};
pub use upstream::{
    build_conversation, extract_response_text, trim_conversation, ChatMessage, ModelClient,
    OpenAiClient, Role,
};
