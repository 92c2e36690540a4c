// OpenAI mapper module
// Inbound requests arrive in Chat Completions shape; everything upstream
// speaks `generateContent`.

pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use models::*;
pub use request::to_upstream_request;
pub use response::to_chat_response;
pub use streaming::translate_sse_stream;
