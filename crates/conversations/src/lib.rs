//! Conversation management: gateway-owned conversations with ordered,
//! append-only message transcripts.

pub mod store;

pub use store::ConversationStore;
