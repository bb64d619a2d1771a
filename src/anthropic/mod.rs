pub mod client;
pub mod error;
pub mod invoker;
pub mod types;

pub use client::AnthropicClient;
pub use error::AnthropicError;
pub use invoker::{AnthropicInvoker, Generation};
pub use types::{Message, MessagesRequest, MessagesResponse, Usage};
