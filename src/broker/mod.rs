pub mod engine;
pub mod message;
pub mod registry;
pub mod subject;
pub mod topic;

pub use engine::{MessageHandler, PubSub};
pub use message::Envelope;

#[cfg(test)]
mod tests;
