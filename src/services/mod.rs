pub mod alert;
pub mod discussion;
pub mod processor;
pub mod telegram;

#[cfg(test)]
pub mod fake;

pub use alert::AlertThrottle;
pub use discussion::DiscussionResolver;
pub use processor::{HandoffPayload, ProcessorClient, ProcessorHandoff, SubmitError};
pub use telegram::{Messenger, SendError, TelegramBot};
