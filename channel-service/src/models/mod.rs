pub mod channel;
pub mod contact;
pub mod conversation;
pub mod message;

pub use channel::{Channel, ChannelStatus};
pub use contact::Contact;
pub use conversation::{Conversation, ConversationStatus};
pub use message::{Message, MessageDirection, MessageStatus};
