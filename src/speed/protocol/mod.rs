mod codec;
mod messages;

pub use codec::{DecodeError, read_message};
pub use messages::Message;
