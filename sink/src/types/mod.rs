pub mod document;
pub mod error;
pub mod received;

pub use document::MessageDocument;
pub use error::{Result, SinkError};
pub use received::ReceivedMail;
