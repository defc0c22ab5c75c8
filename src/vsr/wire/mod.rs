pub mod checksum;
pub mod command;
pub mod header;
pub mod message;
pub mod operation;

pub use checksum::{Checksum128, checksum};
pub use command::{Command, InvalidCommand};
pub use header::Header;
pub use message::{Message, MessageHandle};
pub use operation::Operation;
