pub mod wire;

pub use wire::{Checksum128, Command, Header, Message, MessageHandle, Operation, checksum};
