//! State-machine operation tag carried in `Header.operation`.
//!
//! The bus treats the tag as opaque apart from the two values it must
//! distinguish for request validation: `INIT` (the root of the hash chain)
//! and `REGISTER` (a client's session-opening request, which carries neither
//! a context nor a request number yet). State-machine operations occupy the
//! remaining byte space.

/// One-byte state-machine operation tag.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Operation(pub u8);

const _: () = assert!(size_of::<Operation>() == 1);

impl Operation {
    /// Wire value 0. Never valid in a live message.
    pub const RESERVED: Operation = Operation(0);
    /// Wire value 1. Initializes the hash chain; only ever authored locally.
    pub const INIT: Operation = Operation(1);
    /// Wire value 2. A client registering a new session.
    pub const REGISTER: Operation = Operation(2);

    #[inline]
    pub const fn from_u8(byte: u8) -> Self {
        Operation(byte)
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl From<u8> for Operation {
    #[inline]
    fn from(byte: u8) -> Self {
        Operation(byte)
    }
}

impl From<Operation> for u8 {
    #[inline]
    fn from(operation: Operation) -> Self {
        operation.0
    }
}
