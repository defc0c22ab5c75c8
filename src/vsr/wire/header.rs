//! VSR wire protocol header.
//!
//! The [`Header`] is a fixed-size 128-byte structure prepended to every message.
//! It contains checksums for integrity verification, routing metadata (cluster,
//! client, replica), consensus positions (view, op, commit), and protocol
//! versioning.
//!
//! # Wire layout
//!
//! ```text
//! Bytes 0-15:    checksum (covers bytes 16-127)
//! Bytes 16-31:   checksum_body (covers message body)
//! Bytes 32-47:   parent (hash-chain backpointer)
//! Bytes 48-63:   client (u128)
//! Bytes 64-79:   context (command-specific cryptographic context)
//! Bytes 80-83:   request (u32)
//! Bytes 84-87:   cluster (u32)
//! Bytes 88-91:   epoch (u32, must be 0)
//! Bytes 92-95:   view (u32)
//! Bytes 96-103:  op (u64)
//! Bytes 104-111: commit (u64)
//! Bytes 112-119: offset (u64)
//! Bytes 120-123: size (u32, header + body)
//! Byte 124:      replica (u8)
//! Byte 125:      command (u8)
//! Byte 126:      operation (u8)
//! Byte 127:      version (u8)
//! ```

use crate::constants::{ClusterId, HEADER_SIZE, HEADER_SIZE_USIZE, MESSAGE_SIZE_MAX, VSR_VERSION};

use super::command::InvalidCommand;
use super::{Checksum128, Command, Operation, checksum};

/// Byte offset where checksummed content begins (after the checksum field itself).
const CHECKSUM_SIZE: u32 = 16;
const _: () = assert!(CHECKSUM_SIZE as usize == size_of::<Checksum128>());
const _: () = assert!(HEADER_SIZE > CHECKSUM_SIZE);

/// Byte offset of the `command` field, consulted before the header can be
/// reinterpreted from raw wire bytes.
const COMMAND_OFFSET: usize = 125;

/// Fixed-size 128-byte header prepended to every VSR message.
///
/// # Checksum coverage
///
/// - `checksum`: Covers header bytes 16-127 (everything after itself)
/// - `checksum_body`: Covers the message body only (not the header)
///
/// Always set `checksum_body` before `checksum` since the header checksum
/// covers the `checksum_body` field.
#[repr(C)]
#[derive(Clone, Copy, PartialEq)]
pub struct Header {
    /// 128-bit checksum of header bytes 16-127.
    pub checksum: Checksum128,
    /// 128-bit checksum of the message body.
    pub checksum_body: Checksum128,
    /// Checksum of the previous message in the hash chain.
    pub parent: u128,
    /// 128-bit ephemeral client identifier, zero for replica traffic
    /// that carries none.
    pub client: u128,
    /// Command-specific cryptographic context (e.g. session identifier).
    pub context: u128,

    /// Monotonic per-client request number.
    pub request: u32,
    /// Cluster identifier for routing.
    pub cluster: ClusterId,
    /// Epoch number for reconfiguration; must be zero.
    pub epoch: u32,
    /// Sender's current view number.
    pub view: u32,

    /// Op number assigned to this message.
    pub op: u64,
    /// Latest committed op number known to the sender.
    pub commit: u64,
    /// Journal offset of this message.
    pub offset: u64,

    /// Total message size in bytes (header + body).
    pub size: u32,
    /// Authoring replica index.
    pub replica: u8,
    /// Message type discriminator.
    pub command: Command,
    /// State-machine operation tag.
    pub operation: Operation,
    /// Protocol version; must equal [`VSR_VERSION`].
    pub version: u8,
}

const _: () = assert!(size_of::<Header>() == HEADER_SIZE_USIZE);
const _: () = assert!(align_of::<Header>() == align_of::<u128>());
const _: () = {
    use core::mem::offset_of;
    assert!(offset_of!(Header, checksum) == 0);
    assert!(offset_of!(Header, checksum_body) == 16);
    assert!(offset_of!(Header, parent) == 32);
    assert!(offset_of!(Header, client) == 48);
    assert!(offset_of!(Header, context) == 64);
    assert!(offset_of!(Header, request) == 80);
    assert!(offset_of!(Header, cluster) == 84);
    assert!(offset_of!(Header, epoch) == 88);
    assert!(offset_of!(Header, view) == 92);
    assert!(offset_of!(Header, op) == 96);
    assert!(offset_of!(Header, commit) == 104);
    assert!(offset_of!(Header, offset) == 112);
    assert!(offset_of!(Header, size) == 120);
    assert!(offset_of!(Header, replica) == 124);
    assert!(offset_of!(Header, command) == COMMAND_OFFSET);
    assert!(offset_of!(Header, operation) == 126);
    assert!(offset_of!(Header, version) == 127);
};

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("checksum", &format_args!("{:#x}", self.checksum))
            .field("checksum_body", &format_args!("{:#x}", self.checksum_body))
            .field("cluster", &self.cluster)
            .field("client", &format_args!("{:#x}", self.client))
            .field("request", &self.request)
            .field("view", &self.view)
            .field("op", &self.op)
            .field("commit", &self.commit)
            .field("size", &self.size)
            .field("replica", &self.replica)
            .field("command", &self.command)
            .field("operation", &self.operation)
            .finish()
    }
}

impl Header {
    /// Minimum valid message size (header only, no body).
    pub const SIZE_MIN: u32 = HEADER_SIZE;
    /// Maximum valid message size (header + max body).
    pub const SIZE_MAX: u32 = MESSAGE_SIZE_MAX;

    /// Creates a header-only message header with no body.
    ///
    /// Initializes `size` to [`Self::SIZE_MIN`], `version` to [`VSR_VERSION`],
    /// and every other field to zero.
    pub fn new(command: Command, cluster: ClusterId, replica: u8) -> Self {
        let header = Header {
            checksum: 0,
            checksum_body: 0,
            parent: 0,
            client: 0,
            context: 0,

            request: 0,
            cluster,
            epoch: 0,
            view: 0,

            op: 0,
            commit: 0,
            offset: 0,

            size: Self::SIZE_MIN,
            replica,
            command,
            operation: Operation::RESERVED,
            version: VSR_VERSION,
        };

        assert!(header.size >= Self::SIZE_MIN);
        assert!(header.size <= Self::SIZE_MAX);
        assert!(header.epoch == 0);
        assert!(header.version == VSR_VERSION);

        header
    }

    /// Returns the body length (`size - SIZE_MIN`).
    ///
    /// # Panics
    ///
    /// Panics if `size` is outside `[SIZE_MIN, SIZE_MAX]`.
    #[inline]
    pub fn body_len(&self) -> u32 {
        assert!(self.size >= Self::SIZE_MIN);
        assert!(self.size <= Self::SIZE_MAX);

        let body_len = self.size - Self::SIZE_MIN;
        assert!(body_len <= Self::SIZE_MAX - Self::SIZE_MIN);
        body_len
    }

    /// Returns total message length (equal to `size`).
    ///
    /// # Panics
    ///
    /// Panics if `size` is outside `[SIZE_MIN, SIZE_MAX]`.
    #[inline]
    pub fn total_len(&self) -> u32 {
        assert!(self.size >= Self::SIZE_MIN);
        assert!(self.size <= Self::SIZE_MAX);

        self.size
    }

    /// Reinterprets the header as a byte array.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE_USIZE] {
        // SAFETY: Header is repr(C) with a compile-time size assertion and no
        // padding bytes (the field offsets above are dense).
        unsafe { &*(self as *const Self as *const [u8; HEADER_SIZE_USIZE]) }
    }

    /// Computes the checksum over header bytes 16-127 (excludes the
    /// `checksum` field).
    pub fn calculate_checksum(&self) -> Checksum128 {
        let bytes = self.as_bytes();
        let checksum_input = &bytes[CHECKSUM_SIZE as usize..];
        assert!(checksum_input.len() == HEADER_SIZE_USIZE - CHECKSUM_SIZE as usize);

        checksum(checksum_input)
    }

    /// Computes the checksum over the message body.
    ///
    /// # Panics
    ///
    /// Panics if `body.len()` doesn't match [`Self::body_len()`].
    pub fn calculate_checksum_body(&self, body: &[u8]) -> Checksum128 {
        assert!(body.len() <= u32::MAX as usize);
        assert!(body.len() as u32 == self.body_len());

        checksum(body)
    }

    /// Returns `true` if `checksum` matches the computed value.
    #[inline]
    pub fn is_valid_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Returns `true` if `checksum_body` matches the computed value.
    ///
    /// # Panics
    ///
    /// Panics if `body.len()` doesn't match [`Self::body_len()`].
    #[inline]
    pub fn is_valid_checksum_body(&self, body: &[u8]) -> bool {
        assert!(body.len() as u32 == self.body_len());
        self.checksum_body == self.calculate_checksum_body(body)
    }

    /// Computes and stores the header checksum.
    ///
    /// Call this *after* [`Self::set_checksum_body()`] since the header
    /// checksum covers the `checksum_body` field.
    pub fn set_checksum(&mut self) {
        self.checksum = self.calculate_checksum();

        assert!(self.is_valid_checksum());
    }

    /// Computes and stores the body checksum.
    ///
    /// # Panics
    ///
    /// Panics if `body.len()` doesn't match [`Self::body_len()`].
    pub fn set_checksum_body(&mut self, body: &[u8]) {
        assert!(body.len() as u32 == self.body_len());

        self.checksum_body = self.calculate_checksum_body(body);

        assert!(self.is_valid_checksum_body(body));
    }

    /// Returns a description of the first invalid field, or `None` if the
    /// header is well-formed for its command.
    ///
    /// Does *not* verify checksums; use [`Self::is_valid_checksum()`] and
    /// [`Self::is_valid_checksum_body()`] separately.
    pub fn invalid(&self) -> Option<&'static str> {
        if self.size < Self::SIZE_MIN {
            return Some("size < SIZE_MIN");
        }
        if self.size > Self::SIZE_MAX {
            return Some("size > SIZE_MAX");
        }
        if self.epoch != 0 {
            return Some("epoch != 0");
        }
        if self.version != VSR_VERSION {
            return Some("version != VSR_VERSION");
        }
        match self.command {
            Command::Reserved => self.invalid_reserved(),
            Command::Request => self.invalid_request(),
            Command::Prepare => self.invalid_prepare(),
            Command::PrepareOk => self.invalid_prepare_ok(),
            _ => None,
        }
    }

    fn invalid_reserved(&self) -> Option<&'static str> {
        if self.parent != 0 {
            return Some("parent != 0");
        }
        if self.client != 0 {
            return Some("client != 0");
        }
        if self.context != 0 {
            return Some("context != 0");
        }
        if self.request != 0 {
            return Some("request != 0");
        }
        if self.view != 0 {
            return Some("view != 0");
        }
        if self.op != 0 {
            return Some("op != 0");
        }
        if self.commit != 0 {
            return Some("commit != 0");
        }
        if self.offset != 0 {
            return Some("offset != 0");
        }
        if self.replica != 0 {
            return Some("replica != 0");
        }
        if self.operation != Operation::RESERVED {
            return Some("operation != reserved");
        }
        None
    }

    fn invalid_request(&self) -> Option<&'static str> {
        if self.parent != 0 {
            return Some("parent != 0");
        }
        if self.client == 0 {
            return Some("client == 0");
        }
        if self.op != 0 {
            return Some("op != 0");
        }
        if self.commit != 0 {
            return Some("commit != 0");
        }
        if self.offset != 0 {
            return Some("offset != 0");
        }
        if self.replica != 0 {
            return Some("replica != 0");
        }
        if self.operation == Operation::REGISTER {
            // Registration opens the session: no session context and no
            // request number exist yet.
            if self.context != 0 {
                return Some("context != 0");
            }
            if self.request != 0 {
                return Some("request != 0");
            }
        } else {
            if self.context == 0 {
                return Some("context == 0");
            }
            if self.request == 0 {
                return Some("request == 0");
            }
        }
        None
    }

    fn invalid_prepare(&self) -> Option<&'static str> {
        if self.operation == Operation::INIT {
            // The init prepare is the root of the hash chain and is only
            // ever authored locally at format time.
            if self.parent != 0 {
                return Some("init: parent != 0");
            }
            if self.client != 0 {
                return Some("init: client != 0");
            }
            if self.context != 0 {
                return Some("init: context != 0");
            }
            if self.request != 0 {
                return Some("init: request != 0");
            }
            if self.view != 0 {
                return Some("init: view != 0");
            }
            if self.op != 0 {
                return Some("init: op != 0");
            }
            if self.commit != 0 {
                return Some("init: commit != 0");
            }
            if self.offset != 0 {
                return Some("init: offset != 0");
            }
            if self.replica != 0 {
                return Some("init: replica != 0");
            }
            return None;
        }

        if self.operation == Operation::RESERVED {
            return Some("operation == reserved");
        }
        if self.client == 0 {
            return Some("client == 0");
        }
        if self.op == 0 {
            return Some("op == 0");
        }
        if self.op <= self.commit {
            return Some("op <= commit");
        }
        if self.operation == Operation::REGISTER {
            if self.request != 0 {
                return Some("request != 0");
            }
        } else if self.request == 0 {
            return Some("request == 0");
        }
        None
    }

    fn invalid_prepare_ok(&self) -> Option<&'static str> {
        // A prepare_ok echoes the fields of the prepare it acknowledges.
        self.invalid_prepare()
    }

    /// Deserializes a header from raw wire bytes.
    ///
    /// Fails if the command byte is not a known [`Command`]; every other bit
    /// pattern is representable. The resulting header may still carry invalid
    /// data; call [`Self::invalid()`] and [`Self::is_valid_checksum()`]
    /// before trusting the contents.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE_USIZE]) -> Result<Self, InvalidCommand> {
        // The command byte must be checked before the cast: materializing an
        // out-of-range enum discriminant is undefined behavior.
        Command::try_from(bytes[COMMAND_OFFSET])?;

        let header = {
            let mut h = core::mem::MaybeUninit::<Header>::uninit();

            // SAFETY: Header is repr(C), properly sized, has no padding, and
            // all remaining bit patterns are valid for the field types now
            // that the command byte is known to be in range.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    h.as_mut_ptr() as *mut u8,
                    HEADER_SIZE_USIZE,
                );
                h.assume_init()
            }
        };

        assert!(header.as_bytes() == bytes);

        Ok(header)
    }
}
