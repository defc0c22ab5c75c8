//! Protocol and system constants for the VR message bus.
//!
//! # Design Decisions
//!
//! Size constants use `u32` instead of `usize` for portability and to prevent
//! truncation on 32-bit systems. Use the `_USIZE` variants for array sizing.
//!
//! All invariants verified at compile time via `const` assertions.

// =============================================================================
// Platform verification
// =============================================================================

// Compile-time proof that u32 -> usize is safe on this platform.
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

// =============================================================================
// Wire format constants
// =============================================================================

/// Message header size. Fixed at 128 bytes for checksums, routing metadata,
/// and protocol versioning. Must be 16-byte aligned.
pub const HEADER_SIZE: u32 = 128;

/// Sector size for message buffer alignment. Must be a power of two and at
/// least 512 so message memory can later back unbuffered journal writes.
pub const SECTOR_SIZE: u32 = 4096;

/// Maximum message size (header + body). Balances memory, network, and disk
/// efficiency.
pub const MESSAGE_SIZE_MAX: u32 = 1 << 20; // 1 MiB

/// Maximum message body size. Derived as [`MESSAGE_SIZE_MAX`] - [`HEADER_SIZE`].
pub const MESSAGE_BODY_SIZE_MAX: u32 = MESSAGE_SIZE_MAX - HEADER_SIZE;

/// VSR protocol version byte. Increment for wire-incompatible changes.
pub const VSR_VERSION: u8 = 1;

/// Cluster identifier carried in every header.
pub type ClusterId = u32;

// =============================================================================
// Cluster topology constants
// =============================================================================

/// Maximum number of replicas in a cluster configuration.
pub const REPLICAS_MAX: u32 = 32;

/// Maximum number of client connections held concurrently.
pub const CLIENTS_MAX: u32 = 32;

/// Total connection slots owned by the bus. Must exceed [`REPLICAS_MAX`] so
/// every replica fits with at least one slot left for a client.
pub const CONNECTIONS_MAX: u32 = REPLICAS_MAX + CLIENTS_MAX;

/// Listen backlog for the bus's accept socket.
pub const TCP_BACKLOG: u32 = 64;

/// Default port used when a configuration address omits one.
pub const PORT_DEFAULT: u16 = 3001;

// =============================================================================
// Queue capacities
// =============================================================================

/// Messages a single connection will queue for transmission before dropping.
pub const CONNECTION_SEND_QUEUE_MAX: u32 = 3;

/// Messages the bus will queue to itself between two `flush` calls.
pub const BUS_SELF_SEND_QUEUE_MAX: u32 = 8;

/// I/O backend queue depth. Must be a power of two and cover the worst case
/// of one accept plus one recv and one send per connection.
pub const IO_ENTRIES: u32 = 256;

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

// Header constraints
const _: () = assert!(HEADER_SIZE == 128, "Header must be exactly 128 bytes");
const _: () = assert!(
    HEADER_SIZE.is_multiple_of(16),
    "Header must be 16-byte aligned for checksums"
);

// Sector constraints
const _: () = assert!(SECTOR_SIZE >= 512);
const _: () = assert!(SECTOR_SIZE.is_power_of_two());
const _: () = assert!(SECTOR_SIZE >= HEADER_SIZE);

// Message size constraints
const _: () = assert!(
    MESSAGE_SIZE_MAX > HEADER_SIZE,
    "Message must have room for body"
);
const _: () = assert!(MESSAGE_SIZE_MAX.is_power_of_two());
const _: () = assert!(MESSAGE_BODY_SIZE_MAX == MESSAGE_SIZE_MAX - HEADER_SIZE);

// Topology constraints
const _: () = assert!(REPLICAS_MAX > 0);
const _: () = assert!(
    CONNECTIONS_MAX > REPLICAS_MAX,
    "All replicas must fit with at least one client slot spare"
);
const _: () = assert!(CONNECTIONS_MAX <= u16::MAX as u32);

// Queue constraints
const _: () = assert!(CONNECTION_SEND_QUEUE_MAX > 0);
const _: () = assert!(BUS_SELF_SEND_QUEUE_MAX > 0);
const _: () = assert!(IO_ENTRIES.is_power_of_two());
const _: () = assert!(IO_ENTRIES >= 1 + 2 * CONNECTIONS_MAX);

// Protocol version
const _: () = assert!(VSR_VERSION > 0);

// =============================================================================
// Pre-converted usize constants
// =============================================================================

/// [`HEADER_SIZE`] as `usize`.
pub const HEADER_SIZE_USIZE: usize = HEADER_SIZE as usize;

/// [`SECTOR_SIZE`] as `usize`.
pub const SECTOR_SIZE_USIZE: usize = SECTOR_SIZE as usize;

/// [`MESSAGE_SIZE_MAX`] as `usize`.
pub const MESSAGE_SIZE_MAX_USIZE: usize = MESSAGE_SIZE_MAX as usize;

/// [`CONNECTIONS_MAX`] as `usize`.
pub const CONNECTIONS_MAX_USIZE: usize = CONNECTIONS_MAX as usize;

/// [`CONNECTION_SEND_QUEUE_MAX`] as `usize`.
pub const CONNECTION_SEND_QUEUE_MAX_USIZE: usize = CONNECTION_SEND_QUEUE_MAX as usize;

/// [`BUS_SELF_SEND_QUEUE_MAX`] as `usize`.
pub const BUS_SELF_SEND_QUEUE_MAX_USIZE: usize = BUS_SELF_SEND_QUEUE_MAX as usize;

// Verify usize conversions match source constants.
const _: () = assert!(HEADER_SIZE_USIZE == HEADER_SIZE as usize);
const _: () = assert!(SECTOR_SIZE_USIZE == SECTOR_SIZE as usize);
const _: () = assert!(MESSAGE_SIZE_MAX_USIZE == MESSAGE_SIZE_MAX as usize);
const _: () = assert!(CONNECTIONS_MAX_USIZE == CONNECTIONS_MAX as usize);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_size_relationships_hold() {
        assert_eq!(HEADER_SIZE + MESSAGE_BODY_SIZE_MAX, MESSAGE_SIZE_MAX);
    }

    #[test]
    fn every_replica_fits_with_a_client_slot() {
        assert!(CONNECTIONS_MAX > REPLICAS_MAX);
        assert!(CONNECTIONS_MAX - REPLICAS_MAX >= 1);
    }

    #[test]
    fn sector_covers_header() {
        assert!(SECTOR_SIZE >= 512);
        assert!(SECTOR_SIZE_USIZE.is_multiple_of(HEADER_SIZE_USIZE));
    }
}
