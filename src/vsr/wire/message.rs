//! Wire-format message container for VSR protocol communication.
//!
//! A [`Message`] owns a sector-aligned buffer of exactly `header.size` bytes:
//! a [`Header`] aliased over the first 128 bytes, followed by the body. The
//! alignment permits future unbuffered journal writes reusing the same memory.
//!
//! Messages are shared across heterogeneous holders (send queues, the
//! self-send queue, an in-flight receive, the replica) through one-word
//! [`MessageHandle`] copies and a single-threaded reference count. A freshly
//! created message starts at zero references and must be referenced before it
//! is enqueued anywhere; it is destroyed when the count returns to zero.

use core::cell::Cell;
use core::ptr::NonNull;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use crate::constants::{HEADER_SIZE, HEADER_SIZE_USIZE, MESSAGE_SIZE_MAX, SECTOR_SIZE_USIZE};

use super::Header;

// Compile-time: the sector alignment satisfies the header's alignment, so the
// header may alias the front of the buffer.
const _: () = assert!(SECTOR_SIZE_USIZE >= align_of::<Header>());
const _: () = assert!(SECTOR_SIZE_USIZE.is_power_of_two());

/// A protocol message: a [`Header`] aliasing the front of a sector-aligned
/// buffer, plus the body bytes behind it.
///
/// # Invariant
///
/// The first [`HEADER_SIZE`] bytes of the buffer always hold a valid `Header`
/// encoding. A zeroed buffer satisfies this (command byte 0 is `Reserved`),
/// and the only mutable paths into the header region are typed
/// ([`header_mut`], [`set_header`]).
///
/// [`header_mut`]: Message::header_mut
/// [`set_header`]: Message::set_header
pub struct Message {
    /// Reference count. Not thread-safe; the bus is single-threaded.
    pub references: Cell<u32>,
    buffer: NonNull<u8>,
    size: u32,
}

impl Message {
    /// Minimum message length (header only, no body).
    pub const LEN_MIN: u32 = HEADER_SIZE;
    /// Maximum message length (header + max body).
    pub const LEN_MAX: u32 = MESSAGE_SIZE_MAX;

    fn layout(size: u32) -> Layout {
        assert!(size >= Self::LEN_MIN);
        assert!(size <= Self::LEN_MAX);

        Layout::from_size_align(size as usize, SECTOR_SIZE_USIZE)
            .expect("message layout parameters are compile-time sane")
    }

    /// Allocates a zeroed, sector-aligned message of exactly `size` bytes.
    ///
    /// The header's `size` field is initialized to match the allocation.
    fn new_zeroed(size: u32) -> Self {
        let layout = Self::layout(size);
        let ptr = unsafe { alloc_zeroed(layout) };

        let Some(buffer) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        assert!((buffer.as_ptr() as usize).is_multiple_of(SECTOR_SIZE_USIZE));

        let mut message = Message {
            references: Cell::new(0),
            buffer,
            size,
        };

        message.header_mut().size = size;

        assert!(message.references.get() == 0);
        assert!(message.header().size == size);
        assert!(message.header().command == super::Command::Reserved);

        message
    }

    /// Total buffer length in bytes (header + body).
    #[inline]
    pub fn size(&self) -> u32 {
        assert!(self.size >= Self::LEN_MIN);
        assert!(self.size <= Self::LEN_MAX);
        self.size
    }

    #[inline]
    pub fn body_len(&self) -> u32 {
        self.size() - Self::LEN_MIN
    }

    #[inline]
    pub fn header(&self) -> &Header {
        assert!((self.buffer.as_ptr() as usize).is_multiple_of(align_of::<Header>()));

        // SAFETY:
        // - Buffer is sector-aligned, which satisfies Header's alignment
        // - Buffer is at least HEADER_SIZE bytes
        // - The header-region invariant guarantees a valid Header encoding
        // - Lifetime tied to &self
        unsafe { &*(self.buffer.as_ptr() as *const Header) }
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut Header {
        assert!((self.buffer.as_ptr() as usize).is_multiple_of(align_of::<Header>()));

        // SAFETY: As for `header`, with the lifetime tied to &mut self. Any
        // value written through &mut Header is a valid encoding.
        unsafe { &mut *(self.buffer.as_ptr() as *mut Header) }
    }

    /// Overwrites the header region with `header`.
    ///
    /// # Panics
    ///
    /// Panics if `header.size` doesn't match the allocation size.
    pub fn set_header(&mut self, header: &Header) {
        assert!(header.size == self.size);

        *self.header_mut() = *header;

        assert!(self.header().size == self.size);
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        let size = self.size();

        // SAFETY: The allocation is exactly `size` bytes and the body region
        // starts at HEADER_SIZE <= size.
        unsafe {
            core::slice::from_raw_parts(
                self.buffer.as_ptr().add(HEADER_SIZE_USIZE),
                (size - Self::LEN_MIN) as usize,
            )
        }
    }

    /// Returns a mutable slice of the body. Modifications invalidate the body
    /// checksum.
    #[inline]
    pub fn body_mut(&mut self) -> &mut [u8] {
        let size = self.size();

        // SAFETY: As for `body`, with the lifetime tied to &mut self.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.buffer.as_ptr().add(HEADER_SIZE_USIZE),
                (size - Self::LEN_MIN) as usize,
            )
        }
    }

    /// Returns the wire-format bytes: header followed by body.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let size = self.size();

        // SAFETY: The allocation is exactly `size` bytes.
        unsafe { core::slice::from_raw_parts(self.buffer.as_ptr(), size as usize) }
    }

    /// Raw pointer to the start of the buffer, for I/O submissions whose
    /// completions outlive any safe borrow.
    #[inline]
    pub(crate) fn buffer_ptr(&self) -> NonNull<u8> {
        self.buffer
    }

    /// Increments the reference count. Permitted at zero: this is how a
    /// freshly created message gains its first holder.
    #[inline]
    pub fn ref_acquire(&self) {
        let old = self.references.get();

        assert!(old < u32::MAX, "reference count overflowed");

        self.references.set(old + 1);

        assert!(self.references.get() == old + 1);
    }

    /// Decrements the reference count. Returns `true` when the count reaches
    /// zero. Panics on underflow.
    #[inline]
    pub fn ref_release(&self) -> bool {
        let old = self.references.get();

        assert!(old > 0, "reference count underflow");

        self.references.set(old - 1);

        assert!(self.references.get() == old - 1);

        old - 1 == 0
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.references.get()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        assert!(
            self.references.get() == 0,
            "message dropped with live references"
        );

        // SAFETY: `buffer` was allocated in `new_zeroed` with this exact
        // layout and is freed exactly once, here.
        unsafe { dealloc(self.buffer.as_ptr(), Self::layout(self.size)) };
    }
}

/// One-word, `Copy` handle to a heap-allocated [`Message`].
///
/// Handles do not own the message: callers manage the reference count via
/// [`Message::ref_acquire`] and [`unref`]. A handle held after the count
/// returns to zero is dangling; this cannot be enforced at compile time, so
/// every holder must pair its acquire with exactly one release.
#[derive(Copy, Clone)]
pub struct MessageHandle {
    ptr: NonNull<Message>,
}

const _: () = assert!(size_of::<MessageHandle>() == size_of::<*const Message>());

impl MessageHandle {
    /// # Safety
    ///
    /// The handle must point to a live message.
    /// No mutable references may exist to the same message.
    #[inline]
    pub unsafe fn as_ref(&self) -> &Message {
        assert!((self.ptr.as_ptr() as usize).is_multiple_of(align_of::<Message>()));

        unsafe { self.ptr.as_ref() }
    }

    /// # Safety
    ///
    /// The handle must point to a live message.
    /// No other references (mutable or shared) may exist to the same message.
    #[inline]
    pub unsafe fn as_mut(&mut self) -> &mut Message {
        assert!((self.ptr.as_ptr() as usize).is_multiple_of(align_of::<Message>()));

        unsafe { self.ptr.as_mut() }
    }

    /// Increments the reference count and returns `self`.
    ///
    /// # Safety
    ///
    /// The handle must point to a live message.
    #[inline]
    pub unsafe fn acquire(self) -> Self {
        // SAFETY: Caller guarantees the message is live.
        unsafe { self.as_ref().ref_acquire() };
        self
    }

    /// Current reference count.
    ///
    /// # Safety
    ///
    /// The handle must point to a live message.
    #[inline]
    pub unsafe fn ref_count(&self) -> u32 {
        // SAFETY: Caller guarantees the message is live.
        unsafe { self.as_ref().ref_count() }
    }
}

/// Allocates a zeroed message of exactly `size` bytes with zero references.
///
/// The caller becomes responsible for the message's lifetime: either reference
/// it (directly or through a send path) or [`destroy`] it.
pub fn create(size: u32) -> MessageHandle {
    let message = Box::new(Message::new_zeroed(size));

    // SAFETY: Box::into_raw never returns null.
    let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(message)) };

    let handle = MessageHandle { ptr };

    // SAFETY: Just allocated; trivially live.
    unsafe {
        assert!(handle.ref_count() == 0);
        assert!(handle.as_ref().size() == size);
    }

    handle
}

/// Releases one reference; destroys the message when the count reaches zero.
///
/// # Safety
///
/// The handle must point to a live message with at least one reference, and
/// the caller must not use any copy of the handle after the count reaches
/// zero.
pub unsafe fn unref(handle: MessageHandle) {
    // SAFETY: Caller guarantees the message is live and referenced.
    let zero = unsafe { handle.as_ref().ref_release() };
    if zero {
        // SAFETY: The count just hit zero, so no holder remains.
        unsafe { destroy(handle) };
    }
}

/// Frees a message whose reference count is zero.
///
/// # Safety
///
/// The handle must point to a live message with zero references, and no copy
/// of the handle may be used afterwards.
pub unsafe fn destroy(handle: MessageHandle) {
    // SAFETY: Caller guarantees the message is live with zero references; the
    // pointer came from Box::into_raw in `create` and is freed exactly once.
    unsafe {
        assert!(handle.ref_count() == 0);
        drop(Box::from_raw(handle.ptr.as_ptr()));
    }
}
