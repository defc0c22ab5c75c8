//! Bounded FIFO queue for the bus's send paths.
//!
//! Every queue in the bus is small and fixed at compile time: a connection
//! queues at most three outbound messages and the self-send queue holds a
//! handful of loopback messages between flushes. Slots are `Option<T>` so the
//! queue needs no unsafe code and drops abandoned elements itself; overflow
//! hands the rejected value back to the caller, who decides how to log and
//! release it. Wire order is preserved across any push/pop interleaving.

pub struct RingBuffer<T, const N: usize> {
    slots: [Option<T>; N],
    head: u32,
    len: u32,
}

impl<T, const N: usize> RingBuffer<T, N> {
    const CAPACITY: u32 = {
        assert!(N > 0, "RingBuffer capacity must be > 0");
        assert!(N <= u32::MAX as usize / 2, "capacity must fit in u32");
        N as u32
    };

    /// Constructs an empty queue with capacity `N`.
    pub fn new() -> Self {
        let queue = Self {
            slots: core::array::from_fn(|_| None),
            head: 0,
            len: 0,
        };

        assert!(queue.is_empty());
        queue
    }

    /// Physical slot of the element at logical position `logical`
    /// (0 = front).
    #[inline]
    fn slot(&self, logical: u32) -> usize {
        assert!(logical < Self::CAPACITY);
        assert!(self.head < Self::CAPACITY);

        ((self.head + logical) % Self::CAPACITY) as usize
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        Self::CAPACITY
    }

    /// Number of queued elements.
    #[inline]
    pub fn len(&self) -> u32 {
        assert!(self.len <= Self::CAPACITY);
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == Self::CAPACITY
    }

    /// Appends `value`, or returns `Err(value)` when the queue is full.
    ///
    /// Ownership stays with the caller on overflow so the send paths can
    /// release their reference and log the drop.
    pub fn push_back(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }

        let tail = self.slot(self.len);
        let displaced = self.slots[tail].replace(value);
        assert!(displaced.is_none(), "tail slot must be vacant");

        self.len += 1;
        assert!(self.len <= Self::CAPACITY);

        Ok(())
    }

    /// Appends `value` when the caller has already established spare
    /// capacity.
    ///
    /// # Panics
    ///
    /// Panics if the queue is full.
    pub fn push_back_assume_capacity(&mut self, value: T) {
        assert!(self.len < Self::CAPACITY, "queue full");

        let pushed = self.push_back(value);
        assert!(pushed.is_ok());
    }

    /// Removes and returns the oldest element, or `None` when empty.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let front = self.slot(0);
        let value = self.slots[front].take();
        assert!(value.is_some(), "front slot must be occupied");

        self.head = (self.head + 1) % Self::CAPACITY;
        self.len -= 1;

        value
    }

    /// Borrows the oldest element without removal.
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Borrows the element at logical position `logical` (0 = front, growing
    /// toward the back, across wraparound).
    pub fn get(&self, logical: u32) -> Option<&T> {
        if logical >= self.len {
            return None;
        }

        let value = self.slots[self.slot(logical)].as_ref();
        assert!(value.is_some(), "slot within len must be occupied");

        value
    }

    /// Drops every queued element in FIFO order. The queue remains usable.
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}

        assert!(self.is_empty());
    }
}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for RingBuffer<T, N> {
    // Release in FIFO order rather than slot order.
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::RingBuffer;
    use crate::constants::{CONNECTION_SEND_QUEUE_MAX_USIZE, HEADER_SIZE_USIZE};
    use crate::vsr::wire::message::{self, Message};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A header-sized frame, as the send pipeline would transmit it.
    fn frame(fill: u8) -> Box<[u8; HEADER_SIZE_USIZE]> {
        Box::new([fill; HEADER_SIZE_USIZE])
    }

    #[test]
    fn send_queue_holds_exactly_its_capacity_in_frames() {
        let mut queue: RingBuffer<Box<[u8; HEADER_SIZE_USIZE]>, CONNECTION_SEND_QUEUE_MAX_USIZE> =
            RingBuffer::new();

        assert!(queue.push_back(frame(1)).is_ok());
        assert!(queue.push_back(frame(2)).is_ok());
        assert!(queue.push_back(frame(3)).is_ok());
        assert!(queue.is_full());

        // Overflow returns the frame so the caller can release it.
        let rejected = queue.push_back(frame(4)).unwrap_err();
        assert_eq!(rejected[0], 4);
        assert_eq!(queue.len(), 3);

        // Transmission order is enqueue order.
        assert_eq!(queue.front().map(|f| f[0]), Some(1));
        assert_eq!(queue.pop_front().map(|f| f[0]), Some(1));
        assert_eq!(queue.pop_front().map(|f| f[0]), Some(2));
        assert_eq!(queue.pop_front().map(|f| f[0]), Some(3));
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn wire_order_survives_wraparound() {
        // The send pipeline pops the head mid-stream while new messages keep
        // arriving; physical slots wrap but logical order must not.
        let mut queue: RingBuffer<Box<[u8; HEADER_SIZE_USIZE]>, 3> = RingBuffer::new();

        queue.push_back_assume_capacity(frame(10));
        queue.push_back_assume_capacity(frame(11));
        assert_eq!(queue.pop_front().map(|f| f[0]), Some(10));

        queue.push_back_assume_capacity(frame(12));
        queue.push_back_assume_capacity(frame(13));
        assert!(queue.is_full());

        assert_eq!(queue.get(0).map(|f| f[0]), Some(11));
        assert_eq!(queue.get(1).map(|f| f[0]), Some(12));
        assert_eq!(queue.get(2).map(|f| f[0]), Some(13));
        assert!(queue.get(3).is_none());
    }

    #[test]
    fn queued_message_handles_keep_their_references() {
        // The element type the bus actually queues: one reference per slot.
        let mut queue: RingBuffer<message::MessageHandle, CONNECTION_SEND_QUEUE_MAX_USIZE> =
            RingBuffer::new();

        // SAFETY: Handles stay live until the final unref below.
        unsafe {
            for view in 1..=3u32 {
                let mut handle = message::create(Message::LEN_MIN).acquire();
                handle.as_mut().header_mut().view = view;
                queue.push_back_assume_capacity(handle);
            }

            for expected in 1..=3u32 {
                let handle = queue.pop_front().unwrap();
                assert_eq!(handle.ref_count(), 1);
                assert_eq!(handle.as_ref().header().view, expected);
                message::unref(handle);
            }
        }

        assert!(queue.is_empty());
    }

    #[test]
    fn clear_and_drop_release_elements_in_fifo_order() {
        struct Recorded {
            id: u32,
            order: Rc<RefCell<Vec<u32>>>,
        }

        impl Drop for Recorded {
            fn drop(&mut self) {
                self.order.borrow_mut().push(self.id);
            }
        }

        let order = Rc::new(RefCell::new(Vec::new()));
        let record = |id| Recorded {
            id,
            order: Rc::clone(&order),
        };

        let mut queue: RingBuffer<Recorded, 3> = RingBuffer::new();
        queue.push_back_assume_capacity(record(1));
        queue.push_back_assume_capacity(record(2));
        queue.clear();
        assert_eq!(*order.borrow(), [1, 2]);
        assert!(queue.is_empty());

        // Reusable after clear; drop releases the remainder in FIFO order,
        // wrapped past the physical end of the slots.
        queue.push_back_assume_capacity(record(3));
        queue.push_back_assume_capacity(record(4));
        queue.push_back_assume_capacity(record(5));
        assert_eq!(queue.pop_front().map(|r| r.id), Some(3));
        queue.push_back_assume_capacity(record(6));
        drop(queue);

        assert_eq!(*order.borrow(), [1, 2, 3, 4, 5, 6]);
    }

    mod property_tests {
        use super::RingBuffer;
        use proptest::prelude::*;
        use std::collections::VecDeque;

        proptest! {
            #[test]
            fn behaves_like_a_bounded_vecdeque(ops in proptest::collection::vec(any::<Option<u8>>(), 0..200)) {
                let mut queue: RingBuffer<u8, 3> = RingBuffer::new();
                let mut model: VecDeque<u8> = VecDeque::new();

                for op in ops {
                    match op {
                        Some(value) => {
                            let pushed = queue.push_back(value).is_ok();
                            if model.len() < 3 {
                                prop_assert!(pushed);
                                model.push_back(value);
                            } else {
                                prop_assert!(!pushed);
                            }
                        }
                        None => {
                            prop_assert_eq!(queue.pop_front(), model.pop_front());
                        }
                    }

                    prop_assert_eq!(queue.len() as usize, model.len());
                    prop_assert_eq!(queue.front(), model.front());
                    prop_assert_eq!(queue.is_empty(), model.is_empty());
                    prop_assert_eq!(queue.is_full(), model.len() == 3);
                }
            }
        }
    }
}
