//! Bounded multi-producer, single-consumer message ring between the host thread and the render
//! thread. Producers never block: a full ring drops the message.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MessageKind {
    #[default]
    ExitNeeded = 0,
}

impl MessageKind {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::ExitNeeded,
            other => {
                log::warn!("[signal] unknown message kind {other}, treating as exit");
                Self::ExitNeeded
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: u64,
}

impl Message {
    pub const fn exit() -> Self {
        Self {
            kind: MessageKind::ExitNeeded,
            payload: 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal capacity {0} is not a non-zero power of two")]
    CapacityNotPowerOfTwo(usize),
}

#[repr(align(64))]
struct CacheAligned(AtomicUsize);

struct Slot {
    /// `position + 1` once the message for `position` is readable.
    sequence: AtomicUsize,
    kind: AtomicU8,
    payload: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            sequence: AtomicUsize::new(0),
            kind: AtomicU8::new(MessageKind::default() as u8),
            payload: AtomicU64::new(0),
        }
    }
}

struct Ring {
    head: CacheAligned,
    tail: CacheAligned,
    mask: usize,
    slots: Box<[Slot]>,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Creates a connected sender/receiver pair.
pub fn channel(capacity: usize) -> Result<(SignalSender, SignalReceiver), SignalError> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(SignalError::CapacityNotPowerOfTwo(capacity));
    }
    let slots = (0..capacity).map(|_| Slot::empty()).collect();
    let ring = Arc::new(Ring {
        head: CacheAligned(AtomicUsize::new(0)),
        tail: CacheAligned(AtomicUsize::new(0)),
        mask: capacity - 1,
        slots,
    });
    Ok((
        SignalSender { ring: ring.clone() },
        SignalReceiver { ring },
    ))
}

#[derive(Clone)]
pub struct SignalSender {
    ring: Arc<Ring>,
}

impl SignalSender {
    /// Enqueues `message`. Returns `false` and drops it when the ring is full.
    pub fn post(&self, message: Message) -> bool {
        let ring = &*self.ring;
        let mut tail = ring.tail.0.load(Ordering::Relaxed);
        loop {
            let head = ring.head.0.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= ring.capacity() {
                log::warn!("[signal] ring full, dropping {:?}", message.kind);
                return false;
            }
            match ring.tail.0.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => tail = current,
            }
        }

        // The reservation gives this producer the slot until the sequence store publishes it.
        let slot = &ring.slots[tail & ring.mask];
        slot.kind.store(message.kind as u8, Ordering::Relaxed);
        slot.payload.store(message.payload, Ordering::Relaxed);
        slot.sequence.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

pub struct SignalReceiver {
    ring: Arc<Ring>,
}

impl SignalReceiver {
    /// Takes the oldest published message without blocking.
    pub fn poll(&mut self) -> Option<Message> {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let slot = &ring.slots[head & ring.mask];
        if slot.sequence.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        let message = Message {
            kind: MessageKind::from_raw(slot.kind.load(Ordering::Relaxed)),
            payload: slot.payload.load(Ordering::Relaxed),
        };
        ring.head.0.store(head.wrapping_add(1), Ordering::Release);
        Some(message)
    }

    /// Polls at most `limit` messages.
    pub fn drain(&mut self, limit: usize) -> Vec<Message> {
        std::iter::from_fn(|| self.poll()).take(limit).collect()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn numbered(payload: u64) -> Message {
        Message {
            kind: MessageKind::ExitNeeded,
            payload,
        }
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert_eq!(
            channel(48).err(),
            Some(SignalError::CapacityNotPowerOfTwo(48))
        );
        assert_eq!(channel(0).err(), Some(SignalError::CapacityNotPowerOfTwo(0)));
    }

    #[test]
    fn empty_ring_polls_none() {
        let (_sender, mut receiver) = channel(4).expect("channel");
        assert_eq!(receiver.poll(), None);
    }

    #[test]
    fn slots_are_reused_after_consumption() {
        let (sender, mut receiver) = channel(2).expect("channel");
        for round in 0..10 {
            assert!(sender.post(numbered(round)));
            assert!(sender.post(numbered(round + 100)));
            assert!(!sender.post(numbered(round + 200)));
            assert_eq!(receiver.poll(), Some(numbered(round)));
            assert_eq!(receiver.poll(), Some(numbered(round + 100)));
        }
    }

    #[test]
    fn drain_respects_limit() {
        let (sender, mut receiver) = channel(8).expect("channel");
        for payload in 0..5 {
            sender.post(numbered(payload));
        }
        assert_eq!(receiver.drain(3).len(), 3);
        assert_eq!(receiver.drain(10), vec![numbered(3), numbered(4)]);
    }

    #[test]
    fn concurrent_producers_lose_nothing_within_capacity() {
        let (sender, mut receiver) = channel(64).expect("channel");
        let handles: Vec<_> = (0..4u64)
            .map(|producer| {
                let sender = sender.clone();
                thread::spawn(move || {
                    for i in 0..16 {
                        assert!(sender.post(numbered(producer * 100 + i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer thread");
        }

        let mut received: Vec<u64> = receiver.drain(usize::MAX).iter().map(|m| m.payload).collect();
        received.sort_unstable();
        let mut expected: Vec<u64> = (0..4u64)
            .flat_map(|producer| (0..16).map(move |i| producer * 100 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(received, expected);
    }

    proptest! {
        #[test]
        fn overflow_drops_exactly_the_excess(exp in 0u32..8, extra in 0usize..32) {
            let capacity = 1usize << exp;
            let (sender, mut receiver) = channel(capacity).expect("channel");

            let accepted = (0..capacity + extra)
                .filter(|i| sender.post(numbered(*i as u64)))
                .count();

            prop_assert_eq!(accepted, capacity);
            let drained = receiver.drain(usize::MAX);
            prop_assert_eq!(drained.len(), capacity);
        }

        #[test]
        fn delivery_is_fifo_without_duplicates(count in 0usize..64) {
            let (sender, mut receiver) = channel(64).expect("channel");
            for i in 0..count {
                prop_assert!(sender.post(numbered(i as u64)));
            }
            let payloads: Vec<u64> = receiver.drain(usize::MAX).iter().map(|m| m.payload).collect();
            let expected: Vec<u64> = (0..count as u64).collect();
            prop_assert_eq!(payloads, expected);
            prop_assert_eq!(receiver.poll(), None);
        }
    }
}
