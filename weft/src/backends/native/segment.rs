//! In-process shared memory segment with atomic word access and a
//! futex-style wait/notify channel per 32-bit word.
//!
//! A `SharedBuffer` is a cheap clone-able handle onto one segment; handles
//! cross worker threads freely while all access goes through atomics. The
//! wait channel supports blocking waits (condvar parking) and asynchronous
//! waits that post a wake event into a worker's scheduler queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::worker::{TaskSender, WakeToken, WorkerEvent};

/// Outcome of a wait on a segment word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The waiter parked and was woken by a notify
    Ok,
    /// The word already differed from the expected value on entry
    NotEqual,
    /// The timeout elapsed before any notify arrived
    TimedOut,
}

/// How an asynchronous wait began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncWaitBegin {
    /// Resolved without parking; no wake event will be delivered
    Immediate(WaitStatus),
    /// Parked; a wake event carrying the registered token will follow
    Pending,
}

#[derive(Default)]
struct WordWaiters {
    /// Bumped on every notify; blocking waiters compare generations
    generation: u64,
    async_waiters: Vec<AsyncWaiter>,
}

struct AsyncWaiter {
    token: WakeToken,
    sender: TaskSender,
}

struct SharedSegment {
    words: Box<[AtomicU32]>,
    waiters: Mutex<HashMap<u32, WordWaiters>>,
    wake: Condvar,
}

/// Handle onto a shared atomic segment. Clones refer to the same memory.
#[derive(Clone)]
pub struct SharedBuffer {
    segment: Arc<SharedSegment>,
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::allocate(0)
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("byte_len", &self.byte_len())
            .finish()
    }
}

impl SharedBuffer {
    /// Allocates a zeroed segment, rounding the length up to a multiple of 8
    pub fn allocate(byte_len: usize) -> Self {
        let rounded = byte_len.div_ceil(8) * 8;
        let words = (0..rounded / 4).map(|_| AtomicU32::new(0)).collect();
        Self {
            segment: Arc::new(SharedSegment {
                words,
                waiters: Mutex::new(HashMap::new()),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.segment.words.len() * 4
    }

    /// Whether two handles view the same underlying segment
    pub fn same_segment(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.segment, &other.segment)
    }

    fn word(&self, index: u32) -> &AtomicU32 {
        &self.segment.words[index as usize]
    }

    // Atomic word access. All orderings are sequentially consistent; the
    // wait/notify protocol assumes nothing weaker.

    pub fn load_u32(&self, index: u32) -> u32 {
        self.word(index).load(Ordering::SeqCst)
    }

    pub fn store_u32(&self, index: u32, value: u32) {
        self.word(index).store(value, Ordering::SeqCst);
    }

    pub fn compare_exchange_u32(&self, index: u32, current: u32, new: u32) -> Result<u32, u32> {
        self.word(index)
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn load_i32(&self, index: u32) -> i32 {
        self.load_u32(index) as i32
    }

    pub fn store_i32(&self, index: u32, value: i32) {
        self.store_u32(index, value as u32);
    }

    /// Reads an f64 spanning two consecutive words. Not atomic as a unit;
    /// callers serialize multi-word access through the struct lock.
    pub fn load_f64(&self, word_index: u32) -> f64 {
        let lo = u64::from(self.load_u32(word_index));
        let hi = u64::from(self.load_u32(word_index + 1));
        f64::from_bits(lo | (hi << 32))
    }

    pub fn store_f64(&self, word_index: u32, value: f64) {
        let bits = value.to_bits();
        self.store_u32(word_index, (bits & 0xFFFF_FFFF) as u32);
        self.store_u32(word_index + 1, (bits >> 32) as u32);
    }

    /// Reads a 16-bit value at an even byte offset
    pub fn load_u16(&self, byte_offset: u32) -> u16 {
        debug_assert_eq!(byte_offset % 2, 0);
        let shift = (byte_offset % 4) * 8;
        ((self.load_u32(byte_offset / 4) >> shift) & 0xFFFF) as u16
    }

    /// Writes a 16-bit value at an even byte offset. Read-modify-write of
    /// the containing word; callers serialize through the struct lock.
    pub fn store_u16(&self, byte_offset: u32, value: u16) {
        debug_assert_eq!(byte_offset % 2, 0);
        let shift = (byte_offset % 4) * 8;
        let word = self.word(byte_offset / 4);
        let old = word.load(Ordering::SeqCst);
        let new = (old & !(0xFFFFu32 << shift)) | (u32::from(value) << shift);
        word.store(new, Ordering::SeqCst);
    }

    // Wait/notify channel

    /// Parks the calling thread until the word at `index` is notified, or
    /// until `timeout` elapses. Returns `NotEqual` without parking when the
    /// word already differs from `expected`.
    pub fn wait(&self, index: u32, expected: u32, timeout: Option<Duration>) -> WaitStatus {
        let segment = &self.segment;
        let mut waiters = segment
            .waiters
            .lock()
            .expect("segment waiter registry poisoned");
        if self.load_u32(index) != expected {
            return WaitStatus::NotEqual;
        }
        let start_generation = waiters.entry(index).or_default().generation;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            waiters = match deadline {
                None => segment
                    .wake
                    .wait(waiters)
                    .expect("segment waiter registry poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitStatus::TimedOut;
                    }
                    segment
                        .wake
                        .wait_timeout(waiters, deadline - now)
                        .expect("segment waiter registry poisoned")
                        .0
                }
            };
            let generation = waiters.get(&index).map(|w| w.generation).unwrap_or(0);
            if generation != start_generation {
                return WaitStatus::Ok;
            }
        }
    }

    /// Begins an asynchronous wait. When the word already differs from
    /// `expected` the result is immediate and nothing is registered;
    /// otherwise a `WorkerEvent::WaitResolved` carrying `token` is posted to
    /// `sender` on the next notify.
    pub fn wait_async(
        &self,
        index: u32,
        expected: u32,
        sender: TaskSender,
        token: WakeToken,
    ) -> AsyncWaitBegin {
        let mut waiters = self
            .segment
            .waiters
            .lock()
            .expect("segment waiter registry poisoned");
        if self.load_u32(index) != expected {
            return AsyncWaitBegin::Immediate(WaitStatus::NotEqual);
        }
        waiters
            .entry(index)
            .or_default()
            .async_waiters
            .push(AsyncWaiter { token, sender });
        AsyncWaitBegin::Pending
    }

    /// Removes a registered asynchronous waiter. Returns false when the
    /// waiter was already resolved (its wake event is in flight or drained).
    pub fn cancel_wait(&self, index: u32, token: WakeToken) -> bool {
        let mut waiters = self
            .segment
            .waiters
            .lock()
            .expect("segment waiter registry poisoned");
        let Some(entry) = waiters.get_mut(&index) else {
            return false;
        };
        let before = entry.async_waiters.len();
        entry.async_waiters.retain(|w| w.token != token);
        entry.async_waiters.len() != before
    }

    /// Wakes every waiter parked on the word at `index`. Returns the number
    /// of asynchronous waiters that received a wake event.
    pub fn notify(&self, index: u32) -> usize {
        let segment = &self.segment;
        let mut waiters = segment
            .waiters
            .lock()
            .expect("segment waiter registry poisoned");
        let entry = waiters.entry(index).or_default();
        entry.generation = entry.generation.wrapping_add(1);
        let mut woken = 0;
        for waiter in entry.async_waiters.drain(..) {
            waiter.sender.send(WorkerEvent::WaitResolved {
                token: waiter.token,
                status: WaitStatus::Ok,
            });
            woken += 1;
        }
        drop(waiters);
        segment.wake.notify_all();
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerContext;
    use std::thread;

    #[test]
    fn allocation_rounds_up_to_eight_bytes() {
        assert_eq!(SharedBuffer::allocate(0).byte_len(), 0);
        assert_eq!(SharedBuffer::allocate(1).byte_len(), 8);
        assert_eq!(SharedBuffer::allocate(40).byte_len(), 40);
        assert_eq!(SharedBuffer::allocate(41).byte_len(), 48);
    }

    #[test]
    fn f64_roundtrips_across_two_words() {
        let buffer = SharedBuffer::allocate(16);
        buffer.store_f64(0, -1234.5678);
        assert_eq!(buffer.load_f64(0), -1234.5678);
        buffer.store_f64(2, f64::MAX);
        assert_eq!(buffer.load_f64(2), f64::MAX);
    }

    #[test]
    fn u16_halves_do_not_clobber_each_other() {
        let buffer = SharedBuffer::allocate(8);
        buffer.store_u16(0, 0xAAAA);
        buffer.store_u16(2, 0x5555);
        assert_eq!(buffer.load_u16(0), 0xAAAA);
        assert_eq!(buffer.load_u16(2), 0x5555);
        assert_eq!(buffer.load_u32(0), 0x5555_AAAA);
    }

    #[test]
    fn wait_reports_not_equal_on_entry() {
        let buffer = SharedBuffer::allocate(8);
        buffer.store_u32(0, 7);
        assert_eq!(buffer.wait(0, 3, None), WaitStatus::NotEqual);
    }

    #[test]
    fn wait_times_out() {
        let buffer = SharedBuffer::allocate(8);
        let status = buffer.wait(0, 0, Some(Duration::from_millis(20)));
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[test]
    fn notify_wakes_blocked_waiter() {
        let buffer = SharedBuffer::allocate(8);
        let remote = buffer.clone();
        let waiter = thread::spawn(move || remote.wait(0, 0, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(30));
        buffer.store_u32(0, 42);
        buffer.notify(0);
        assert_eq!(waiter.join().unwrap(), WaitStatus::Ok);
    }

    #[test]
    fn async_wait_resolves_immediately_when_value_differs() {
        let context = WorkerContext::new();
        let buffer = SharedBuffer::allocate(8);
        buffer.store_u32(1, 9);
        let begin = buffer.wait_async(1, 3, context.task_sender(), 1);
        assert_eq!(begin, AsyncWaitBegin::Immediate(WaitStatus::NotEqual));
    }

    #[test]
    fn async_wait_delivers_wake_event() {
        let context = WorkerContext::new();
        let buffer = SharedBuffer::allocate(8);
        let begin = buffer.wait_async(0, 0, context.task_sender(), 77);
        assert_eq!(begin, AsyncWaitBegin::Pending);
        assert_eq!(buffer.notify(0), 1);
        // the waiter drained on notify, so cancellation finds nothing
        assert!(!buffer.cancel_wait(0, 77));
    }
}
