//! A typed view over a shared atomic buffer.
//!
//! The first 40 bytes of every buffer are the header tabulated below; the
//! property region follows, laid out by the view's schema. The header's lock
//! word implements a cooperative mutex (compare-exchange + park) and the
//! notify word a futex-style channel that peers use to signal mutations.
//!
//! | word | field |
//! |------|----------------------|
//! | 0    | type id              |
//! | 1    | notify word          |
//! | 2    | lock word            |
//! | 3    | reserved (alignment) |
//! | 4-5  | unique id (f64)      |
//! | 6-7  | dirty bitmask        |
//! | 8-9  | undefined bitmask    |

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use crate::backends::{AsyncWaitBegin, SharedBuffer, WaitStatus};
use crate::router::Router;
use crate::worker::WorkerContext;

use super::error::BufferError;
use super::schema::{PropertySlot, PropertyType, PropertyValue, StructSchema, MAX_STRING_CODE_UNITS};

/// Header size; the property region starts here
pub const HEADER_BYTES: u32 = 40;

pub const TYPE_ID_WORD: u32 = 0;
pub const NOTIFY_WORD: u32 = 1;
pub const LOCK_WORD: u32 = 2;
pub const UNIQUE_ID_WORD: u32 = 4;
pub const DIRTY_WORD_0: u32 = 6;
pub const DIRTY_WORD_1: u32 = 7;
pub const UNDEFINED_WORD_0: u32 = 8;
pub const UNDEFINED_WORD_1: u32 = 9;

/// A schema-typed view over a shared buffer.
///
/// Each view carries its own random lock id, so two views over the same
/// buffer (one per worker) contend as distinct holders. The lock is not
/// reentrant: acquiring it twice from one view deadlocks.
#[derive(Clone)]
pub struct BufferStruct {
    schema: Arc<StructSchema>,
    buffer: SharedBuffer,
    lock_id: u32,
}

/// Releases the lock word on drop so panics inside critical sections
/// cannot leave the buffer locked
struct LockGuard<'a> {
    owner: &'a BufferStruct,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.owner.buffer.store_u32(LOCK_WORD, 0);
        self.owner.buffer.notify(LOCK_WORD);
    }
}

fn random_lock_id() -> u32 {
    // zero means "free"; any other value is a valid holder id
    rand::random::<u32>() | 1
}

impl BufferStruct {
    /// Allocates a fresh buffer: stamps the type id, mints and stores the
    /// unique id from the router's generator, and marks every nullable
    /// property undefined
    pub fn new(schema: &Arc<StructSchema>) -> Result<Self, BufferError> {
        let router = Router::try_instance().map_err(|_| BufferError::RouterNotInitialized)?;
        let buffer = SharedBuffer::allocate(schema.byte_len() as usize);
        buffer.store_u32(TYPE_ID_WORD, schema.type_id());
        buffer.store_f64(UNIQUE_ID_WORD, router.generate_unique_id() as f64);

        let this = Self {
            schema: schema.clone(),
            buffer,
            lock_id: random_lock_id(),
        };
        for slot in schema.slots() {
            if slot.def.allow_undefined {
                this.set_undefined_bit(slot.prop_num, true);
            }
        }
        Ok(this)
    }

    /// Wraps an existing buffer, verifying it carries this schema's type id
    pub fn from_existing(
        schema: &Arc<StructSchema>,
        buffer: SharedBuffer,
    ) -> Result<Self, BufferError> {
        let found = Self::extract_type_id(&buffer);
        if found != schema.type_id() {
            return Err(BufferError::TypeIdMismatch {
                expected: schema.type_id(),
                expected_tag: schema.tag().to_string(),
                found,
            });
        }
        Ok(Self {
            schema: schema.clone(),
            buffer,
            lock_id: random_lock_id(),
        })
    }

    /// Reads the raw type id of a buffer; 0 when the buffer is too small or
    /// misaligned to carry a header. No validity check is performed.
    pub fn extract_type_id(buffer: &SharedBuffer) -> u32 {
        let len = buffer.byte_len();
        if len < HEADER_BYTES as usize || len % 8 != 0 {
            return 0;
        }
        buffer.load_u32(TYPE_ID_WORD)
    }

    pub fn schema(&self) -> &Arc<StructSchema> {
        &self.schema
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn type_id(&self) -> u32 {
        self.buffer.load_u32(TYPE_ID_WORD)
    }

    pub fn unique_id(&self) -> u64 {
        self.buffer.load_f64(UNIQUE_ID_WORD) as u64
    }

    // Lock protocol

    fn try_acquire(&self) -> Result<(), u32> {
        match self
            .buffer
            .compare_exchange_u32(LOCK_WORD, 0, self.lock_id)
        {
            Ok(_) => Ok(()),
            Err(observed) => Err(observed),
        }
    }

    /// Runs `f` with the lock held, parking with a blocking wait while
    /// contended. On workers where blocking waits are disallowed this
    /// degrades to a busy spin on the compare-exchange.
    pub fn lock<R>(&self, context: &WorkerContext, f: impl FnOnce() -> R) -> R {
        loop {
            match self.try_acquire() {
                Ok(()) => {
                    let _guard = LockGuard { owner: self };
                    return f();
                }
                Err(observed) => {
                    if context.blocking_wait_allowed() {
                        self.buffer.wait(LOCK_WORD, observed, None);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Runs `f` with the lock held, parking asynchronously while contended.
    /// `f` runs on this worker once the lock is acquired; the lock is
    /// released when it returns (or unwinds).
    pub fn lock_async(&self, context: &WorkerContext, f: impl FnOnce() + 'static) {
        fn attempt(this: BufferStruct, context: WorkerContext, f: Box<dyn FnOnce()>) {
            match this.try_acquire() {
                Ok(()) => {
                    let _guard = LockGuard { owner: &this };
                    f();
                }
                Err(observed) => {
                    let retry_this = this.clone();
                    let retry_context = context.clone();
                    let token = context.register_wake(
                        move |_status| attempt(retry_this, retry_context, f),
                        None,
                    );
                    match this
                        .buffer
                        .wait_async(LOCK_WORD, observed, context.task_sender(), token)
                    {
                        AsyncWaitBegin::Pending => {}
                        AsyncWaitBegin::Immediate(_) => {
                            // the holder released between the failed exchange
                            // and registration; retry on the microtask queue
                            let handler = context
                                .take_wake(token)
                                .expect("lock retry continuation vanished");
                            context.schedule_microtask(move || handler(WaitStatus::NotEqual));
                        }
                    }
                }
            }
        }
        attempt(self.clone(), context.clone(), Box::new(f));
    }

    // Notify/wait channel

    /// Current value of the notify word
    pub fn notify_value(&self) -> u32 {
        self.buffer.load_u32(NOTIFY_WORD)
    }

    /// Optionally stores a new notify value, then wakes every waiter parked
    /// on the notify word
    pub fn notify(&self, value: Option<u32>) {
        if let Some(value) = value {
            self.buffer.store_u32(NOTIFY_WORD, value);
        }
        self.buffer.notify(NOTIFY_WORD);
    }

    /// Blocks until the notify word differs from `expected` or the timeout
    /// elapses
    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> WaitStatus {
        self.buffer.wait(NOTIFY_WORD, expected, timeout)
    }

    /// Begins an asynchronous wait on the notify word. The handler runs on
    /// this worker when the wait resolves; an immediate result means the
    /// word already differed and the handler will not run.
    pub fn wait_async(
        &self,
        context: &WorkerContext,
        expected: u32,
        timeout: Option<Duration>,
        handler: impl FnOnce(WaitStatus) + 'static,
    ) -> AsyncWaitBegin {
        let deadline = timeout.map(|t| Instant::now() + t);
        let token = context.register_wake(handler, deadline);
        let begin = self
            .buffer
            .wait_async(NOTIFY_WORD, expected, context.task_sender(), token);
        match begin {
            AsyncWaitBegin::Pending => {
                if deadline.is_some() {
                    let buffer = self.buffer.clone();
                    context.set_wake_canceller(token, move || buffer.cancel_wait(NOTIFY_WORD, token));
                }
            }
            AsyncWaitBegin::Immediate(_) => {
                context.take_wake(token);
            }
        }
        begin
    }

    // Dirty and undefined bitmasks

    fn mask_word_and_bit(base_word: u32, prop_num: u8) -> (u32, u32) {
        (base_word + u32::from(prop_num) / 32, 1 << (u32::from(prop_num) % 32))
    }

    /// Whether any property has been written since the last `reset_dirty`
    pub fn is_dirty(&self) -> bool {
        self.buffer.load_u32(DIRTY_WORD_0) != 0 || self.buffer.load_u32(DIRTY_WORD_1) != 0
    }

    pub fn is_prop_dirty(&self, prop_num: u8) -> bool {
        let (word, bit) = Self::mask_word_and_bit(DIRTY_WORD_0, prop_num);
        self.buffer.load_u32(word) & bit != 0
    }

    fn set_dirty_bit(&self, prop_num: u8) {
        let (word, bit) = Self::mask_word_and_bit(DIRTY_WORD_0, prop_num);
        self.buffer.store_u32(word, self.buffer.load_u32(word) | bit);
    }

    /// Zeroes the notify word and both dirty words. Only called while the
    /// lock is held.
    pub fn reset_dirty(&self) {
        self.buffer.store_u32(NOTIFY_WORD, 0);
        self.buffer.store_u32(DIRTY_WORD_0, 0);
        self.buffer.store_u32(DIRTY_WORD_1, 0);
    }

    fn is_undefined(&self, prop_num: u8) -> bool {
        let (word, bit) = Self::mask_word_and_bit(UNDEFINED_WORD_0, prop_num);
        self.buffer.load_u32(word) & bit != 0
    }

    /// Flips the undefined bit; returns whether the bit actually changed
    fn set_undefined_bit(&self, prop_num: u8, undefined: bool) -> bool {
        let (word, bit) = Self::mask_word_and_bit(UNDEFINED_WORD_0, prop_num);
        let old = self.buffer.load_u32(word);
        let new = if undefined { old | bit } else { old & !bit };
        self.buffer.store_u32(word, new);
        old != new
    }

    // Property codec

    /// Reads a property slot into a value. An undefined nullable property
    /// reads as `Undefined` regardless of the payload bytes.
    pub fn read_property(&self, slot: &PropertySlot) -> PropertyValue {
        if slot.def.allow_undefined && self.is_undefined(slot.prop_num) {
            return PropertyValue::Undefined;
        }
        match slot.def.prop_type {
            PropertyType::Number => PropertyValue::Number(self.buffer.load_f64(slot.byte_offset / 4)),
            PropertyType::Int32 => PropertyValue::Int32(self.buffer.load_i32(slot.byte_offset / 4)),
            PropertyType::Boolean => {
                PropertyValue::Boolean(self.buffer.load_i32(slot.byte_offset / 4) != 0)
            }
            PropertyType::Str => PropertyValue::Str(
                String::from_utf16_lossy(&self.read_string_units(slot)),
            ),
        }
    }

    /// Writes a value into a property slot, setting its dirty bit when the
    /// stored contents actually change. Returns whether they did.
    ///
    /// # Panics
    ///
    /// Panics when the value's type does not match the slot, or when
    /// `Undefined` is written to a non-nullable property. Both are
    /// programming errors in the calling schema code.
    pub fn write_property(&self, slot: &PropertySlot, value: &PropertyValue) -> bool {
        let name = slot.def.name;
        if value.is_undefined() {
            if !slot.def.allow_undefined {
                panic!("property '{name}' does not allow undefined");
            }
            let changed = self.set_undefined_bit(slot.prop_num, true);
            if changed {
                self.set_dirty_bit(slot.prop_num);
            }
            return changed;
        }

        let was_undefined = slot.def.allow_undefined && self.is_undefined(slot.prop_num);
        let payload_changed = match (slot.def.prop_type, value) {
            (PropertyType::Number, PropertyValue::Number(new)) => {
                let changed = was_undefined || self.buffer.load_f64(slot.byte_offset / 4) != *new;
                if changed {
                    self.buffer.store_f64(slot.byte_offset / 4, *new);
                }
                changed
            }
            (PropertyType::Int32, PropertyValue::Int32(new)) => {
                let changed = was_undefined || self.buffer.load_i32(slot.byte_offset / 4) != *new;
                if changed {
                    self.buffer.store_i32(slot.byte_offset / 4, *new);
                }
                changed
            }
            (PropertyType::Boolean, PropertyValue::Boolean(new)) => {
                let stored = i32::from(*new);
                let changed =
                    was_undefined || self.buffer.load_i32(slot.byte_offset / 4) != stored;
                if changed {
                    self.buffer.store_i32(slot.byte_offset / 4, stored);
                }
                changed
            }
            (PropertyType::Str, PropertyValue::Str(new)) => {
                let mut units: Vec<u16> = new.encode_utf16().collect();
                if units.len() > MAX_STRING_CODE_UNITS {
                    warn!(
                        "string property '{name}' is {} code units, truncating to {MAX_STRING_CODE_UNITS}",
                        units.len()
                    );
                    units.truncate(MAX_STRING_CODE_UNITS);
                }
                let changed = was_undefined || self.read_string_units(slot) != units;
                if changed {
                    self.write_string_units(slot, &units);
                }
                changed
            }
            (expected, got) => {
                panic!("property '{name}' expects {expected:?}, got {got:?}")
            }
        };

        if was_undefined {
            self.set_undefined_bit(slot.prop_num, false);
        }
        if payload_changed {
            self.set_dirty_bit(slot.prop_num);
        }
        payload_changed
    }

    fn read_string_units(&self, slot: &PropertySlot) -> Vec<u16> {
        let length = usize::from(self.buffer.load_u16(slot.byte_offset));
        if length > MAX_STRING_CODE_UNITS {
            panic!(
                "string property '{}' has stored length {length}, buffer is corrupt",
                slot.def.name
            );
        }
        (0..length)
            .map(|i| self.buffer.load_u16(slot.byte_offset + 2 + (i as u32) * 2))
            .collect()
    }

    fn write_string_units(&self, slot: &PropertySlot, units: &[u16]) {
        self.buffer.store_u16(slot.byte_offset, units.len() as u16);
        for (i, unit) in units.iter().enumerate() {
            self.buffer
                .store_u16(slot.byte_offset + 2 + (i as u32) * 2, *unit);
        }
    }
}

impl std::fmt::Debug for BufferStruct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStruct")
            .field("tag", &self.schema.tag())
            .field("unique_id", &self.unique_id())
            .finish()
    }
}
