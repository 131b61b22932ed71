//! `NetMessage` is the unit of payload moved through the framework and the
//! byte buffer backing it: a readable window `[reader_pos, writer_pos)` over
//! either a fixed inline array (small messages never touch the allocator) or
//! a heap vector once the content outgrows it. Promotion to heap storage is
//! one-way.

/// Content up to this size is stored inline; it is also the chunk size used
/// for stream-oriented socket reads.
pub const INLINE_CAPACITY: usize = 128;

enum Storage {
    Inline([u8; INLINE_CAPACITY]),
    Heap(Vec<u8>),
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        match self {
            Storage::Inline(a) => Storage::Inline(*a),
            Storage::Heap(v) => Storage::Heap(v.clone()),
        }
    }
}

pub struct NetMessage {
    reader_pos: usize,
    writer_pos: usize,
    storage: Storage,
}

impl Default for NetMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for NetMessage {
    fn clone(&self) -> Self {
        Self {
            reader_pos: self.reader_pos,
            writer_pos: self.writer_pos,
            storage: self.storage.clone(),
        }
    }
}

impl std::fmt::Debug for NetMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetMessage")
            .field("readable", &self.readable())
            .field("dynamic", &self.is_dynamic())
            .finish()
    }
}

impl NetMessage {
    pub fn new() -> Self {
        Self {
            reader_pos: 0,
            writer_pos: 0,
            storage: Storage::Inline([0u8; INLINE_CAPACITY]),
        }
    }

    /// Pre-sizes the buffer for `size` writable bytes.
    pub fn with_capacity(size: usize) -> Self {
        let mut msg = Self::new();
        msg.ensure_writable(size);
        msg
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut msg = Self::new();
        msg.write(data);
        msg
    }

    /// True once the content has been promoted to heap storage.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.storage, Storage::Heap(_))
    }

    pub fn readable(&self) -> usize {
        self.writer_pos - self.reader_pos
    }

    /// Slack in front of the readable window, reclaimable by compaction.
    pub fn prependable(&self) -> usize {
        self.reader_pos
    }

    pub fn writeable(&self) -> usize {
        self.extent() - self.writer_pos
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Inline(_) => INLINE_CAPACITY,
            Storage::Heap(v) => v.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    /// The readable window.
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Inline(a) => &a[self.reader_pos..self.writer_pos],
            Storage::Heap(v) => &v[self.reader_pos..self.writer_pos],
        }
    }

    // writable extent of the current storage (heap vectors are kept at the
    // length ensure_writable grew them to).
    fn extent(&self) -> usize {
        match &self.storage {
            Storage::Inline(_) => INLINE_CAPACITY,
            Storage::Heap(v) => v.len(),
        }
    }

    pub fn clear(&mut self) {
        // stays dynamic once promoted.
        self.reader_pos = 0;
        self.writer_pos = 0;
    }

    /// Consumes `size` bytes from the front of the readable window.
    pub fn retrieve(&mut self, size: usize) {
        assert!(self.readable() >= size, "retrieve beyond readable bytes");
        if self.readable() > size {
            self.reader_pos += size;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_pos = 0;
        self.writer_pos = 0;
    }

    /// Advances the writer cursor over bytes filled in externally.
    pub fn has_written(&mut self, size: usize) {
        assert!(self.writeable() >= size);
        self.writer_pos += size;
    }

    /// Guarantees `writeable() >= size`, compacting in place when leading
    /// slack suffices and promoting to heap storage otherwise.
    pub fn ensure_writable(&mut self, size: usize) {
        if self.writeable() < size {
            self.make_space(size);
        }
        debug_assert!(self.writeable() >= size);
    }

    /// Grows heap capacity ahead of time. No effect while the content still
    /// fits inline.
    pub fn reserve(&mut self, size: usize) {
        if !self.is_dynamic() {
            if size <= INLINE_CAPACITY {
                return;
            }
            self.set_dynamic();
        }
        if let Storage::Heap(v) = &mut self.storage {
            v.reserve(size);
        }
    }

    /// Moves the content out, resetting `self` to the empty inline state.
    pub fn take(&mut self) -> NetMessage {
        std::mem::take(self)
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        self.ensure_writable(data.len());
        let w = self.writer_pos;
        match &mut self.storage {
            Storage::Inline(a) => a[w..w + data.len()].copy_from_slice(data),
            Storage::Heap(v) => v[w..w + data.len()].copy_from_slice(data),
        }
        self.writer_pos += data.len();
        data.len()
    }

    fn make_space(&mut self, size: usize) {
        if self.writeable() + self.prependable() < size {
            if !self.is_dynamic() {
                self.set_dynamic();
            }
            let target = self.writer_pos + size;
            if let Storage::Heap(v) = &mut self.storage {
                v.resize(target, 0);
            }
        } else {
            // enough total slack; shift the readable window to offset 0.
            let (r, w) = (self.reader_pos, self.writer_pos);
            match &mut self.storage {
                Storage::Inline(a) => a.copy_within(r..w, 0),
                Storage::Heap(v) => v.copy_within(r..w, 0),
            }
            self.writer_pos = w - r;
            self.reader_pos = 0;
        }
    }

    // One-way promotion. The readable window lands at offset 0.
    fn set_dynamic(&mut self) {
        assert!(!self.is_dynamic(), "reentrant promotion");
        let content = self.data().to_vec();
        self.reader_pos = 0;
        self.writer_pos = content.len();
        self.storage = Storage::Heap(content);
    }
}

/// Fixed-width integer accessors, native byte order. Reading past the
/// readable window is a caller bug: frame lengths must be validated against
/// the declared frame size before decoding fields out of a payload.
macro_rules! impl_pod_accessors {
    ($read:ident, $write:ident, $ty:ty) => {
        impl NetMessage {
            pub fn $read(&mut self) -> $ty {
                const N: usize = std::mem::size_of::<$ty>();
                assert!(
                    self.readable() >= N,
                    "buffer underrun: {} readable, {} wanted",
                    self.readable(),
                    N
                );
                let mut raw = [0u8; N];
                raw.copy_from_slice(&self.data()[..N]);
                self.retrieve(N);
                <$ty>::from_ne_bytes(raw)
            }

            pub fn $write(&mut self, value: $ty) {
                self.write(&value.to_ne_bytes());
            }
        }
    };
}

impl_pod_accessors!(read_u8, write_u8, u8);
impl_pod_accessors!(read_i8, write_i8, i8);
impl_pod_accessors!(read_u16, write_u16, u16);
impl_pod_accessors!(read_i16, write_i16, i16);
impl_pod_accessors!(read_u32, write_u32, u32);
impl_pod_accessors!(read_i32, write_i32, i32);
impl_pod_accessors!(read_u64, write_u64, u64);
impl_pod_accessors!(read_i64, write_i64, i64);

impl NetMessage {
    /// Appends the raw bytes of `value`, no terminator and no length.
    pub fn write_string(&mut self, value: &str) {
        if !value.is_empty() {
            self.write(value.as_bytes());
        }
    }

    /// Appends the bytes of `value` followed by a NUL terminator.
    pub fn write_terminated_string(&mut self, value: &str) {
        self.write_string(value);
        self.write_u8(0);
    }

    /// Reads up to the NUL terminator, consuming the terminator as well.
    /// A missing terminator is a caller bug.
    pub fn read_terminated_string(&mut self) -> String {
        let pos = self
            .data()
            .iter()
            .position(|&b| b == 0)
            .expect("no string terminator in readable bytes");
        let value = String::from_utf8_lossy(&self.data()[..pos]).into_owned();
        self.retrieve(pos + 1);
        value
    }

    /// Appends a native-endian u32 length followed by the string bytes.
    pub fn write_length_and_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.write_string(value);
    }

    pub fn read_length_and_string(&mut self) -> String {
        let length = self.read_u32() as usize;
        assert!(
            self.readable() >= length,
            "buffer underrun: {} readable, {} wanted",
            self.readable(),
            length
        );
        let value = String::from_utf8_lossy(&self.data()[..length]).into_owned();
        self.retrieve(length);
        value
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_inline_until_threshold() {
        let mut msg = NetMessage::new();
        msg.write(&[7u8; INLINE_CAPACITY]);
        assert!(!msg.is_dynamic());
        assert_eq!(msg.readable(), INLINE_CAPACITY);
        assert_eq!(msg.writeable(), 0);
        assert_eq!(msg.capacity(), INLINE_CAPACITY);
    }

    #[test]
    pub fn test_compaction_reclaims_prependable() {
        let mut msg = NetMessage::new();
        msg.write(&[1u8; 100]);
        msg.retrieve(50);
        assert_eq!(msg.prependable(), 50);
        // 70 fits into trailing 28 + leading 50; must compact, not promote.
        msg.write(&[2u8; 70]);
        assert!(!msg.is_dynamic());
        assert_eq!(msg.readable(), 120);
        assert_eq!(msg.prependable(), 0);
        assert_eq!(msg.data()[..50], [1u8; 50]);
        assert_eq!(msg.data()[50..], [2u8; 70]);
    }

    #[test]
    pub fn test_promotion_preserves_readable() {
        let mut msg = NetMessage::new();
        msg.write(&[3u8; 100]);
        let before: Vec<u8> = msg.data().to_vec();
        msg.write(&[4u8; 100]);
        assert!(msg.is_dynamic());
        assert_eq!(msg.readable(), 200);
        assert_eq!(&msg.data()[..100], &before[..]);
        assert_eq!(msg.prependable(), 0);
        // stays dynamic after clear.
        msg.clear();
        assert!(msg.is_dynamic());
        assert!(msg.is_empty());
    }

    #[test]
    pub fn test_retrieve_all_resets_cursors() {
        let mut msg = NetMessage::from_slice(b"abcdef");
        msg.retrieve(6);
        assert_eq!(msg.prependable(), 0);
        assert_eq!(msg.writeable(), INLINE_CAPACITY);
    }

    #[test]
    pub fn test_take_resets_source() {
        let mut msg = NetMessage::new();
        msg.write(&[5u8; 300]);
        let taken = msg.take();
        assert!(taken.is_dynamic());
        assert_eq!(taken.readable(), 300);
        assert!(!msg.is_dynamic());
        assert!(msg.is_empty());
    }

    #[test]
    pub fn test_clone_is_deep() {
        let mut msg = NetMessage::new();
        msg.write(&[6u8; 200]);
        let copy = msg.clone();
        msg.retrieve(150);
        assert_eq!(copy.readable(), 200);
        assert_eq!(copy.data(), &[6u8; 200]);
    }

    #[test]
    pub fn test_pod_roundtrip() {
        let mut msg = NetMessage::new();
        msg.write_u16(0xBEEF);
        msg.write_i64(-42);
        msg.write_u8(9);
        assert_eq!(msg.read_u16(), 0xBEEF);
        assert_eq!(msg.read_i64(), -42);
        assert_eq!(msg.read_u8(), 9);
        assert!(msg.is_empty());
    }

    #[test]
    pub fn test_string_roundtrip() {
        let mut msg = NetMessage::new();
        msg.write_length_and_string("hello");
        msg.write_terminated_string("world");
        assert_eq!(msg.read_length_and_string(), "hello");
        assert_eq!(msg.read_terminated_string(), "world");
        assert!(msg.is_empty());
    }

    #[test]
    #[should_panic(expected = "buffer underrun")]
    pub fn test_underrun_panics() {
        let mut msg = NetMessage::from_slice(&[1, 2]);
        let _ = msg.read_u32();
    }
}
