//! A pooled memory block and its identity

use super::buffer::MmapBuffer;
use crate::error::Result;

/// A memory mapped buffer plus the identity of the data it currently holds.
///
/// The identity (`name`, `id`, `offset`, `length`) describes which byte range
/// of which object the buffer holds. `app_info` is an opaque payload owned by
/// the application using the pool; it survives [`Block::reuse`].
#[derive(Debug)]
pub struct Block<T> {
    /// Name of the object this block belongs to
    name: String,
    /// Unique id of this block within the object
    id: String,
    /// Start offset of the data this block holds
    offset: u64,
    /// Length of the data this block holds
    length: u64,
    /// Backing buffer, fixed size for the life of the block
    data: MmapBuffer,
    /// Application defined payload
    app_info: T,
}

impl<T: Default> Block<T> {
    /// Map a new block of exactly `size` bytes.
    pub(crate) fn allocate(size: usize) -> Result<Self> {
        Ok(Self {
            name: String::new(),
            id: String::new(),
            offset: 0,
            length: 0,
            data: MmapBuffer::allocate(size)?,
            app_info: T::default(),
        })
    }
}

impl<T> Block<T> {
    /// Unmap the backing buffer.
    pub(crate) fn release(self) -> Result<()> {
        self.data.release()
    }

    /// Reset identity fields, keeping the buffer and the app info.
    pub fn reuse(&mut self) {
        self.name.clear();
        self.id.clear();
        self.offset = 0;
        self.length = 0;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Record the byte range of the owning object held in this block.
    pub fn set_range(&mut self, offset: u64, length: u64) {
        self.offset = offset;
        self.length = length;
    }

    /// Size of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whole backing buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid prefix of the buffer, `length` bytes clamped to capacity.
    pub fn filled(&self) -> &[u8] {
        let len = std::cmp::min(self.length as usize, self.data.len());
        &self.data[..len]
    }

    pub fn app_info(&self) -> &T {
        &self.app_info
    }

    pub fn app_info_mut(&mut self) -> &mut T {
        &mut self.app_info
    }

    pub fn set_app_info(&mut self, info: T) {
        self.app_info = info;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Info {
        name: String,
        value: i32,
    }

    #[test]
    fn test_allocate_invalid_size() {
        let result = Block::<()>::allocate(0);
        assert!(matches!(result, Err(Error::BufferAllocation { .. })));
    }

    #[test]
    fn test_allocate() {
        let block = Block::<()>::allocate(10).unwrap();
        assert_eq!(block.capacity(), 10);
        assert_eq!(block.name(), "");
        assert_eq!(block.length(), 0);
        block.release().unwrap();
    }

    #[test]
    fn test_reuse_clears_identity() {
        let mut block = Block::<Info>::allocate(64).unwrap();
        block.set_name("object-a");
        block.set_id("3");
        block.set_range(4096, 64);
        block.set_app_info(Info {
            name: "test".into(),
            value: 10,
        });
        block.data_mut()[0] = 0xAB;

        block.reuse();

        assert_eq!(block.name(), "");
        assert_eq!(block.id(), "");
        assert_eq!(block.offset(), 0);
        assert_eq!(block.length(), 0);
        assert_eq!(block.capacity(), 64);
        assert_eq!(block.app_info().name, "test");
        assert_eq!(block.app_info().value, 10);
    }

    #[test]
    fn test_filled_is_clamped() {
        let mut block = Block::<()>::allocate(8).unwrap();
        block.data_mut().copy_from_slice(b"abcdefgh");
        block.set_range(0, 3);
        assert_eq!(block.filled(), b"abc");

        block.set_range(0, 100);
        assert_eq!(block.filled().len(), 8);
    }
}
