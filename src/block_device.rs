use anyhow::Result;

use crate::ext2::{BlockCount, BlockIdx, BLOCK_SIZE};

pub type Block = [u8; BLOCK_SIZE];

/// A device that is read and written in whole blocks of `BLOCK_SIZE` bytes. Writes may be buffered until
/// `flush_all` is called.
pub trait BlockDevice {
    fn block_count(&self) -> BlockCount;

    fn read_block(&self, idx: BlockIdx, buf: &mut Block) -> Result<()>;

    fn write_block(&mut self, idx: BlockIdx, buf: &Block) -> Result<()>;

    fn flush_all(&mut self) -> Result<()>;

    /// in bytes
    fn size(&self) -> u64 {
        u64::from(self.block_count()) * BLOCK_SIZE as u64
    }
}

/// A `Vec`-backed device that counts flushes.
#[cfg(test)]
pub struct MemoryDevice {
    data: Vec<u8>,
    pub flush_count: usize,
}

#[cfg(test)]
impl MemoryDevice {
    /// The device is truncated to a whole number of blocks.
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size - size % BLOCK_SIZE], flush_count: 0 }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut instance = Self { data, flush_count: 0 };
        instance.data.truncate(instance.data.len() - instance.data.len() % BLOCK_SIZE);
        instance
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn block_range(&self, idx: BlockIdx) -> Result<std::ops::Range<usize>> {
        use crate::util::FromU32;

        let start = usize::fromx(idx) * BLOCK_SIZE;
        if start + BLOCK_SIZE > self.data.len() {
            anyhow::bail!("Block {} is beyond the end of the device", idx);
        }
        Ok(start..start + BLOCK_SIZE)
    }
}

#[cfg(test)]
impl BlockDevice for MemoryDevice {
    fn block_count(&self) -> BlockCount {
        BlockCount::try_from(self.data.len() / BLOCK_SIZE).expect("Test devices are small")
    }

    fn read_block(&self, idx: BlockIdx, buf: &mut Block) -> Result<()> {
        let range = self.block_range(idx)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, idx: BlockIdx, buf: &Block) -> Result<()> {
        let range = self.block_range(idx)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        self.flush_count += 1;
        Ok(())
    }
}
