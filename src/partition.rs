use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use log::debug;
use memmap::{MmapMut, MmapOptions};
use nix::ioctl_read;

use crate::block_device::{Block, BlockDevice};
use crate::ext2::{BlockCount, BlockIdx, BLOCK_SIZE};
use crate::util::FromU32;

/// An image file or block device, memory-mapped and exclusively locked for as long as the `Partition` lives.
/// Trailing bytes that don't fill a whole block are not accessible.
pub struct Partition {
    mmap: MmapMut,
    block_count: BlockCount,
}

impl Partition {
    pub fn open<P: AsRef<Path>>(partition_path: P) -> Result<Self> {
        let partition_path = partition_path.as_ref().canonicalize()?;
        if Self::is_mounted(partition_path.as_path())? {
            bail!("Partition is already mounted");
        }
        let file = OpenOptions::new().read(true).write(true).create(false).open(&partition_path)?;
        // the lock is only advisory, other processes may still access the file
        // the lock is automatically released after both file and mmap are dropped
        file.try_lock_exclusive()?;

        let size = Self::get_file_size(&file)?;
        let block_count = BlockCount::try_from(size / BLOCK_SIZE)
            .context("Partition too large, it would have more than 2^32 blocks")?;
        // SAFETY: We assume that no other process is modifying the partition
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        debug!(
            "Opened {} ({} bytes, {} blocks)",
            partition_path.display(),
            size,
            block_count
        );
        Ok(Self { mmap, block_count })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    fn block_range(&self, idx: BlockIdx) -> Result<Range<usize>> {
        if idx >= self.block_count {
            bail!("Block {} is beyond the end of the partition ({} blocks)", idx, self.block_count);
        }
        let start = usize::fromx(idx) * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }

    fn get_file_size(file: &File) -> Result<usize> {
        let metadata = file.metadata()?;
        let filetype = metadata.file_type();
        let len = if filetype.is_file() {
            metadata.len()
        } else if filetype.is_block_device() {
            Self::get_block_device_size(file)?
        } else {
            bail!("Expected path to a file or a block device")
        };

        len.try_into()
            .with_context(|| format!("File size {} does not fit into a usize", len))
    }

    fn is_mounted(partition_path: &Path) -> Result<bool> {
        let absolute_path = partition_path.canonicalize()?;
        let path_str = absolute_path.to_str().context("Partition path is not valid UTF-8")?;
        let output_bytes = Command::new("mount").output()?.stdout;
        let output = String::from_utf8(output_bytes).context("mount output is not valid UTF-8")?;
        Ok(output.lines().any(|line| line.starts_with(path_str)))
    }

    // declared in linux/fs.h
    // The type is declared as size_t due to a bug that cannot be fixed due to backwards compatibility. If I understand
    // correctly, passing u64 instead of usize should work even on 32bit systems, I haven't had a chance to test it
    // though. cfr. https://lists.debian.org/debian-glibc/2005/12/msg00069.html
    #[cfg(target_os = "linux")]
    ioctl_read!(block_device_size, 0x12, 114, u64);

    /// PANICS: Panics if `file` is not a block device.
    #[cfg(target_os = "linux")]
    fn get_block_device_size(file: &File) -> Result<u64> {
        assert!(file.metadata()?.file_type().is_block_device());
        let mut size = 0;
        // SAFETY: the nix crate provides no safety documentation, so we must just assume that this is safe.
        unsafe {
            Self::block_device_size(file.as_raw_fd(), &mut size)?;
        }
        Ok(size)
    }
}

impl BlockDevice for Partition {
    fn block_count(&self) -> BlockCount {
        self.block_count
    }

    fn read_block(&self, idx: BlockIdx, buf: &mut Block) -> Result<()> {
        let range = self.block_range(idx)?;
        buf.copy_from_slice(&self.mmap[range]);
        Ok(())
    }

    fn write_block(&mut self, idx: BlockIdx, buf: &Block) -> Result<()> {
        let range = self.block_range(idx)?;
        self.mmap[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        self.mmap.flush().context("Failed to flush the partition")
    }
}
