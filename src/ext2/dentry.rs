use std::mem::size_of;

use anyhow::{bail, Result};

use crate::ext2::InodeNo;
use crate::util::{aligned_length, read_plain, write_plain, Plain};

const EXT2_NAME_MAX_LEN: usize = 255;
const ALIGNMENT: usize = 4;

pub const FILE_TYPE_DIRECTORY: u8 = 2;

/// A directory entry as stored in a directory's data block: the fixed-size header followed by the name.
#[derive(Clone, Debug, PartialEq)]
pub struct Ext2Dentry {
    pub inner: Ext2DentrySized,
    pub name: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct Ext2DentrySized {
    pub inode_no: InodeNo,
    /// Always a multiple of 4 to ensure alignment. Might be longer than needed for the name, in which case the
    /// remainder is free space.
    pub dentry_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

// SAFETY: only integers, no padding
unsafe impl Plain for Ext2DentrySized {}

impl Ext2Dentry {
    pub fn new(inode_no: InodeNo, name: &[u8], file_type: u8) -> Result<Self> {
        if name.is_empty() || name.len() > EXT2_NAME_MAX_LEN {
            bail!("Length of file name {:?} must be between 1 and {} bytes", name, EXT2_NAME_MAX_LEN);
        }
        let inner = Ext2DentrySized {
            inode_no,
            dentry_len: Self::natural_len(name.len()),
            // checked above
            name_len: name.len() as u8,
            file_type,
        };
        Ok(Self { inner, name: name.to_vec() })
    }

    /// The smallest aligned length of an entry with a name of `name_len` bytes.
    fn natural_len(name_len: usize) -> u16 {
        // at most 8 + 255 rounded up, so this fits
        aligned_length(size_of::<Ext2DentrySized>() + name_len, ALIGNMENT) as u16
    }

    pub fn dentry_len(&self) -> u16 {
        self.inner.dentry_len
    }

    /// Grows the entry so that it also covers the next `num` bytes of free space.
    /// PANICS: Panics if `num` is not a multiple of 4
    pub fn increment_dentry_len(&mut self, num: u16) {
        assert!(usize::from(num) % ALIGNMENT == 0);
        self.inner.dentry_len += num;
    }

    /// Writes `self` to `block` at `offset`.
    /// PANICS: Panics if the entry doesn't fit into `block` or `offset` is misaligned.
    pub fn write_to(&self, block: &mut [u8], offset: usize) {
        assert_eq!(offset % ALIGNMENT, 0, "Misaligned directory entry offset {}", offset);
        let end = offset + usize::from(self.dentry_len());
        assert!(end <= block.len(), "Directory entry exceeds the block");

        let entry = &mut block[offset..end];
        entry.fill(0);
        write_plain(entry, &self.inner);
        entry[size_of::<Ext2DentrySized>()..][..self.name.len()].copy_from_slice(&self.name);
    }

    /// Reads the entry at `offset` in `block`.
    pub fn read_from(block: &[u8], offset: usize) -> Result<Self> {
        if offset + size_of::<Ext2DentrySized>() > block.len() {
            bail!("Directory entry at offset {} exceeds the block", offset);
        }
        let inner: Ext2DentrySized = read_plain(&block[offset..]);
        let dentry_len = usize::from(inner.dentry_len);
        let name_len = usize::from(inner.name_len);
        if dentry_len % ALIGNMENT != 0
            || dentry_len < size_of::<Ext2DentrySized>() + name_len
            || offset + dentry_len > block.len()
        {
            bail!("Corrupted directory entry at offset {} (length {})", offset, dentry_len);
        }
        let name_start = offset + size_of::<Ext2DentrySized>();
        let name = block[name_start..name_start + name_len].to_vec();
        Ok(Self { inner, name })
    }
}

/// Iterates over the entries of one directory block, following the record lengths.
pub struct DentryIter<'a> {
    block: &'a [u8],
    offset: usize,
}

impl<'a> DentryIter<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self { block, offset: 0 }
    }
}

impl Iterator for DentryIter<'_> {
    type Item = Result<Ext2Dentry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.len() {
            return None;
        }
        let result = Ext2Dentry::read_from(self.block, self.offset);
        match &result {
            Ok(dentry) => self.offset += usize::from(dentry.dentry_len()),
            // don't loop on a corrupted entry
            Err(_) => self.offset = self.block.len(),
        }
        Some(result)
    }
}
