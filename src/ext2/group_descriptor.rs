use std::mem::size_of;

use static_assertions::const_assert_eq;

use crate::ext2::{BlockCount, BlockGroupIdx, Geometry, InodeCount, GROUP_DESCRIPTOR_SIZE};
use crate::util::Plain;

const_assert_eq!(size_of::<Ext2GroupDescriptor>(), GROUP_DESCRIPTOR_SIZE);

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Ext2GroupDescriptor {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
    pub bg_pad: u16,
    pub bg_reserved: [u32; 3],
}

// SAFETY: only integers and integer arrays, no padding (checked by the size assertion above)
unsafe impl Plain for Ext2GroupDescriptor {}

impl Ext2GroupDescriptor {
    /// The descriptor of an empty, freshly formatted block group.
    pub fn new(geometry: &Geometry, group: BlockGroupIdx) -> Self {
        Self {
            bg_block_bitmap: geometry.block_bitmap_block(group),
            bg_inode_bitmap: geometry.inode_bitmap_block(group),
            bg_inode_table: geometry.inode_table_start_block(group),
            bg_free_blocks_count: Self::narrow(geometry.data_block_count),
            bg_free_inodes_count: Self::narrow(geometry.inodes_per_group),
            ..Self::default() // zero every other field
        }
    }

    // A group has at most 8 * MAX_BLOCK_SIZE blocks and inodes.
    fn narrow(count: u32) -> u16 {
        u16::try_from(count).expect("Per-group counts fit into 16 bits")
    }

    pub fn free_blocks_count(&self) -> BlockCount {
        BlockCount::from(self.bg_free_blocks_count)
    }

    pub fn free_inodes_count(&self) -> InodeCount {
        InodeCount::from(self.bg_free_inodes_count)
    }

    pub fn used_dirs_count(&self) -> u32 {
        u32::from(self.bg_used_dirs_count)
    }

    /// PANICS: Panics on underflow
    pub fn decrement_free_blocks_count(&mut self, count: BlockCount) {
        self.bg_free_blocks_count = Self::narrow(self.free_blocks_count() - count);
    }

    /// PANICS: Panics on overflow
    pub fn increment_free_blocks_count(&mut self, count: BlockCount) {
        self.bg_free_blocks_count = Self::narrow(self.free_blocks_count() + count);
    }

    /// PANICS: Panics on underflow
    pub fn decrement_free_inodes_count(&mut self, count: InodeCount) {
        self.bg_free_inodes_count = Self::narrow(self.free_inodes_count() - count);
    }

    pub fn increment_used_directory_count(&mut self) {
        self.bg_used_dirs_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext2::BLOCK_SIZE;

    #[test]
    fn points_at_group_regions() {
        let geometry = Geometry::calculate((2 * 8192 + 1) * BLOCK_SIZE as u64, BLOCK_SIZE as u32).unwrap();
        let descriptor = Ext2GroupDescriptor::new(&geometry, 1);
        assert_eq!(descriptor.bg_block_bitmap, geometry.block_bitmap_block(1));
        assert_eq!(descriptor.bg_inode_bitmap, geometry.block_bitmap_block(1) + 1);
        assert_eq!(descriptor.bg_inode_table, geometry.block_bitmap_block(1) + 2);
        assert_eq!(descriptor.free_blocks_count(), geometry.data_block_count);
        assert_eq!(descriptor.free_inodes_count(), geometry.inodes_per_group);
        assert_eq!(descriptor.used_dirs_count(), 0);
    }

    #[test]
    fn adjusts_counters() {
        let geometry = Geometry::calculate((8192 + 1) * BLOCK_SIZE as u64, BLOCK_SIZE as u32).unwrap();
        let mut descriptor = Ext2GroupDescriptor::new(&geometry, 0);
        descriptor.decrement_free_blocks_count(5);
        descriptor.increment_free_blocks_count(2);
        descriptor.decrement_free_inodes_count(10);
        descriptor.increment_used_directory_count();
        assert_eq!(descriptor.free_blocks_count(), geometry.data_block_count - 3);
        assert_eq!(descriptor.free_inodes_count(), geometry.inodes_per_group - 10);
        assert_eq!(descriptor.used_dirs_count(), 1);
    }
}
