//! Absolute block addresses of the regions of each block group. Every group is laid out as
//! superblock copy | descriptor table copy | block bitmap | inode bitmap | inode table | data blocks
//! without gaps. No other code computes block addresses by hand.

use std::ops::Range;

use crate::ext2::geometry::FIXED_BLOCKS_PER_GROUP;
use crate::ext2::{BlockCount, BlockGroupIdx, BlockIdx, Geometry, FIRST_DATA_BLOCK};

impl Geometry {
    /// PANICS: Panics if `group` is not a full group.
    pub fn group_start_block(&self, group: BlockGroupIdx) -> BlockIdx {
        assert!(
            group < self.full_group_count,
            "Block group {} out of range, there are {} full groups",
            group,
            self.full_group_count
        );
        group * self.blocks_per_group + FIRST_DATA_BLOCK
    }

    pub fn superblock_block(&self, group: BlockGroupIdx) -> BlockIdx {
        self.group_start_block(group)
    }

    pub fn gdt_start_block(&self, group: BlockGroupIdx) -> BlockIdx {
        self.superblock_block(group) + 1
    }

    pub fn block_bitmap_block(&self, group: BlockGroupIdx) -> BlockIdx {
        self.gdt_start_block(group) + self.gdt_block_count
    }

    pub fn inode_bitmap_block(&self, group: BlockGroupIdx) -> BlockIdx {
        self.block_bitmap_block(group) + 1
    }

    pub fn inode_table_start_block(&self, group: BlockGroupIdx) -> BlockIdx {
        self.inode_bitmap_block(group) + 1
    }

    pub fn data_start_block(&self, group: BlockGroupIdx) -> BlockIdx {
        self.inode_table_start_block(group) + self.inode_table_block_count
    }

    pub fn group_end_block(&self, group: BlockGroupIdx) -> BlockIdx {
        self.group_start_block(group) + self.blocks_per_group
    }

    /// Blocks at the start of every group that hold metadata rather than file data.
    pub fn metadata_block_count(&self) -> BlockCount {
        FIXED_BLOCKS_PER_GROUP + self.gdt_block_count + self.inode_table_block_count
    }

    pub fn metadata_blocks(&self, group: BlockGroupIdx) -> Range<BlockIdx> {
        self.group_start_block(group)..self.data_start_block(group)
    }

    /// Returns the group containing `block` and the block's index relative to the group start, or None if the block
    /// belongs to no full group (the boot block and the trailing short group).
    pub fn locate_block(&self, block: BlockIdx) -> Option<(BlockGroupIdx, BlockCount)> {
        let relative_block = block.checked_sub(FIRST_DATA_BLOCK)?;
        let group = relative_block / self.blocks_per_group;
        if group < self.full_group_count {
            Some((group, relative_block % self.blocks_per_group))
        } else {
            None
        }
    }
}
