use std::convert::TryFrom;
use std::fmt::{Display, Formatter};

use anyhow::{bail, Context, Result};
use num::Integer;

use crate::ext2::{
    BlockCount, BlockGroupCount, BlockSize, InodeCount, SuperBlock, BYTES_PER_INODE, FIRST_EXISTING_INODE,
    FIRST_NON_RESERVED_INODE, GROUP_DESCRIPTOR_SIZE, INODE_SIZE,
};
use crate::util::FromU32;

pub const MIN_BLOCK_SIZE: BlockSize = 1024;
// keeps the per-group counts of the group descriptors within 16 bits
pub const MAX_BLOCK_SIZE: BlockSize = 4096;
/// superblock copy + block bitmap + inode bitmap
pub const FIXED_BLOCKS_PER_GROUP: BlockCount = 3;

/// The layout of a filesystem: how the device is split into block groups and how each full block group is split into
/// metadata and data. Immutable once constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: BlockSize,
    /// Only full groups are initialized and usable.
    pub full_group_count: BlockGroupCount,
    /// Includes a trailing short group if the device doesn't divide evenly.
    pub group_count: BlockGroupCount,
    pub blocks_per_group: BlockCount,
    pub last_group_block_count: BlockCount,
    pub gdt_block_count: BlockCount,
    pub inodes_per_group: InodeCount,
    pub inode_table_block_count: BlockCount,
    pub data_block_count: BlockCount,
}

impl Geometry {
    /// The largest group whose block bitmap fits into one block.
    pub fn max_blocks_per_group(block_size: BlockSize) -> BlockCount {
        8 * block_size
    }

    /// The largest group whose inode bitmap fits into one block.
    pub fn max_inodes_per_group(block_size: BlockSize) -> InodeCount {
        8 * block_size
    }

    /// Computes the geometry for a device of `device_size` bytes. Block sizes up to `MAX_BLOCK_SIZE` are accepted,
    /// but only `BLOCK_SIZE` matches the on-disk layout (`FIRST_DATA_BLOCK` = 1), so `SuperBlock::new` refuses any
    /// other size.
    /// PANICS: Panics if the computed regions of a group don't add up to `blocks_per_group`.
    pub fn calculate(device_size: u64, block_size: BlockSize) -> Result<Self> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || !block_size.is_power_of_two() {
            bail!(
                "Block size must be a power of two between {} and {}, got {}",
                MIN_BLOCK_SIZE,
                MAX_BLOCK_SIZE,
                block_size
            );
        }
        let total_blocks = BlockCount::try_from(device_size / u64::from(block_size))
            .context("Device too large, it would have more than 2^32 blocks")?;
        let max_blocks_per_group = Self::max_blocks_per_group(block_size);
        // block 0 is the boot block and belongs to no group
        let available_blocks = total_blocks.saturating_sub(1);

        let full_group_count = available_blocks / max_blocks_per_group;
        if full_group_count == 0 {
            bail!(
                "Device too small, at least {} bytes are required for one block group",
                u64::from(max_blocks_per_group + 1) * u64::from(block_size)
            );
        }
        let last_group_block_count = available_blocks - max_blocks_per_group * full_group_count;
        let group_count = full_group_count + if last_group_block_count > 0 { 1 } else { 0 };
        let blocks_per_group = max_blocks_per_group;

        let gdt_block_count = Self::gdt_block_count_for(full_group_count, block_size);
        let inodes_per_group = Self::inodes_per_group_for(blocks_per_group, gdt_block_count, block_size);
        let inode_table_block_count = Self::inode_table_block_count_for(inodes_per_group, block_size);
        let data_block_count = blocks_per_group
            .checked_sub(FIXED_BLOCKS_PER_GROUP + gdt_block_count + inode_table_block_count)
            .context("Too many block groups, the group metadata doesn't fit into a group")?;

        let inode_count = u64::from(inodes_per_group) * u64::from(full_group_count);
        if inode_count > u64::from(u32::MAX) {
            bail!("Too many inodes, at most 2^32 are allowed");
        }
        if inode_count < u64::from(FIRST_NON_RESERVED_INODE - FIRST_EXISTING_INODE) {
            bail!(
                "Too few inodes, at least {} required",
                FIRST_NON_RESERVED_INODE - FIRST_EXISTING_INODE
            );
        }

        let geometry = Self {
            block_size,
            full_group_count,
            group_count,
            blocks_per_group,
            last_group_block_count,
            gdt_block_count,
            inodes_per_group,
            inode_table_block_count,
            data_block_count,
        };
        geometry.assert_consistent();
        Ok(geometry)
    }

    /// Reconstructs the geometry of an existing filesystem. `sb` must have passed `SuperBlock::is_valid`.
    pub fn from_superblock(sb: &SuperBlock, device_block_count: BlockCount) -> Self {
        let block_size = sb.block_size();
        let blocks_per_group = sb.s_blocks_per_group;
        let inodes_per_group = sb.s_inodes_per_group;
        let full_group_count = sb.s_inodes_count / inodes_per_group;
        let gdt_block_count = Self::gdt_block_count_for(full_group_count, block_size);
        let inode_table_block_count = Self::inode_table_block_count_for(inodes_per_group, block_size);
        let data_block_count = blocks_per_group - FIXED_BLOCKS_PER_GROUP - gdt_block_count - inode_table_block_count;

        let available_blocks = device_block_count.saturating_sub(1);
        let last_group_block_count = available_blocks.saturating_sub(full_group_count * blocks_per_group);
        let group_count = full_group_count + if last_group_block_count > 0 { 1 } else { 0 };

        let geometry = Self {
            block_size,
            full_group_count,
            group_count,
            blocks_per_group,
            last_group_block_count,
            gdt_block_count,
            inodes_per_group,
            inode_table_block_count,
            data_block_count,
        };
        geometry.assert_consistent();
        geometry
    }

    pub(crate) fn gdt_block_count_for(full_group_count: BlockGroupCount, block_size: BlockSize) -> BlockCount {
        let gdt_size = u64::fromx(full_group_count) * GROUP_DESCRIPTOR_SIZE as u64;
        // at most 2^32 descriptors of 32 bytes in blocks of at least 1 KiB, so this fits
        Integer::div_ceil(&gdt_size, &u64::fromx(block_size)) as BlockCount
    }

    // Solves for the largest m with m * BYTES_PER_INODE + m * INODE_SIZE <= bytes left in the group once the fixed
    // blocks and the descriptor table are reserved.
    fn inodes_per_group_for(
        blocks_per_group: BlockCount,
        gdt_block_count: BlockCount,
        block_size: BlockSize,
    ) -> InodeCount {
        let remaining_blocks = blocks_per_group.saturating_sub(FIXED_BLOCKS_PER_GROUP + gdt_block_count);
        let remaining_bytes = u64::from(remaining_blocks) * u64::from(block_size);
        let inodes = remaining_bytes / (BYTES_PER_INODE + INODE_SIZE) as u64;
        let inodes = inodes.min(u64::from(Self::max_inodes_per_group(block_size)));
        InodeCount::try_from(inodes).expect("Capped at max_inodes_per_group, which fits into a u32")
    }

    pub(crate) fn inode_table_block_count_for(inodes_per_group: InodeCount, block_size: BlockSize) -> BlockCount {
        let inode_table_size = u64::from(inodes_per_group) * INODE_SIZE as u64;
        Integer::div_ceil(&inode_table_size, &u64::from(block_size)) as BlockCount
    }

    /// PANICS: Panics if the regions of a full group don't add up to `blocks_per_group`.
    pub fn assert_consistent(&self) {
        assert_eq!(
            FIXED_BLOCKS_PER_GROUP + self.gdt_block_count + self.inode_table_block_count + self.data_block_count,
            self.blocks_per_group,
            "Sum of the block group regions is not equal to blocks_per_group"
        );
        assert!(self.inodes_per_group <= Self::max_inodes_per_group(self.block_size));
        assert!(self.blocks_per_group <= Self::max_blocks_per_group(self.block_size));
    }

    pub fn inode_count(&self) -> InodeCount {
        self.inodes_per_group * self.full_group_count
    }

    /// Blocks covered by the full groups, including the boot block.
    pub fn block_count(&self) -> BlockCount {
        self.blocks_per_group * self.full_group_count + 1
    }

    pub fn inodes_per_block(&self) -> InodeCount {
        self.block_size / INODE_SIZE as InodeCount
    }
}

impl Display for Geometry {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        writeln!(f, "block size:          {}", self.block_size)?;
        writeln!(
            f,
            "block groups:        {} full, {} total ({} blocks unused at the end)",
            self.full_group_count, self.group_count, self.last_group_block_count
        )?;
        writeln!(f, "blocks per group:    {}", self.blocks_per_group)?;
        writeln!(f, "inodes per group:    {}", self.inodes_per_group)?;
        writeln!(f, "descriptor blocks:   {}", self.gdt_block_count)?;
        writeln!(f, "inode table blocks:  {}", self.inode_table_block_count)?;
        write!(f, "data blocks/group:   {}", self.data_block_count)
    }
}
