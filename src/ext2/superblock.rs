use std::convert::TryFrom;
use std::mem::size_of;

use anyhow::{bail, Result};
use static_assertions::const_assert_eq;
use uuid::Uuid;

use crate::ext2::geometry::FIXED_BLOCKS_PER_GROUP;
use crate::ext2::{
    BlockCount, BlockSize, Geometry, InodeCount, BLOCK_SIZE, FIRST_DATA_BLOCK, FIRST_NON_RESERVED_INODE, INODE_SIZE,
};
use crate::util::{exact_log2, Plain};

const_assert_eq!(size_of::<SuperBlock>(), 1024);

pub const SUPERBLOCK_MAGIC: u16 = 0xEF53;
const STATE_CLEANLY_UNMOUNTED: u16 = 1;
const ERRORS_CONTINUE: u16 = 1;
const CREATOR_OS_LINUX: u32 = 0;
/// Revision 1 is required for `s_first_ino`, `s_inode_size` and the feature flags to be honoured
const DYNAMIC_REVISION: u32 = 1;
const FEATURE_INCOMPAT_FILETYPE: u32 = 0x2; // directory entries record the file type
const BLOCK_SIZE_MIN_LOG2: u32 = 10;
pub const VOLUME_NAME_LEN: usize = 16;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SuperBlock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    /// 1 for 1 KiB blocks, the index of the block holding the primary superblock
    pub s_first_data_block: u32,
    /// block size = 1024 << s_log_block_size
    pub s_log_block_size: u32,
    pub s_log_frag_size: u32,
    pub s_blocks_per_group: u32,
    pub s_frags_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; VOLUME_NAME_LEN],
    pub s_last_mounted: [u8; 64],
    pub s_algorithm_usage_bitmap: u32,
    pub s_prealloc_blocks: u8,
    pub s_prealloc_dir_blocks: u8,
    pub s_padding1: u16,
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: u32,
    pub s_journal_dev: u32,
    pub s_last_orphan: u32,
    pub s_hash_seed: [u32; 4],
    pub s_def_hash_version: u8,
    pub s_reserved_char_pad: u8,
    pub s_reserved_word_pad: u16,
    pub s_default_mount_opts: u32,
    pub s_first_meta_bg: u32,
    pub s_reserved: [u32; 190],
}

// SAFETY: only integers and integer arrays, no padding (checked by the size assertion above)
unsafe impl Plain for SuperBlock {}

impl SuperBlock {
    /// Builds the superblock for a freshly formatted filesystem with the counters of an empty filesystem.
    pub fn new(geometry: &Geometry, volume_name: &[u8], now: u32) -> Result<Self> {
        if volume_name.len() > VOLUME_NAME_LEN {
            bail!("Volume name must be at most {} bytes long", VOLUME_NAME_LEN);
        }
        // the primary superblock sits in block `FIRST_DATA_BLOCK` only with 1 KiB blocks
        if geometry.block_size as usize != BLOCK_SIZE {
            bail!("Only {} byte blocks can be formatted, got {}", BLOCK_SIZE, geometry.block_size);
        }

        // SAFETY: `SuperBlock` is `Plain`, so all zeroes is a valid value. This allows us to skip initializing a ton
        // of fields to zero.
        let mut sb: Self = unsafe { std::mem::zeroed() };
        sb.init_constants();

        let log_block_size = exact_log2(geometry.block_size).map(u32::from);
        sb.s_log_block_size = match log_block_size {
            Some(log) if log >= BLOCK_SIZE_MIN_LOG2 => log - BLOCK_SIZE_MIN_LOG2,
            _ => bail!("Invalid block size {}", geometry.block_size),
        };
        sb.s_log_frag_size = sb.s_log_block_size;
        sb.s_first_data_block = FIRST_DATA_BLOCK;
        sb.s_blocks_per_group = geometry.blocks_per_group;
        sb.s_frags_per_group = geometry.blocks_per_group;
        sb.s_inodes_per_group = geometry.inodes_per_group;

        sb.s_inodes_count = geometry.inode_count();
        sb.s_blocks_count = geometry.block_count();
        sb.s_free_blocks_count = geometry.data_block_count * geometry.full_group_count;
        sb.s_free_inodes_count = geometry.inode_count();

        sb.s_mtime = now;
        sb.s_wtime = now;
        sb.s_lastcheck = now;
        sb.s_uuid = *Uuid::new_v4().as_bytes();
        sb.s_volume_name[..volume_name.len()].copy_from_slice(volume_name);
        Ok(sb)
    }

    fn init_constants(&mut self) {
        self.s_magic = SUPERBLOCK_MAGIC;
        self.s_state = STATE_CLEANLY_UNMOUNTED;
        self.s_errors = ERRORS_CONTINUE;
        self.s_creator_os = CREATOR_OS_LINUX;
        self.s_rev_level = DYNAMIC_REVISION;
        self.s_feature_incompat = FEATURE_INCOMPAT_FILETYPE;
        self.s_first_ino = FIRST_NON_RESERVED_INODE;
        self.s_inode_size = INODE_SIZE as u16;
        self.s_max_mnt_count = u16::MAX;
    }

    /// Returns whether `self` describes a filesystem this crate can work with on a device of `device_block_count`
    /// blocks. Anything else is treated as foreign.
    pub fn is_valid(&self, device_block_count: BlockCount) -> bool {
        let max_per_group = Geometry::max_inodes_per_group(BLOCK_SIZE as BlockSize);
        let recognized = self.s_magic == SUPERBLOCK_MAGIC
            && self.s_log_block_size < 22
            && self.block_size() as usize == BLOCK_SIZE
            && self.s_first_data_block == FIRST_DATA_BLOCK
            && self.s_inodes_per_group <= max_per_group
            && self.s_first_ino == FIRST_NON_RESERVED_INODE
            && usize::from(self.s_inode_size) == INODE_SIZE;
        // guard the arithmetic of `Geometry::from_superblock` against nonsensical values
        recognized
            && self.s_inodes_per_group > 0
            && self.s_blocks_per_group > 0
            && self.s_blocks_per_group <= Geometry::max_blocks_per_group(BLOCK_SIZE as BlockSize)
            && self.fits_on_device(device_block_count)
    }

    fn fits_on_device(&self, device_block_count: BlockCount) -> bool {
        let full_group_count = self.s_inodes_count / self.s_inodes_per_group;
        let block_size = self.block_size();
        let metadata_blocks = FIXED_BLOCKS_PER_GROUP
            + Geometry::gdt_block_count_for(full_group_count, block_size)
            + Geometry::inode_table_block_count_for(self.s_inodes_per_group, block_size);
        let used_blocks = u64::from(full_group_count) * u64::from(self.s_blocks_per_group) + 1;
        full_group_count > 0
            && metadata_blocks <= self.s_blocks_per_group
            && used_blocks <= u64::from(device_block_count)
    }

    pub fn block_size(&self) -> BlockSize {
        1 << (self.s_log_block_size + BLOCK_SIZE_MIN_LOG2)
    }

    pub fn set_free_counts(&mut self, free_blocks: u64, free_inodes: u64) {
        self.s_free_blocks_count = u32::try_from(free_blocks).expect("Free blocks never exceed the block count");
        self.s_free_inodes_count = InodeCount::try_from(free_inodes).expect("Free inodes never exceed the inode count");
    }

    pub fn volume_name(&self) -> &[u8] {
        let len = self.s_volume_name.iter().position(|&byte| byte == 0).unwrap_or(VOLUME_NAME_LEN);
        &self.s_volume_name[..len]
    }
}
