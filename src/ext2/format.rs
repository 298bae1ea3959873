use std::convert::TryFrom;

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use log::{debug, info};

use crate::block_device::{Block, BlockDevice};
use crate::ext2::{
    BlockGroupIdx, BlockIdx, BlockSize, Ext2Dentry, Ext2Fs, Ext2GroupDescriptor, FormatOptions, Geometry, Inode,
    InodeCount, SuperBlock, BLOCK_SIZE, FILE_TYPE_DIRECTORY, FIRST_EXISTING_INODE, FIRST_NON_RESERVED_INODE,
    ROOT_INODE_NO,
};
use crate::util::FromU32;

const BOOT_BLOCK_BANNER: &[u8] = b"ext2m-rs: block 0 is reserved, the ext2 superblock starts at byte 1024\n";
const ROOT_PERMISSIONS: u16 = 0o755;
/// Inodes 1 to 10, including the root directory
const RESERVED_INODE_COUNT: InodeCount = FIRST_NON_RESERVED_INODE - FIRST_EXISTING_INODE;

fn timestamp_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).expect("Timestamp after year 2106 does not fit into 32 bits")
}

impl<D: BlockDevice> Ext2Fs<D> {
    /// Creates an empty filesystem spanning every full block group of `device`, containing only the root directory.
    /// Whatever was on the device before is lost.
    pub(super) fn format(mut device: D, options: &FormatOptions) -> Result<Self> {
        let mut boot_block: Block = [0; BLOCK_SIZE];
        boot_block[..BOOT_BLOCK_BANNER.len()].copy_from_slice(BOOT_BLOCK_BANNER);
        device.write_block(0, &boot_block).context("Failed to write the boot block")?;

        let geometry = Geometry::calculate(device.size(), BLOCK_SIZE as BlockSize)?;
        info!(
            "Formatting {} block groups with {} inodes each",
            geometry.full_group_count, geometry.inodes_per_group
        );
        if geometry.last_group_block_count > 0 {
            info!("Leaving {} blocks at the end of the device unused", geometry.last_group_block_count);
        }

        let now = timestamp_now();
        let superblock = SuperBlock::new(&geometry, &options.volume_name, now)?;
        let group_descriptors = (0..geometry.full_group_count)
            .map(|group| Ext2GroupDescriptor::new(&geometry, group))
            .collect_vec();
        let mut fs = Self { device, geometry, superblock, group_descriptors, dirty: false };
        fs.write_metadata()?;

        for group in 0..fs.geometry.full_group_count {
            fs.init_block_group(group)?;
        }
        fs.device.flush_all().context("Failed to flush the device")?;

        fs.create_root_directory(now)?;
        fs.update_superblock();
        fs.write_metadata()?;
        fs.dirty = false;
        fs.device.flush_all().context("Failed to flush the device")?;
        Ok(fs)
    }

    /// Zeroes the inode bitmap, the inode table and the data blocks of `group` and marks its metadata blocks as used.
    fn init_block_group(&mut self, group: BlockGroupIdx) -> Result<()> {
        let zero_block: Block = [0; BLOCK_SIZE];
        let start = self.geometry.inode_bitmap_block(group);
        let end = self.geometry.group_end_block(group);
        for idx in start..end {
            self.device
                .write_block(idx, &zero_block)
                .with_context(|| format!("Failed to zero block {} of group {}", idx, group))?;
        }

        // the block bitmap is not covered by the zeroing above
        let mut bitmap = self.load_block_bitmap(group)?;
        bitmap.clear_all();
        for bit in 0..usize::fromx(self.geometry.metadata_block_count()) {
            bitmap.set(bit);
        }
        self.store_block_bitmap(group, &bitmap)?;
        debug!("Initialized block group {} ({}..{})", group, self.geometry.group_start_block(group), end);
        Ok(())
    }

    fn create_root_directory(&mut self, now: u32) -> Result<()> {
        let block: BlockIdx = match self.allocate(0, 1)?[..] {
            [block] => block,
            _ => bail!("No free block left for the root directory"),
        };

        assert!(self.geometry.inodes_per_group >= RESERVED_INODE_COUNT);
        let mut inode_bitmap = self.load_inode_bitmap(0)?;
        for bit in 0..usize::fromx(RESERVED_INODE_COUNT) {
            inode_bitmap.set(bit);
        }
        self.store_inode_bitmap(0, &inode_bitmap)?;

        let mut inode = Inode::new_directory(ROOT_PERMISSIONS, now);
        // "." and the parent's entry, the root is its own parent
        inode.increment_link_count();
        inode.increment_link_count();
        inode.i_size = BLOCK_SIZE as u32;
        inode.push_direct_block(block, BLOCK_SIZE);
        self.put_inode(ROOT_INODE_NO, &inode)?;

        let dot = Ext2Dentry::new(ROOT_INODE_NO, b".", FILE_TYPE_DIRECTORY)?;
        let mut dot_dot = Ext2Dentry::new(ROOT_INODE_NO, b"..", FILE_TYPE_DIRECTORY)?;
        // the last entry spans the rest of the block
        let remaining = BLOCK_SIZE as u16 - dot.dentry_len() - dot_dot.dentry_len();
        dot_dot.increment_dentry_len(remaining);
        let mut dir_block: Block = [0; BLOCK_SIZE];
        dot.write_to(&mut dir_block, 0);
        dot_dot.write_to(&mut dir_block, usize::from(dot.dentry_len()));
        self.device
            .write_block(block, &dir_block)
            .context("Failed to write the root directory")?;

        let descriptor = &mut self.group_descriptors[0];
        descriptor.decrement_free_inodes_count(RESERVED_INODE_COUNT);
        descriptor.increment_used_directory_count();
        self.dirty = true;
        info!("Created root directory in block {}", block);
        Ok(())
    }
}
