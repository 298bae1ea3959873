use std::mem::size_of;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, error, info, warn};
use num::Integer;

use crate::bitmap::Bitmap;
use crate::block_device::{Block, BlockDevice};
use crate::ext2::{
    BlockGroupIdx, BlockIdx, Ext2GroupDescriptor, Geometry, Inode, InodeNo, SuperBlock, BLOCK_SIZE,
    FIRST_DATA_BLOCK, FIRST_EXISTING_INODE, GROUP_DESCRIPTOR_SIZE, INODE_SIZE,
};
use crate::util::{read_plain, write_plain, FromU32};

/// Runtime options for opening (and possibly formatting) a device.
#[derive(Clone, Debug, Default)]
pub struct FormatOptions {
    /// At most 16 bytes, stored in the superblock.
    pub volume_name: Vec<u8>,
    /// Format even if the device already holds a valid filesystem.
    pub force: bool,
}

/// An ext2 filesystem on a block device. The superblock and descriptor table are kept in memory and written back to
/// every full block group on `sync`; bitmaps and inodes are read and written on every access.
pub struct Ext2Fs<D: BlockDevice> {
    pub(super) device: D,
    pub(super) geometry: Geometry,
    pub(super) superblock: SuperBlock,
    pub(super) group_descriptors: Vec<Ext2GroupDescriptor>,
    /// The in-memory counters differ from the ones on the device.
    pub(super) dirty: bool,
}

impl<D: BlockDevice> Ext2Fs<D> {
    /// Loads the filesystem on `device`, or formats it if it holds no valid filesystem or `options.force` is set.
    pub fn open(device: D, options: &FormatOptions) -> Result<Self> {
        if options.force {
            info!("Formatting device as requested");
            Self::format(device, options)
        } else if Self::probe(&device)? {
            Self::load(device)
        } else {
            info!("No valid filesystem found, formatting device");
            Self::format(device, options)
        }
    }

    /// Returns whether `device` holds a filesystem that can be loaded.
    pub fn probe(device: &D) -> Result<bool> {
        if device.block_count() <= FIRST_DATA_BLOCK {
            return Ok(false);
        }
        let superblock = Self::read_superblock(device)?;
        let valid = superblock.is_valid(device.block_count());
        debug!("Superblock with magic {:#x} is valid: {}", superblock.s_magic, valid);
        Ok(valid)
    }

    fn read_superblock(device: &D) -> Result<SuperBlock> {
        let mut block = [0; BLOCK_SIZE];
        device
            .read_block(FIRST_DATA_BLOCK, &mut block)
            .context("Failed to read the superblock")?;
        Ok(read_plain(&block))
    }

    /// Reconstructs the geometry from the primary superblock and reads the descriptor table of group 0.
    /// PANICS: Panics if `device` doesn't pass `probe`.
    pub fn load(device: D) -> Result<Self> {
        let superblock = Self::read_superblock(&device)?;
        assert!(superblock.is_valid(device.block_count()), "Attempted to load an invalid filesystem");
        let geometry = Geometry::from_superblock(&superblock, device.block_count());
        info!("Loading filesystem with {} block groups", geometry.full_group_count);

        let gdt_bytes = Self::read_blocks(&device, geometry.gdt_start_block(0), geometry.gdt_block_count)
            .context("Failed to read the group descriptor table")?;
        let group_descriptors = gdt_bytes
            .chunks_exact(GROUP_DESCRIPTOR_SIZE)
            .take(usize::fromx(geometry.full_group_count))
            .map(read_plain::<Ext2GroupDescriptor>)
            .collect_vec();

        Ok(Self { device, geometry, superblock, group_descriptors, dirty: false })
    }

    fn read_blocks(device: &D, start: BlockIdx, count: u32) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(usize::fromx(count) * BLOCK_SIZE);
        let mut block = [0; BLOCK_SIZE];
        for idx in start..start + count {
            device.read_block(idx, &mut block)?;
            bytes.extend_from_slice(&block);
        }
        Ok(bytes)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn group_descriptors(&self) -> &[Ext2GroupDescriptor] {
        &self.group_descriptors
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn load_block_bitmap(&self, group: BlockGroupIdx) -> Result<Bitmap> {
        let len = usize::fromx(self.geometry.blocks_per_group);
        self.load_bitmap(self.geometry.block_bitmap_block(group), len)
            .with_context(|| format!("Failed to load the block bitmap of group {}", group))
    }

    pub fn load_inode_bitmap(&self, group: BlockGroupIdx) -> Result<Bitmap> {
        let len = usize::fromx(self.geometry.inodes_per_group);
        self.load_bitmap(self.geometry.inode_bitmap_block(group), len)
            .with_context(|| format!("Failed to load the inode bitmap of group {}", group))
    }

    /// PANICS: Panics if `bitmap` doesn't have one bit per block of a group.
    pub fn store_block_bitmap(&mut self, group: BlockGroupIdx, bitmap: &Bitmap) -> Result<()> {
        assert_eq!(bitmap.len(), usize::fromx(self.geometry.blocks_per_group));
        let idx = self.geometry.block_bitmap_block(group);
        self.store_bitmap(idx, bitmap)
            .with_context(|| format!("Failed to store the block bitmap of group {}", group))
    }

    /// PANICS: Panics if `bitmap` doesn't have one bit per inode of a group.
    pub fn store_inode_bitmap(&mut self, group: BlockGroupIdx, bitmap: &Bitmap) -> Result<()> {
        assert_eq!(bitmap.len(), usize::fromx(self.geometry.inodes_per_group));
        let idx = self.geometry.inode_bitmap_block(group);
        self.store_bitmap(idx, bitmap)
            .with_context(|| format!("Failed to store the inode bitmap of group {}", group))
    }

    fn load_bitmap(&self, idx: BlockIdx, len: usize) -> Result<Bitmap> {
        let mut block = [0; BLOCK_SIZE];
        self.device.read_block(idx, &mut block)?;
        Ok(Bitmap::from_bytes(&block, len))
    }

    // the bytes past the end of the bitmap are zeroed
    fn store_bitmap(&mut self, idx: BlockIdx, bitmap: &Bitmap) -> Result<()> {
        let mut block = [0; BLOCK_SIZE];
        let bytes = bitmap.as_bytes();
        block[..bytes.len()].copy_from_slice(bytes);
        self.device.write_block(idx, &block)
    }

    /// Returns the inode table block holding inode `inode_no` and the inode's byte offset within it.
    /// PANICS: Panics if `inode_no` doesn't belong to a full block group.
    fn inode_location(&self, inode_no: InodeNo) -> (BlockIdx, usize) {
        assert!(inode_no >= FIRST_EXISTING_INODE, "Inode {} does not exist", inode_no);
        let (group, index) = (inode_no - FIRST_EXISTING_INODE).div_rem(&self.geometry.inodes_per_group);
        assert!(
            group < self.geometry.full_group_count,
            "Inode {} out of range, there are {} inodes",
            inode_no,
            self.geometry.inode_count()
        );
        let (table_block, slot) = index.div_rem(&self.geometry.inodes_per_block());
        let block = self.geometry.inode_table_start_block(group) + table_block;
        (block, usize::fromx(slot) * INODE_SIZE)
    }

    /// PANICS: Panics if `inode_no` is 0 or beyond the last inode.
    pub fn get_inode(&self, inode_no: InodeNo) -> Result<Inode> {
        let (idx, offset) = self.inode_location(inode_no);
        let mut block = [0; BLOCK_SIZE];
        self.device
            .read_block(idx, &mut block)
            .with_context(|| format!("Failed to read inode {}", inode_no))?;
        Ok(read_plain(&block[offset..offset + INODE_SIZE]))
    }

    /// Overwrites inode `inode_no` in the inode table. The inode bitmap and the free inode counters are left alone.
    /// PANICS: Panics if `inode_no` is 0 or beyond the last inode.
    pub fn put_inode(&mut self, inode_no: InodeNo, inode: &Inode) -> Result<()> {
        let (idx, offset) = self.inode_location(inode_no);
        let mut block = [0; BLOCK_SIZE];
        self.device
            .read_block(idx, &mut block)
            .with_context(|| format!("Failed to read inode {}", inode_no))?;
        write_plain(&mut block[offset..offset + INODE_SIZE], inode);
        self.device
            .write_block(idx, &block)
            .with_context(|| format!("Failed to write inode {}", inode_no))
    }

    /// Allocates `count` free blocks, starting the search in `preferred_group` and continuing with the following groups,
    /// wrapping around at the end. Bitmaps and free block counters are only written if all `count` blocks are found,
    /// otherwise nothing changes and an empty vec is returned.
    /// PANICS: Panics if `preferred_group` is not a full group.
    pub fn allocate(&mut self, preferred_group: BlockGroupIdx, count: usize) -> Result<Vec<BlockIdx>> {
        let group_count = self.geometry.full_group_count;
        assert!(
            preferred_group < group_count,
            "Block group {} out of range, there are {} full groups",
            preferred_group,
            group_count
        );

        let free_blocks: u64 = self
            .group_descriptors
            .iter()
            .map(|descriptor| u64::from(descriptor.free_blocks_count()))
            .sum();
        if count as u64 > free_blocks {
            warn!("Unable to allocate {} blocks, only {} are free", count, free_blocks);
            return Ok(Vec::new());
        }

        let mut blocks = Vec::with_capacity(count);
        let mut modified_groups = Vec::new();
        for visited in 0..group_count {
            if blocks.len() == count {
                break;
            }
            let group = (preferred_group + visited) % group_count;
            let mut bitmap = self.load_block_bitmap(group)?;
            let group_start = self.geometry.group_start_block(group);
            let mut allocated_in_group = 0;
            let mut cursor = 0;
            while blocks.len() < count {
                match bitmap.next_unset(cursor) {
                    Some(bit) => {
                        bitmap.set(bit);
                        // bit < blocks_per_group, which is a u32
                        blocks.push(group_start + bit as BlockIdx);
                        allocated_in_group += 1;
                        cursor = bit + 1;
                    }
                    None => break,
                }
            }
            if allocated_in_group > 0 {
                modified_groups.push((group, bitmap, allocated_in_group));
            }
        }

        if blocks.len() < count {
            warn!("Unable to allocate {} blocks, only {} are free", count, blocks.len());
            return Ok(Vec::new());
        }

        for (group, bitmap, allocated) in modified_groups {
            self.store_block_bitmap(group, &bitmap)?;
            self.group_descriptors[usize::fromx(group)].decrement_free_blocks_count(allocated);
            self.dirty = true;
        }
        debug!("Allocated {} blocks starting in group {}", count, preferred_group);
        Ok(blocks)
    }

    /// Marks `blocks` as free again.
    /// PANICS: Panics if one of `blocks` is not a data block or is not allocated.
    pub fn release(&mut self, blocks: &[BlockIdx]) -> Result<()> {
        let blocks_by_group = blocks
            .iter()
            .map(|&block| {
                let (group, relative_block) = self
                    .geometry
                    .locate_block(block)
                    .unwrap_or_else(|| panic!("Block {} belongs to no block group", block));
                assert!(
                    !self.geometry.metadata_blocks(group).contains(&block),
                    "Block {} is not a data block",
                    block
                );
                (group, relative_block)
            })
            .into_group_map();

        for (group, relative_blocks) in blocks_by_group.into_iter().sorted_by_key(|&(group, _)| group) {
            let mut bitmap = self.load_block_bitmap(group)?;
            for &relative_block in &relative_blocks {
                let bit = usize::fromx(relative_block);
                assert!(
                    bitmap.get(bit),
                    "Block {} is not allocated",
                    self.geometry.group_start_block(group) + relative_block
                );
                bitmap.clear(bit);
            }
            self.store_block_bitmap(group, &bitmap)?;
            // at most blocks_per_group distinct blocks per group
            self.group_descriptors[usize::fromx(group)].increment_free_blocks_count(relative_blocks.len() as u32);
            self.dirty = true;
        }
        debug!("Released {} blocks", blocks.len());
        Ok(())
    }

    /// Recomputes the superblock's free counters from the group descriptors.
    pub(super) fn update_superblock(&mut self) {
        let free_inodes = self
            .group_descriptors
            .iter()
            .map(|descriptor| u64::from(descriptor.free_inodes_count()))
            .sum();
        let free_blocks = self
            .group_descriptors
            .iter()
            .map(|descriptor| u64::from(descriptor.free_blocks_count()))
            .sum();
        self.superblock.set_free_counts(free_blocks, free_inodes);
    }

    /// Writes the superblock and the descriptor table to every full group. All copies are identical.
    pub(super) fn write_metadata(&mut self) -> Result<()> {
        let mut superblock_block: Block = [0; BLOCK_SIZE];
        write_plain(&mut superblock_block[..size_of::<SuperBlock>()], &self.superblock);

        let mut gdt_bytes = vec![0; usize::fromx(self.geometry.gdt_block_count) * BLOCK_SIZE];
        for (chunk, descriptor) in gdt_bytes.chunks_exact_mut(GROUP_DESCRIPTOR_SIZE).zip(&self.group_descriptors) {
            write_plain(chunk, descriptor);
        }

        for group in 0..self.geometry.full_group_count {
            self.device
                .write_block(self.geometry.superblock_block(group), &superblock_block)
                .with_context(|| format!("Failed to write the superblock of group {}", group))?;
            let gdt_start = self.geometry.gdt_start_block(group);
            for (idx, chunk) in (gdt_start..).zip(gdt_bytes.chunks_exact(BLOCK_SIZE)) {
                let mut block: Block = [0; BLOCK_SIZE];
                block.copy_from_slice(chunk);
                self.device
                    .write_block(idx, &block)
                    .with_context(|| format!("Failed to write the descriptor table of group {}", group))?;
            }
        }
        Ok(())
    }

    /// Persists modified counters to every block group and flushes the device.
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.update_superblock();
            self.write_metadata()?;
            self.dirty = false;
        }
        self.device.flush_all().context("Failed to flush the device")
    }
}

impl<D: BlockDevice> Drop for Ext2Fs<D> {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            error!("Failed to sync the filesystem: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::block_device::MemoryDevice;
    use crate::ext2::{BlockPointer, DentryIter, FILE_TYPE_DIRECTORY, ROOT_INODE_NO, SUPERBLOCK_MAGIC};

    fn device_with_groups(full_group_count: usize) -> MemoryDevice {
        MemoryDevice::new((full_group_count * 8192 + 1) * BLOCK_SIZE)
    }

    fn formatted(full_group_count: usize) -> Ext2Fs<MemoryDevice> {
        Ext2Fs::open(device_with_groups(full_group_count), &FormatOptions::default()).unwrap()
    }

    fn reopen(fs: &mut Ext2Fs<MemoryDevice>, options: &FormatOptions) -> Ext2Fs<MemoryDevice> {
        fs.sync().unwrap();
        let bytes = fs.device().as_bytes().to_vec();
        Ext2Fs::open(MemoryDevice::from_bytes(bytes), options).unwrap()
    }

    fn root_directory_block(fs: &Ext2Fs<MemoryDevice>) -> BlockIdx {
        match fs.get_inode(ROOT_INODE_NO).unwrap().direct_block(0) {
            BlockPointer::Block(block) => block,
            pointer => panic!("Unexpected root block pointer {:?}", pointer),
        }
    }

    #[test]
    fn probe_rejects_blank_and_random_devices() {
        let blank = device_with_groups(1);
        assert!(!Ext2Fs::probe(&blank).unwrap());

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let random: Vec<u8> = (0..(8192 + 1) * BLOCK_SIZE).map(|_| rng.gen()).collect();
        assert!(!Ext2Fs::probe(&MemoryDevice::from_bytes(random)).unwrap());

        assert!(!Ext2Fs::probe(&MemoryDevice::new(BLOCK_SIZE)).unwrap());
    }

    #[test]
    fn probe_accepts_formatted_device() {
        let fs = formatted(1);
        assert!(Ext2Fs::probe(fs.device()).unwrap());
    }

    #[test]
    fn refuses_to_format_tiny_device() {
        assert!(Ext2Fs::open(MemoryDevice::new(8192 * BLOCK_SIZE), &FormatOptions::default()).is_err());
    }

    #[test]
    fn writes_identical_superblock_and_descriptors_to_every_group() {
        let mut fs = formatted(3);
        fs.sync().unwrap();
        let geometry = *fs.geometry();
        let bytes = fs.device().as_bytes();
        let group_metadata = |group| {
            let start = usize::fromx(geometry.superblock_block(group)) * BLOCK_SIZE;
            &bytes[start..start + (1 + usize::fromx(geometry.gdt_block_count)) * BLOCK_SIZE]
        };
        for group in 1..3 {
            assert_eq!(group_metadata(0), group_metadata(group));
        }

        let sb: SuperBlock = read_plain(group_metadata(2));
        assert_eq!(sb.s_magic, SUPERBLOCK_MAGIC);
        assert!(sb.is_valid(fs.device().block_count()));
    }

    #[test]
    fn creates_root_directory() {
        let fs = formatted(1);
        let root = fs.get_inode(ROOT_INODE_NO).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.permissions(), 0o755);
        assert_eq!(root.i_links_count, 2);
        assert_eq!(root.i_size, BLOCK_SIZE as u32);
        assert_eq!(root.i_blocks, (BLOCK_SIZE / 512) as u32);
        assert_eq!(root.direct_blocks().count(), 1);

        let root_block = root_directory_block(&fs);
        assert!(root_block >= fs.geometry().data_start_block(0));
        let mut block = [0; BLOCK_SIZE];
        fs.device().read_block(root_block, &mut block).unwrap();
        let entries: Vec<_> = DentryIter::new(&block).map(|entry| entry.unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b".");
        assert_eq!(entries[1].name, b"..");
        for entry in &entries {
            assert_eq!(entry.inner.inode_no, ROOT_INODE_NO);
            assert_eq!(entry.inner.file_type, FILE_TYPE_DIRECTORY);
        }
        assert_eq!(entries[0].dentry_len(), 12);
        assert_eq!(entries.iter().map(|entry| usize::from(entry.dentry_len())).sum::<usize>(), BLOCK_SIZE);
    }

    #[test]
    fn reserves_inodes_and_metadata_blocks() {
        let fs = formatted(2);
        let inode_bitmap = fs.load_inode_bitmap(0).unwrap();
        assert!((0..10).all(|bit| inode_bitmap.get(bit)));
        assert_eq!(inode_bitmap.count_set(), 10);
        assert_eq!(fs.load_inode_bitmap(1).unwrap().count_set(), 0);

        let metadata_block_count = usize::fromx(fs.geometry().metadata_block_count());
        let block_bitmap = fs.load_block_bitmap(1).unwrap();
        assert!((0..metadata_block_count).all(|bit| block_bitmap.get(bit)));
        assert_eq!(block_bitmap.count_set(), metadata_block_count);
        // group 0 additionally holds the root directory block
        assert_eq!(fs.load_block_bitmap(0).unwrap().count_set(), metadata_block_count + 1);
    }

    #[test]
    fn counts_root_directory_in_counters() {
        let fs = formatted(2);
        let geometry = *fs.geometry();
        let descriptors = fs.group_descriptors();
        assert_eq!(descriptors[0].free_inodes_count(), geometry.inodes_per_group - 10);
        assert_eq!(descriptors[0].used_dirs_count(), 1);
        assert_eq!(descriptors[0].free_blocks_count(), geometry.data_block_count - 1);
        assert_eq!(descriptors[1].free_blocks_count(), geometry.data_block_count);
        assert_eq!(fs.superblock().s_free_inodes_count, geometry.inode_count() - 10);
        assert_eq!(fs.superblock().s_free_blocks_count, 2 * geometry.data_block_count - 1);
    }

    #[test]
    fn allocates_free_data_blocks() {
        let mut fs = formatted(1);
        let root_block = root_directory_block(&fs);
        let before = fs.load_block_bitmap(0).unwrap();

        let blocks = fs.allocate(0, 20).unwrap();
        assert_eq!(blocks.len(), 20);
        assert_eq!(blocks.iter().unique().count(), 20);
        let after = fs.load_block_bitmap(0).unwrap();
        for &block in &blocks {
            assert!(block >= fs.geometry().data_start_block(0));
            assert_ne!(block, root_block);
            let bit = usize::fromx(block - FIRST_DATA_BLOCK);
            assert!(!before.get(bit));
            assert!(after.get(bit));
        }
        assert_eq!(
            fs.group_descriptors()[0].free_blocks_count(),
            fs.geometry().data_block_count - 21
        );
    }

    #[test]
    fn wraps_around_to_earlier_groups() {
        let mut fs = formatted(3);
        let data_block_count = usize::fromx(fs.geometry().data_block_count);
        // everything in groups 1 and 2, then the remaining blocks of group 0
        let count = 2 * data_block_count + 5;
        let blocks = fs.allocate(1, count).unwrap();
        assert_eq!(blocks.len(), count);

        let geometry = *fs.geometry();
        let groups: Vec<_> = blocks.iter().map(|&block| geometry.locate_block(block).unwrap().0).dedup().collect();
        assert_eq!(groups, vec![1, 2, 0]);
        assert_eq!(fs.group_descriptors()[1].free_blocks_count(), 0);
        assert_eq!(fs.group_descriptors()[2].free_blocks_count(), 0);
        assert_eq!(fs.group_descriptors()[0].free_blocks_count(), geometry.data_block_count - 1 - 5);
    }

    #[test]
    fn leaves_device_untouched_when_exhausted() {
        let mut fs = formatted(2);
        fs.sync().unwrap();
        let before = fs.device().as_bytes().to_vec();
        let descriptors = fs.group_descriptors().to_vec();

        let free_blocks = usize::fromx(fs.superblock().s_free_blocks_count);
        assert!(fs.allocate(0, free_blocks + 1).unwrap().is_empty());
        assert_eq!(fs.group_descriptors(), &descriptors[..]);
        assert!(fs.device().as_bytes() == &before[..]);

        assert_eq!(fs.allocate(1, free_blocks).unwrap().len(), free_blocks);
        assert!(fs.allocate(0, 1).unwrap().is_empty());
    }

    #[test]
    fn rejects_oversized_request_without_allocating() {
        let mut fs = formatted(1);
        fs.sync().unwrap();
        let before = fs.device().as_bytes().to_vec();
        let descriptors = fs.group_descriptors().to_vec();

        assert!(fs.allocate(0, usize::MAX).unwrap().is_empty());
        assert!(fs.allocate(0, usize::MAX / 2).unwrap().is_empty());
        assert_eq!(fs.group_descriptors(), &descriptors[..]);
        assert!(fs.device().as_bytes() == &before[..]);
    }

    #[test]
    fn releases_blocks() {
        let mut fs = formatted(2);
        let blocks = fs.allocate(0, 10).unwrap();
        let free_before = fs.group_descriptors()[0].free_blocks_count();

        fs.release(&blocks[..4]).unwrap();
        assert_eq!(fs.group_descriptors()[0].free_blocks_count(), free_before + 4);
        let bitmap = fs.load_block_bitmap(0).unwrap();
        for &block in &blocks[..4] {
            assert!(!bitmap.get(usize::fromx(block - FIRST_DATA_BLOCK)));
        }

        // released blocks are handed out again first
        let again = fs.allocate(0, 4).unwrap();
        assert_eq!(again, blocks[..4].to_vec());
    }

    #[test]
    #[should_panic(expected = "not a data block")]
    fn refuses_to_release_metadata() {
        let mut fs = formatted(1);
        let inode_table = fs.geometry().inode_table_start_block(0);
        fs.release(&[inode_table]).unwrap();
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn refuses_to_release_free_block() {
        let mut fs = formatted(1);
        let last = fs.geometry().group_end_block(0) - 1;
        fs.release(&[last]).unwrap();
    }

    #[test]
    fn round_trips_inodes_across_groups() {
        let mut fs = formatted(2);
        let geometry = *fs.geometry();
        let last_inode = geometry.inode_count();
        let inode_numbers = [11, 12, geometry.inodes_per_group, geometry.inodes_per_group + 1, last_inode];

        for &inode_no in &inode_numbers {
            let mut inode = Inode::new_directory(0o700, inode_no);
            inode.push_direct_block(1000 + inode_no, BLOCK_SIZE);
            fs.put_inode(inode_no, &inode).unwrap();
        }
        for &inode_no in &inode_numbers {
            let inode = fs.get_inode(inode_no).unwrap();
            assert_eq!(inode.i_mtime, inode_no);
            assert_eq!(inode.direct_block(0), BlockPointer::Block(1000 + inode_no));
        }
        // neighbours sharing a table block are untouched
        assert_eq!(fs.get_inode(13).unwrap(), Inode::default());
        assert!(fs.get_inode(ROOT_INODE_NO).unwrap().is_dir());
        // the inode bitmap is not managed by the inode accessors
        assert_eq!(fs.load_inode_bitmap(1).unwrap().count_set(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn refuses_inode_beyond_last_group() {
        let fs = formatted(1);
        fs.get_inode(fs.geometry().inode_count() + 1).unwrap();
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn refuses_inode_zero() {
        formatted(1).get_inode(0).unwrap();
    }

    #[test]
    fn round_trips_bitmaps() {
        let mut fs = formatted(2);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut bitmap = Bitmap::new(usize::fromx(fs.geometry().inodes_per_group));
        for _ in 0..500 {
            bitmap.set(rng.gen_range(0..bitmap.len()));
        }
        fs.store_inode_bitmap(1, &bitmap).unwrap();
        assert_eq!(fs.load_inode_bitmap(1).unwrap(), bitmap);

        // padding past the bitmap is written as zeroes
        let mut block = [0; BLOCK_SIZE];
        fs.device().read_block(fs.geometry().inode_bitmap_block(1), &mut block).unwrap();
        assert!(block[bitmap.as_bytes().len()..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn reopens_existing_filesystem() {
        let mut fs = formatted(2);
        let blocks = fs.allocate(1, 3).unwrap();
        let options = FormatOptions { volume_name: b"ignored".to_vec(), force: false };
        let reopened = reopen(&mut fs, &options);

        assert_eq!(reopened.geometry(), fs.geometry());
        assert_eq!(reopened.superblock(), fs.superblock());
        assert_eq!(reopened.group_descriptors(), fs.group_descriptors());
        assert_eq!(reopened.superblock().volume_name(), b"");
        let bitmap = reopened.load_block_bitmap(1).unwrap();
        let group_start = reopened.geometry().group_start_block(1);
        assert!(blocks.iter().all(|&block| bitmap.get(usize::fromx(block - group_start))));
    }

    #[test]
    fn reopens_filesystem_with_trailing_short_group() {
        let device = MemoryDevice::new((2 * 8192 + 1 + 300) * BLOCK_SIZE);
        let mut fs = Ext2Fs::open(device, &FormatOptions::default()).unwrap();
        let reopened = reopen(&mut fs, &FormatOptions::default());

        let geometry = reopened.geometry();
        assert_eq!(geometry.full_group_count, 2);
        assert_eq!(geometry.group_count, 3);
        assert_eq!(geometry.last_group_block_count, 300);
        assert_eq!(geometry, fs.geometry());
        assert_eq!(reopened.superblock().s_blocks_count, 2 * 8192 + 1);
    }

    #[test]
    fn reformats_when_forced() {
        let mut fs = formatted(1);
        fs.allocate(0, 100).unwrap();
        let uuid = fs.superblock().s_uuid;
        let options = FormatOptions { volume_name: b"fresh".to_vec(), force: true };
        let reformatted = reopen(&mut fs, &options);

        assert_ne!(reformatted.superblock().s_uuid, uuid);
        assert_eq!(reformatted.superblock().volume_name(), b"fresh");
        assert_eq!(
            reformatted.group_descriptors()[0].free_blocks_count(),
            reformatted.geometry().data_block_count - 1
        );
    }

    #[test]
    fn persists_counters_on_sync() {
        let mut fs = formatted(1);
        fs.allocate(0, 7).unwrap();
        let flushes = fs.device().flush_count;
        fs.sync().unwrap();
        assert_eq!(fs.device().flush_count, flushes + 1);

        let on_disk: SuperBlock = read_plain(&fs.device().as_bytes()[BLOCK_SIZE..]);
        assert_eq!(on_disk.s_free_blocks_count, fs.geometry().data_block_count - 8);
    }
}
