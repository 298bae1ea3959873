use std::mem::size_of;

use static_assertions::const_assert_eq;

use crate::ext2::{BlockIdx, INODE_SIZE};
use crate::util::Plain;

const_assert_eq!(size_of::<Inode>(), INODE_SIZE);

pub const DIRECT_BLOCK_COUNT: usize = 12;
/// direct pointers + single, double and triple indirect pointer
pub const BLOCK_POINTER_COUNT: usize = DIRECT_BLOCK_COUNT + 3;

pub const S_IFDIR: u16 = 0o040000;
const S_IFMT: u16 = 0o170000;

const RAW_BLOCK_END: u32 = 0;
const RAW_BLOCK_SPARSE: u32 = 1;

/// The meaning of one direct block pointer slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockPointer {
    /// No blocks are allocated at or after this slot.
    End,
    /// A hole in a sparse file, later slots may still be allocated.
    Sparse,
    Block(BlockIdx),
}

impl BlockPointer {
    fn from_raw(raw: u32) -> Self {
        match raw {
            RAW_BLOCK_END => Self::End,
            // block 1 always holds the primary superblock, so it can never be a file's data block
            RAW_BLOCK_SPARSE => Self::Sparse,
            block => Self::Block(block),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            Self::End => RAW_BLOCK_END,
            Self::Sparse => RAW_BLOCK_SPARSE,
            Self::Block(block) => {
                assert!(block > RAW_BLOCK_SPARSE, "Block {} cannot hold file data", block);
                block
            }
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    /// in 512 byte units
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_osd1: u32,
    i_block: [u32; BLOCK_POINTER_COUNT],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub i_osd2: [u8; 12],
}

// SAFETY: only integers and integer arrays, no padding (checked by the size assertion above)
unsafe impl Plain for Inode {}

impl Inode {
    /// An empty directory owned by root with permissions `permissions` and every timestamp set to `now`.
    pub fn new_directory(permissions: u16, now: u32) -> Self {
        Self {
            i_mode: S_IFDIR | (permissions & !S_IFMT),
            i_atime: now,
            i_ctime: now,
            i_mtime: now,
            ..Self::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == S_IFDIR
    }

    pub fn permissions(&self) -> u16 {
        self.i_mode & !S_IFMT
    }

    /// PANICS: Panics if `slot` is not a direct slot
    pub fn direct_block(&self, slot: usize) -> BlockPointer {
        assert!(slot < DIRECT_BLOCK_COUNT, "Slot {} is not a direct block pointer", slot);
        BlockPointer::from_raw(self.i_block[slot])
    }

    /// PANICS: Panics if `slot` is not a direct slot
    pub fn set_direct_block(&mut self, slot: usize, pointer: BlockPointer) {
        assert!(slot < DIRECT_BLOCK_COUNT, "Slot {} is not a direct block pointer", slot);
        self.i_block[slot] = pointer.to_raw();
    }

    /// Iterates over the direct block slots up to the first `BlockPointer::End`.
    pub fn direct_blocks(&self) -> impl Iterator<Item = BlockPointer> + '_ {
        (0..DIRECT_BLOCK_COUNT)
            .map(move |slot| self.direct_block(slot))
            .take_while(|&pointer| pointer != BlockPointer::End)
    }

    /// Appends `block` after the last allocated direct slot and accounts for it in `i_blocks`. Returns false if every
    /// direct slot is taken.
    pub fn push_direct_block(&mut self, block: BlockIdx, block_size: usize) -> bool {
        let used_slots = self.direct_blocks().count();
        if used_slots == DIRECT_BLOCK_COUNT {
            return false;
        }
        self.set_direct_block(used_slots, BlockPointer::Block(block));
        self.increment_used_blocks(1, block_size);
        true
    }

    pub fn increment_used_blocks(&mut self, block_count: usize, block_size: usize) {
        // i_blocks counts 512 byte units, not blocks
        let sectors = block_count * block_size / 512;
        self.i_blocks += u32::try_from(sectors).expect("Inode block count overflow");
    }

    pub fn increment_link_count(&mut self) {
        self.i_links_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{read_plain, write_plain};

    #[test]
    fn stops_at_end_marker() {
        let mut inode = Inode::new_directory(0o755, 0);
        inode.set_direct_block(0, BlockPointer::Block(700));
        inode.set_direct_block(1, BlockPointer::Sparse);
        inode.set_direct_block(2, BlockPointer::Block(702));
        inode.set_direct_block(4, BlockPointer::Block(704));

        let pointers: Vec<_> = inode.direct_blocks().collect();
        assert_eq!(
            pointers,
            vec![BlockPointer::Block(700), BlockPointer::Sparse, BlockPointer::Block(702)]
        );
    }

    #[test]
    fn pushes_direct_blocks_until_full() {
        let mut inode = Inode::default();
        for block in 0..DIRECT_BLOCK_COUNT as u32 {
            assert!(inode.push_direct_block(100 + block, 1024));
        }
        assert!(!inode.push_direct_block(200, 1024));
        assert_eq!(inode.direct_blocks().count(), DIRECT_BLOCK_COUNT);
        assert_eq!(inode.i_blocks, 2 * DIRECT_BLOCK_COUNT as u32);
    }

    #[test]
    #[should_panic]
    fn refuses_superblock_as_data_block() {
        Inode::default().set_direct_block(0, BlockPointer::Block(1));
    }

    #[test]
    fn places_block_pointers_at_ext2_offset() {
        let mut inode = Inode::new_directory(0o755, 42);
        inode.set_direct_block(0, BlockPointer::Block(0x0102_0304));
        let mut bytes = [0u8; INODE_SIZE];
        write_plain(&mut bytes, &inode);

        assert_eq!(&bytes[0..2], &(S_IFDIR | 0o755).to_le_bytes());
        assert_eq!(&bytes[8..12], &42u32.to_le_bytes());
        assert_eq!(&bytes[40..44], &0x0102_0304u32.to_le_bytes());
        assert_eq!(read_plain::<Inode>(&bytes), inode);
        assert!(inode.is_dir());
        assert_eq!(inode.permissions(), 0o755);
    }
}
