mod dentry;
mod format;
mod fs;
mod geometry;
mod group_descriptor;
mod inode;
mod layout;
mod superblock;

pub use self::dentry::*;
pub use self::fs::*;
pub use self::geometry::*;
pub use self::group_descriptor::*;
pub use self::inode::*;
pub use self::superblock::*;

/// The only block size this filesystem is built with. The primary superblock lives at byte 1024, so with 1 KiB blocks
/// block 0 is reserved and every block group starts one block later than it would otherwise.
pub const BLOCK_SIZE: usize = 1024;
pub const INODE_SIZE: usize = 128;
/// One inode is provisioned for every `BYTES_PER_INODE` bytes of data blocks.
pub const BYTES_PER_INODE: usize = 2048;
pub const GROUP_DESCRIPTOR_SIZE: usize = 32;
/// Block group 0 starts after the reserved boot block.
pub const FIRST_DATA_BLOCK: BlockIdx = 1;

pub const FIRST_EXISTING_INODE: InodeNo = 1;
pub const ROOT_INODE_NO: InodeNo = 2;
/// Inodes below this number are reserved.
pub const FIRST_NON_RESERVED_INODE: InodeNo = 11;

/// An absolute block index on the device.
pub type BlockIdx = u32;
pub type BlockCount = u32;
pub type BlockGroupIdx = u32;
pub type BlockGroupCount = u32;
pub type BlockSize = u32;
pub type InodeNo = u32;
pub type InodeCount = u32;
