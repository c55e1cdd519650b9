//! 卷的布局
//!
//! 引导块 | 根簇（根块 + 保留区位图） | 保留区 | 数据区
//!
//! 所有整数都按大端存放。保留区由大小为`reserved_blksize`的保留块组成，
//! 存放目录块、anode块、索引块、位图块等元数据；数据区只存放文件内容。

mod anode;
mod bitmap;
mod boot;
mod deldir;
mod dir_entry;
mod extension;
mod root;

use enumflags2::bitflags;

pub use self::{
    anode::{Anode, AnodeBlock, IndexBlock},
    bitmap::BitmapBlock,
    boot::BootBlock,
    deldir::{DeldirBlock, DeldirEntry},
    dir_entry::{DirBlock, DirEntry, EntryType, ExtraFields},
    extension::{PostponedOp, RootExtension},
    root::RootBlock,
};

/// 'PFS\1'
pub const ID_PFS_DISK: u32 = 0x5046_5301;
/// 'PFS\2'
pub const ID_PFS2_DISK: u32 = 0x5046_5302;
/// 'muAF'
pub const ID_MUAF_DISK: u32 = 0x6D75_4146;
/// 'muPF'
pub const ID_MUPFS_DISK: u32 = 0x6D75_5046;

pub const DBLKID: u16 = 0x4442;
pub const ABLKID: u16 = 0x4142;
pub const IBLKID: u16 = 0x4942;
pub const BMBLKID: u16 = 0x424D;
pub const BMIBLKID: u16 = 0x4D49;
pub const DELDIRID: u16 = 0x4444;
pub const EXTENSIONID: u16 = 0x4558;
pub const SBLKID: u16 = 0x5342;

pub const BOOTBLOCK1: u32 = 0;
pub const ROOTBLOCK: u32 = 2;

/// 根块中索引表的总槽数
pub const ROOT_INDEX_SLOTS: usize = 104;
/// 小卷模式下位图索引块指针数
pub const SMALL_BITMAP_SLOTS: usize = 5;
/// 小卷模式下anode索引块指针数
pub const SMALL_INDEX_SLOTS: usize = 99;
pub const SUPER_INDEX_SLOTS: usize = 16;
pub const MAX_DELDIR_BLOCKS: usize = 32;

pub const ROOT_SIZE: usize = 512;
pub const EXTENSION_SIZE: usize = 272;
pub const DIR_HEADER_SIZE: usize = 20;
pub const ANODE_HEADER_SIZE: usize = 16;
pub const INDEX_HEADER_SIZE: usize = 12;
pub const DELDIR_HEADER_SIZE: usize = 32;
pub const DELDIR_ENTRY_SIZE: usize = 32;
pub const ANODE_SIZE: usize = 12;

/// 文件系统版本（写入根块扩展）
pub const PFS2_VERSION: u32 = (19 << 16) | 2;

/// 卷选项，存放于`RootBlock::options`
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOption {
    HardDisk = 1,
    SplittedAnodes = 2,
    DirExtension = 4,
    Deldir = 8,
    SizeField = 16,
    Extension = 32,
    Datestamp = 64,
    SuperIndex = 128,
    SuperDeldir = 256,
    ExtRoving = 512,
    LongFn = 1024,
    LargeFile = 2048,
}

/// 根块扩展中的选项
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionOption {
    /// 支持用户/组字段
    MultiUser = 1,
}

/// 特殊的anode号
pub mod anodes {
    /// 链表结束
    pub const EOF: u32 = 0;
    pub const BADBLOCKS: u32 = 4;
    pub const ROOTDIR: u32 = 5;
    /// 首个可分配给用户的anode
    pub const USERFIRST: u32 = 6;
    /// 已分配但尚未绑定区段
    pub const UNINIT: u32 = u32::MAX;
}

/// 数据保护位（置位即禁止）
pub mod protection {
    pub const DELETE: u32 = 1 << 0;
    pub const EXECUTE: u32 = 1 << 1;
    pub const WRITE: u32 = 1 << 2;
    pub const READ: u32 = 1 << 3;
}

pub fn is_pfs_disktype(disktype: u32) -> bool {
    matches!(
        disktype,
        ID_PFS_DISK | ID_PFS2_DISK | ID_MUAF_DISK | ID_MUPFS_DISK
    )
}

/// 读出Pascal字符串（首字节为长度）
pub(crate) fn pascal_get(field: &[u8]) -> Vec<u8> {
    let len = field.first().copied().unwrap_or(0) as usize;
    field[1..].iter().take(len).copied().collect()
}

/// 写入Pascal字符串，超长部分被截断
pub(crate) fn pascal_put(field: &mut [u8], value: &[u8]) {
    field.fill(0);
    let len = value.len().min(field.len().saturating_sub(1));
    if let Some(first) = field.first_mut() {
        *first = len as u8;
    }
    field[1..=len].copy_from_slice(&value[..len]);
}
