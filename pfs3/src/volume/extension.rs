use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, binrw};
use enumflags2::BitFlags;

use super::{ExtensionOption, MAX_DELDIR_BLOCKS, SUPER_INDEX_SLOTS};
use crate::date::DateStamp;

/// 挂起的操作。
///
/// 多步释放开始前写入，结束后清零；挂载时若不为零则重新执行。
#[binrw]
#[brw(big)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PostponedOp {
    /// 0：无；1：释放块与anode；2：释放块但保留链头；3：释放anode链
    pub operation_id: u32,
    /// 链头anode
    pub argument1: u32,
    /// 需保留的块数
    pub argument2: u32,
    /// 释放模式
    pub argument3: u32,
}

impl PostponedOp {
    pub const NONE: u32 = 0;
    pub const FREEBLOCKS_FREE: u32 = 1;
    pub const FREEBLOCKS_KEEP: u32 = 2;
    pub const FREEANODECHAIN: u32 = 3;

    pub fn is_pending(&self) -> bool {
        self.operation_id != Self::NONE
    }
}

/// 根块扩展
#[binrw]
#[brw(big, magic = 0x4558u16)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootExtension {
    _not_used: u16,

    /// [`ExtensionOption`]
    ext_options: u32,

    pub datestamp: u32,

    pub pfs2version: u32,

    /// 根目录的修改时间
    pub root_date: DateStamp,

    /// 卷的修改时间
    pub volume_date: DateStamp,

    pub tobedone: PostponedOp,

    /// 保留区分配游标
    pub reserved_roving: u32,

    /// 游标所在长字内的位
    pub rovingbit: u16,

    /// 目录anode链分配序号
    pub curranseqnr: u16,

    /// 回收站写入游标
    pub deldirroving: u16,

    /// 回收站块数
    pub deldirsize: u16,

    /// 文件名字段长度（含长度字节）
    pub fnsize: u16,

    _not_used_2: [u16; 3],

    pub superindex: [u32; SUPER_INDEX_SLOTS],

    pub dd_uid: u16,

    pub dd_gid: u16,

    pub dd_protection: u32,

    pub dd_creation: DateStamp,

    _not_used_3: u16,

    /// 回收站块的块号
    pub deldir: [u32; MAX_DELDIR_BLOCKS],
}

impl RootExtension {
    pub fn new() -> Self {
        Self {
            _not_used: 0,
            ext_options: 0,
            datestamp: 0,
            pfs2version: 0,
            root_date: DateStamp::default(),
            volume_date: DateStamp::default(),
            tobedone: PostponedOp::default(),
            reserved_roving: 0,
            rovingbit: 0,
            curranseqnr: 0,
            deldirroving: 0,
            deldirsize: 0,
            fnsize: 0,
            _not_used_2: [0; 3],
            superindex: [0; SUPER_INDEX_SLOTS],
            dd_uid: 0,
            dd_gid: 0,
            dd_protection: 0,
            dd_creation: DateStamp::default(),
            _not_used_3: 0,
            deldir: [0; MAX_DELDIR_BLOCKS],
        }
    }

    pub fn decode(buf: &[u8]) -> BinResult<Self> {
        Self::read(&mut Cursor::new(buf))
    }

    pub fn encode(&self, buf: &mut [u8]) -> BinResult<()> {
        buf.fill(0);
        self.write(&mut Cursor::new(buf))
    }

    pub fn ext_options(&self) -> BitFlags<ExtensionOption> {
        BitFlags::from_bits_truncate(self.ext_options)
    }
}

impl Default for RootExtension {
    fn default() -> Self {
        Self::new()
    }
}
