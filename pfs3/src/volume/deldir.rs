use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, binrw};

use super::{DELDIR_ENTRY_SIZE, DELDIR_HEADER_SIZE, pascal_get, pascal_put};
use crate::date::DateStamp;

/// 回收站中的一条记录，`anodenr`为零表示空槽。
#[binrw]
#[brw(big)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeldirEntry {
    pub anodenr: u32,
    pub fsize: u32,
    pub creation: DateStamp,
    /// Pascal字符串，最多15字节
    filename: [u8; 16],
    /// 文件大小的高16位
    pub fsizex: u16,
}

impl DeldirEntry {
    pub fn new(anodenr: u32, size: u64, creation: DateStamp, name: &[u8]) -> Self {
        let mut entry = Self {
            anodenr,
            fsize: size as u32,
            creation,
            filename: [0; 16],
            fsizex: (size >> 32) as u16,
        };
        pascal_put(&mut entry.filename, name);
        entry
    }

    pub fn is_empty(&self) -> bool {
        self.anodenr == 0
    }

    pub fn name(&self) -> Vec<u8> {
        pascal_get(&self.filename)
    }

    pub fn size(&self) -> u64 {
        u64::from(self.fsize) | (u64::from(self.fsizex) << 32)
    }
}

/// 回收站块
#[binrw]
#[brw(big, magic = 0x4444u16)]
#[br(import(count: usize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeldirBlock {
    _not_used: u16,
    pub datestamp: u32,
    pub seqnr: u32,
    _not_used_2: [u16; 2],
    _not_used_3: u16,
    pub uid: u16,
    pub gid: u16,
    pub protection: u32,
    pub creation: DateStamp,
    #[br(count = count)]
    pub entries: Vec<DeldirEntry>,
}

impl DeldirBlock {
    pub fn new(seqnr: u32, rbs: usize) -> Self {
        Self {
            _not_used: 0,
            datestamp: 0,
            seqnr,
            _not_used_2: [0; 2],
            _not_used_3: 0,
            uid: 0,
            gid: 0,
            protection: 0,
            creation: DateStamp::default(),
            entries: vec![DeldirEntry::default(); (rbs - DELDIR_HEADER_SIZE) / DELDIR_ENTRY_SIZE],
        }
    }

    pub fn decode(buf: &[u8]) -> BinResult<Self> {
        let count = buf.len().saturating_sub(DELDIR_HEADER_SIZE) / DELDIR_ENTRY_SIZE;
        Self::read_args(&mut Cursor::new(buf), (count,))
    }

    pub fn encode(&self, buf: &mut [u8]) -> BinResult<()> {
        buf.fill(0);
        self.write(&mut Cursor::new(buf))
    }
}
