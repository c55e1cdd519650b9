use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, binrw};

/// 引导块，占分区前两个扇区，只有开头的磁盘类型有意义。
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootBlock {
    pub disktype: u32,
}

impl BootBlock {
    pub fn decode(buf: &[u8]) -> BinResult<Self> {
        Self::read(&mut Cursor::new(buf))
    }

    /// 其余字节填零
    pub fn encode(&self, buf: &mut [u8]) -> BinResult<()> {
        buf.fill(0);
        self.write(&mut Cursor::new(buf))
    }
}
