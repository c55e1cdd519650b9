//! 分区几何与格式化参数

use crate::error::{Error, Result};

/// 卷至少需要的保留块数
pub const MIN_NUM_RESERVED: u32 = 64;

/// 保留块数上限
pub const MAX_NUM_RESERVED: u32 = 4096 + 255 * 1024 * 8;

/// 缓存槽的下限
pub const MIN_BUFFERS: usize = 16;

/// 分区几何，对应 DosEnvec 中引擎关心的字段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub blocks_per_track: u32,
    pub surfaces: u32,
    pub low_cyl: u32,
    pub high_cyl: u32,
    /// 物理块（扇区）的字节数
    pub block_size: u32,
    /// 块缓存的槽数
    pub buffer_count: u32,
    /// 设备能寻址的最大字节偏移
    pub address_mask: u64,
    /// 格式化时指定的保留块大小，`None`则按分区大小选择
    pub reserved_blksize: Option<u16>,
}

impl Geometry {
    /// 单柱面单磁头的平坦布局，适用于镜像文件
    pub fn from_size(bytes: u64, block_size: u32) -> Self {
        let sectors = bytes / u64::from(block_size.max(1));

        Self {
            blocks_per_track: 1,
            surfaces: 1,
            low_cyl: 0,
            high_cyl: sectors.saturating_sub(1) as u32,
            block_size,
            buffer_count: 64,
            address_mask: u64::MAX,
            reserved_blksize: None,
        }
    }

    pub fn blocks_per_cylinder(&self) -> u64 {
        u64::from(self.blocks_per_track) * u64::from(self.surfaces)
    }

    /// 分区首个扇区（相对于设备）
    pub fn first_block(&self) -> u64 {
        u64::from(self.low_cyl) * self.blocks_per_cylinder()
    }

    /// 分区最后一个扇区（相对于设备）
    pub fn last_block(&self) -> u64 {
        (u64::from(self.high_cyl) + 1) * self.blocks_per_cylinder() - 1
    }

    pub fn total_blocks(&self) -> u64 {
        self.last_block() + 1 - self.first_block()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            log::error!("unsupported block size {}", self.block_size);
            return Err(Error::OutOfRange { block: 0 });
        }
        if self.blocks_per_cylinder() == 0 || self.high_cyl < self.low_cyl {
            log::error!("empty partition {self:?}");
            return Err(Error::OutOfRange { block: 0 });
        }

        let last_byte = (self.last_block() + 1) * u64::from(self.block_size) - 1;
        if last_byte > self.address_mask {
            log::error!(
                "partition end {last_byte:#x} beyond address mask {:#x}",
                self.address_mask
            );
            return Err(Error::OutOfRange {
                block: self.last_block(),
            });
        }
        if self.total_blocks() > u64::from(u32::MAX) {
            return Err(Error::OutOfRange {
                block: self.last_block(),
            });
        }

        Ok(())
    }

    pub(crate) fn cache_slots(&self) -> usize {
        (self.buffer_count as usize).max(MIN_BUFFERS)
    }
}

/// 格式化选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// 回收站块数，0表示不启用
    pub deldir_blocks: u16,
    /// 文件名上限107字节（否则31字节）
    pub long_filenames: bool,
    /// 强制开启/关闭超级索引，`None`按大小选择
    pub super_index: Option<bool>,
    /// 以`(seqnr << 16) | offset`编码anode号
    pub split_anodes: bool,
    /// 允许超过4GiB的文件
    pub large_files: bool,
    /// 目录项携带扩展字段
    pub dir_extension: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            deldir_blocks: 2,
            long_filenames: false,
            super_index: None,
            split_anodes: true,
            large_files: true,
            dir_extension: true,
        }
    }
}

/// 由根块推导出的卷常量
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    /// 分区在设备上的起始扇区
    pub partition_start: u64,
    pub block_size: usize,
    /// 分区扇区数
    pub disksize: u32,
    /// 保留块字节数
    pub rbs: usize,
    /// 一个保留块占的扇区数
    pub rescluster: u32,
    pub first_reserved: u32,
    pub last_reserved: u32,
    /// 根簇（根块 + 保留区位图）的保留块数
    pub rblkcluster: u32,
    pub anodes_per_block: u32,
    pub index_per_block: u32,
    pub longs_per_bmb: u32,
    pub deldir_per_block: u32,
    pub split_anodes: bool,
    pub super_index: bool,
    pub dir_ext: bool,
    pub large_files: bool,
    /// 文件名上限（不含长度字节）
    pub max_name: usize,
}

impl Layout {
    pub fn new(geometry: &Geometry, rbs: usize) -> Self {
        let block_size = geometry.block_size as usize;

        Self {
            partition_start: geometry.first_block(),
            block_size,
            disksize: geometry.total_blocks() as u32,
            rbs,
            rescluster: (rbs / block_size) as u32,
            first_reserved: 2,
            last_reserved: 0,
            rblkcluster: 1,
            anodes_per_block: ((rbs - 16) / 12) as u32,
            index_per_block: ((rbs - 12) / 4) as u32,
            longs_per_bmb: ((rbs - 12) / 4) as u32,
            deldir_per_block: ((rbs - 32) / 32) as u32,
            split_anodes: true,
            super_index: false,
            dir_ext: true,
            large_files: true,
            max_name: 31,
        }
    }

    pub fn bitmap_start(&self) -> u32 {
        self.last_reserved + 1
    }

    /// 数据区块数
    pub fn data_blocks(&self) -> u32 {
        self.disksize.saturating_sub(self.bitmap_start())
    }

    pub fn num_reserved(&self) -> u32 {
        (self.last_reserved + 1 - self.first_reserved) / self.rescluster
    }

    pub fn blocks_per_bitmap(&self) -> u32 {
        self.longs_per_bmb * 32
    }

    pub fn bitmap_blocks(&self) -> u32 {
        self.data_blocks().div_ceil(self.blocks_per_bitmap())
    }

    pub fn reserved_blocknr(&self, index: u32) -> u32 {
        self.first_reserved + index * self.rescluster
    }

    /// 保留块号在保留区位图中的位置
    pub fn reserved_index(&self, blocknr: u32) -> Option<u32> {
        (blocknr >= self.first_reserved
            && blocknr <= self.last_reserved
            && (blocknr - self.first_reserved) % self.rescluster == 0)
            .then(|| (blocknr - self.first_reserved) / self.rescluster)
    }

    /// 把anode号拆成（anode块序号，块内偏移）
    pub fn split_anode(&self, anodenr: u32) -> (u32, u32) {
        if self.split_anodes {
            (anodenr >> 16, anodenr & 0xFFFF)
        } else {
            (
                anodenr / self.anodes_per_block,
                anodenr % self.anodes_per_block,
            )
        }
    }

    pub fn join_anode(&self, seqnr: u32, offset: u32) -> u32 {
        if self.split_anodes {
            (seqnr << 16) | offset
        } else {
            seqnr * self.anodes_per_block + offset
        }
    }

    /// 能寻址的anode块数上限
    pub fn max_anode_blocks(&self) -> u32 {
        let index_blocks = if self.super_index {
            crate::volume::SUPER_INDEX_SLOTS as u32 * self.index_per_block
        } else {
            crate::volume::SMALL_INDEX_SLOTS as u32
        };
        let by_index = index_blocks * self.index_per_block;
        if self.split_anodes {
            by_index.min(0x1_0000)
        } else {
            by_index.min(u32::MAX / self.anodes_per_block)
        }
    }

    /// 目录块可用于目录项的字节数
    pub fn dir_space(&self) -> usize {
        self.rbs - crate::volume::DIR_HEADER_SIZE
    }

    /// 字节数折合成数据块数
    pub fn blocks_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.block_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_image() {
        let geo = Geometry::from_size(8 << 20, 512);
        assert_eq!(0, geo.first_block());
        assert_eq!(16384, geo.total_blocks());
        assert!(geo.validate().is_ok());
        assert_eq!(64, geo.cache_slots());
    }

    #[test]
    fn address_mask() {
        let mut geo = Geometry::from_size(8 << 20, 512);
        geo.address_mask = (4 << 20) - 1;
        assert!(matches!(geo.validate(), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn capacities() {
        let geo = Geometry::from_size(8 << 20, 512);
        let layout = Layout::new(&geo, 1024);
        assert_eq!(2, layout.rescluster);
        assert_eq!(84, layout.anodes_per_block);
        assert_eq!(253, layout.index_per_block);
        assert_eq!(31, layout.deldir_per_block);
        assert_eq!((3, 17), layout.split_anode(layout.join_anode(3, 17)));
    }
}
