use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, binrw};
use enumflags2::BitFlags;

use super::{
    ROOT_INDEX_SLOTS, SMALL_BITMAP_SLOTS, SMALL_INDEX_SLOTS, VolumeOption, pascal_get, pascal_put,
};
use crate::date::DateStamp;

/// 根块，位于分区第2扇区，是保留区的第一个块。
///
/// 每次提交时最后写入，它落盘即代表一次更新完成。
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBlock {
    pub disktype: u32,

    /// [`VolumeOption`]
    options: u32,

    /// 每次提交加一
    pub datestamp: u32,

    pub creation: DateStamp,

    pub protection: u16,

    /// Pascal字符串
    diskname: [u8; 32],

    /// 保留区最后一个扇区
    pub lastreserved: u32,

    /// 保留区第一个扇区
    pub firstreserved: u32,

    /// 空闲保留块数
    pub reserved_free: u32,

    /// 保留块字节数
    pub reserved_blksize: u16,

    /// 根簇占用的保留块数
    pub rblkcluster: u16,

    /// 数据区空闲块数
    pub blocksfree: u32,

    /// 始终保持空闲的块数
    pub alwaysfree: u32,

    /// 数据区分配游标
    pub roving_ptr: u32,

    /// 旧版回收站块（未使用）
    pub deldir: u32,

    /// 分区扇区数
    pub disksize: u32,

    /// 根块扩展所在的块
    pub extension: u32,

    _not_used: u32,

    /// 小卷：bitmapindex[5] + indexblocks[99]；
    /// 超级索引：bitmapindex[104]
    idx: [u32; ROOT_INDEX_SLOTS],
}

impl RootBlock {
    pub fn new() -> Self {
        Self {
            disktype: 0,
            options: 0,
            datestamp: 0,
            creation: DateStamp::default(),
            protection: 0,
            diskname: [0; 32],
            lastreserved: 0,
            firstreserved: 0,
            reserved_free: 0,
            reserved_blksize: 0,
            rblkcluster: 0,
            blocksfree: 0,
            alwaysfree: 0,
            roving_ptr: 0,
            deldir: 0,
            disksize: 0,
            extension: 0,
            _not_used: 0,
            idx: [0; ROOT_INDEX_SLOTS],
        }
    }

    pub fn decode(buf: &[u8]) -> BinResult<Self> {
        Self::read(&mut Cursor::new(buf))
    }

    /// `buf`为整个保留块，根块之后的字节填零
    pub fn encode(&self, buf: &mut [u8]) -> BinResult<()> {
        buf.fill(0);
        self.write(&mut Cursor::new(buf))
    }

    pub fn options(&self) -> BitFlags<VolumeOption> {
        BitFlags::from_bits_truncate(self.options)
    }

    pub fn set_options(&mut self, options: BitFlags<VolumeOption>) {
        self.options = options.bits();
    }

    pub fn has(&self, option: VolumeOption) -> bool {
        self.options().contains(option)
    }

    pub fn name(&self) -> Vec<u8> {
        pascal_get(&self.diskname)
    }

    pub fn set_name(&mut self, name: &[u8]) {
        pascal_put(&mut self.diskname, name);
    }

    fn bitmap_slots(&self) -> usize {
        if self.has(VolumeOption::SuperIndex) {
            ROOT_INDEX_SLOTS
        } else {
            SMALL_BITMAP_SLOTS
        }
    }

    /// 第`seqnr`个位图索引块的块号
    pub fn bitmap_index(&self, seqnr: usize) -> Option<u32> {
        (seqnr < self.bitmap_slots()).then(|| self.idx[seqnr])
    }

    pub fn set_bitmap_index(&mut self, seqnr: usize, blocknr: u32) {
        if seqnr < self.bitmap_slots() {
            self.idx[seqnr] = blocknr;
        }
    }

    /// 小卷模式下第`seqnr`个anode索引块的块号
    pub fn index_block(&self, seqnr: usize) -> Option<u32> {
        (!self.has(VolumeOption::SuperIndex) && seqnr < SMALL_INDEX_SLOTS)
            .then(|| self.idx[SMALL_BITMAP_SLOTS + seqnr])
    }

    pub fn set_index_block(&mut self, seqnr: usize, blocknr: u32) {
        if !self.has(VolumeOption::SuperIndex) && seqnr < SMALL_INDEX_SLOTS {
            self.idx[SMALL_BITMAP_SLOTS + seqnr] = blocknr;
        }
    }
}

impl Default for RootBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::volume::{ID_PFS_DISK, ROOT_SIZE};

    #[test]
    fn field_offsets() {
        let mut root = RootBlock::new();
        root.disktype = ID_PFS_DISK;
        root.set_options(VolumeOption::HardDisk | VolumeOption::SplittedAnodes);
        root.set_name(b"Work");
        root.reserved_blksize = 1024;
        root.extension = 0x1234;
        root.set_bitmap_index(0, 77);
        root.set_index_block(0, 99);

        let mut cur = Cursor::new(Vec::new());
        root.write(&mut cur).unwrap();
        let bytes = cur.into_inner();

        assert_eq!(&[0x50, 0x46, 0x53, 0x01], &bytes[0..4]);
        assert_eq!(3, bytes[7]);
        assert_eq!(4, bytes[20]);
        assert_eq!(b"Work", &bytes[21..25]);
        assert_eq!(&[0x04, 0x00], &bytes[64..66]);
        assert_eq!(&[0, 0, 0x12, 0x34], &bytes[88..92]);
        assert_eq!(77, u32::from_be_bytes(bytes[96..100].try_into().unwrap()));
        assert_eq!(99, u32::from_be_bytes(bytes[116..120].try_into().unwrap()));

        let back = RootBlock::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(root, back);
    }

    #[test]
    fn super_mode_slots() {
        let mut root = RootBlock::new();
        root.set_options(VolumeOption::SuperIndex.into());
        root.set_bitmap_index(50, 8);
        assert_eq!(Some(8), root.bitmap_index(50));
        assert_eq!(None, root.index_block(0));
    }

    fn date() -> impl Strategy<Value = DateStamp> {
        (any::<u16>(), any::<u16>(), any::<u16>()).prop_map(|(d, m, t)| DateStamp::new(d, m, t))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn round_trip(
            counters in proptest::collection::vec(any::<u32>(), 8),
            options in any::<u32>(),
            creation in date(),
            name in proptest::collection::vec(any::<u8>(), 0..=31),
            bitmap_index in proptest::collection::vec(any::<u32>(), SMALL_BITMAP_SLOTS),
            index in proptest::collection::vec(any::<u32>(), 0..SMALL_INDEX_SLOTS),
        ) {
            let mut root = RootBlock::new();
            root.disktype = counters[0];
            root.datestamp = counters[1];
            root.reserved_free = counters[2];
            root.blocksfree = counters[3];
            root.alwaysfree = counters[4];
            root.roving_ptr = counters[5];
            root.disksize = counters[6];
            root.extension = counters[7];
            root.creation = creation;
            let small = options & !(VolumeOption::SuperIndex as u32);
            root.set_options(BitFlags::from_bits_truncate(small));
            root.set_name(&name);
            for (seqnr, &blocknr) in bitmap_index.iter().enumerate() {
                root.set_bitmap_index(seqnr, blocknr);
            }
            for (seqnr, &blocknr) in index.iter().enumerate() {
                root.set_index_block(seqnr, blocknr);
            }

            let mut buf = vec![0xAAu8; 1024];
            root.encode(&mut buf).unwrap();
            prop_assert!(buf[ROOT_SIZE..].iter().all(|&b| b == 0));
            let back = RootBlock::decode(&buf).unwrap();
            prop_assert_eq!(&name, &back.name());
            for (seqnr, &blocknr) in index.iter().enumerate() {
                prop_assert_eq!(Some(blocknr), back.index_block(seqnr));
            }
            prop_assert_eq!(root, back);
        }
    }
}
