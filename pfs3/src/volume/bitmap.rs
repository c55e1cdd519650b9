use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, binrw};

use super::INDEX_HEADER_SIZE;

/// 位图块，每位对应一个块，1表示空闲，长字内高位在前。
///
/// 保留区位图也用此布局，只是它横跨根簇中除根块外的全部保留块。
#[binrw]
#[brw(big, magic = 0x424Du16)]
#[br(import(count: usize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapBlock {
    _not_used: u16,
    pub datestamp: u32,
    pub seqnr: u32,
    #[br(count = count)]
    pub bitmap: Vec<u32>,
}

impl BitmapBlock {
    /// 全部置为空闲
    pub fn new(seqnr: u32, bytes: usize) -> Self {
        Self {
            _not_used: 0,
            datestamp: 0,
            seqnr,
            bitmap: vec![u32::MAX; (bytes - INDEX_HEADER_SIZE) / 4],
        }
    }

    pub fn decode(buf: &[u8]) -> BinResult<Self> {
        let count = buf.len().saturating_sub(INDEX_HEADER_SIZE) / 4;
        Self::read_args(&mut Cursor::new(buf), (count,))
    }

    pub fn encode(&self, buf: &mut [u8]) -> BinResult<()> {
        buf.fill(0);
        self.write(&mut Cursor::new(buf))
    }

    #[inline]
    fn locate(bit: u32) -> (usize, u32) {
        ((bit / 32) as usize, 0x8000_0000 >> (bit % 32))
    }

    pub fn is_free(&self, bit: u32) -> bool {
        let (long, mask) = Self::locate(bit);
        self.bitmap.get(long).is_some_and(|l| l & mask != 0)
    }

    /// 置为空闲，返回此位原先是否已分配
    pub fn set_free(&mut self, bit: u32) -> bool {
        let (long, mask) = Self::locate(bit);
        match self.bitmap.get_mut(long) {
            Some(l) if *l & mask == 0 => {
                *l |= mask;
                true
            }
            _ => false,
        }
    }

    /// 置为已分配，返回此位原先是否空闲
    pub fn set_used(&mut self, bit: u32) -> bool {
        let (long, mask) = Self::locate(bit);
        match self.bitmap.get_mut(long) {
            Some(l) if *l & mask != 0 => {
                *l &= !mask;
                true
            }
            _ => false,
        }
    }

    /// 从`start`起找第一个空闲位，不回绕
    pub fn find_free(&self, start: u32, end: u32) -> Option<u32> {
        let mut bit = start;
        while bit < end {
            let (long, _) = Self::locate(bit);
            let word = *self.bitmap.get(long)?;
            // 屏蔽掉长字内`bit`之前的位
            let masked = word & (u32::MAX >> (bit % 32));
            if masked != 0 {
                let found = long as u32 * 32 + masked.leading_zeros();
                return (found < end).then_some(found);
            }
            bit = (long as u32 + 1) * 32;
        }
        None
    }

    /// `[start, end)`内的空闲位数
    pub fn count_free(&self, start: u32, end: u32) -> u32 {
        (start..end).filter(|&bit| self.is_free(bit)).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bit_order() {
        let mut bm = BitmapBlock::new(0, 1024);
        assert_eq!(253, bm.bitmap.len());
        assert!(bm.set_used(0));
        assert!(!bm.set_used(0));
        assert_eq!(0x7FFF_FFFF, bm.bitmap[0]);
        assert!(bm.set_used(33));
        assert_eq!(0xBFFF_FFFF, bm.bitmap[1]);
        assert!(bm.set_free(0));
        assert!(!bm.set_free(0));
    }

    #[test]
    fn find() {
        let mut bm = BitmapBlock::new(1, 1024);
        for bit in 0..70 {
            bm.set_used(bit);
        }
        assert_eq!(Some(70), bm.find_free(0, 8096));
        assert_eq!(Some(100), bm.find_free(100, 8096));
        assert_eq!(None, bm.find_free(0, 70));
        assert_eq!(30, bm.count_free(70, 100));

        let mut buf = vec![0u8; 1024];
        bm.encode(&mut buf).unwrap();
        assert_eq!(b"BM", &buf[0..2]);
        assert_eq!(bm, BitmapBlock::decode(&buf).unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn round_trip_keeps_every_bit(
            seqnr in any::<u32>(),
            words in proptest::collection::vec(any::<u32>(), 253),
        ) {
            let mut bm = BitmapBlock::new(seqnr, 1024);
            bm.bitmap = words;
            let mut buf = vec![0u8; 1024];
            bm.encode(&mut buf).unwrap();
            let back = BitmapBlock::decode(&buf).unwrap();

            let ones: u32 = bm.bitmap.iter().map(|w| w.count_ones()).sum();
            prop_assert_eq!(ones, back.count_free(0, 253 * 32));
            prop_assert_eq!(bm, back);
        }
    }
}
