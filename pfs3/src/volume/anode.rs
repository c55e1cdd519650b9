use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, binrw};

use super::{ANODE_HEADER_SIZE, ANODE_SIZE, INDEX_HEADER_SIZE, anodes};

/// 区段记录：从`blocknr`起连续`clustersize`块，`next`指向链上下一个anode。
#[binrw]
#[brw(big)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Anode {
    pub clustersize: u32,
    pub blocknr: u32,
    pub next: u32,
}

impl Anode {
    /// 已分配但未绑定区段的anode
    pub const UNINIT: Self = Self {
        clustersize: 0,
        blocknr: anodes::UNINIT,
        next: 0,
    };

    /// 三个字段全为零才算空闲
    pub fn is_free(&self) -> bool {
        self.clustersize == 0 && self.blocknr == 0 && self.next == 0
    }

    pub fn is_uninit(&self) -> bool {
        self.blocknr == anodes::UNINIT
    }
}

/// anode块
#[binrw]
#[brw(big, magic = 0x4142u16)]
#[br(import(count: usize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnodeBlock {
    _not_used: u16,
    pub datestamp: u32,
    pub seqnr: u32,
    _not_used_2: u32,
    #[br(count = count)]
    pub nodes: Vec<Anode>,
}

impl AnodeBlock {
    pub fn new(seqnr: u32, rbs: usize) -> Self {
        Self {
            _not_used: 0,
            datestamp: 0,
            seqnr,
            _not_used_2: 0,
            nodes: vec![Anode::default(); (rbs - ANODE_HEADER_SIZE) / ANODE_SIZE],
        }
    }

    pub fn decode(buf: &[u8]) -> BinResult<Self> {
        let count = buf.len().saturating_sub(ANODE_HEADER_SIZE) / ANODE_SIZE;
        Self::read_args(&mut Cursor::new(buf), (count,))
    }

    pub fn encode(&self, buf: &mut [u8]) -> BinResult<()> {
        buf.fill(0);
        self.write(&mut Cursor::new(buf))
    }
}

/// 索引块。anode索引块（IB）、位图索引块（MI）与超级索引块（SB）共用此布局，
/// 只有块标识不同。
#[binrw]
#[brw(big)]
#[br(import(count: usize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub id: u16,
    _not_used: u16,
    pub datestamp: u32,
    pub seqnr: u32,
    #[br(count = count)]
    pub index: Vec<u32>,
}

impl IndexBlock {
    pub fn new(id: u16, seqnr: u32, rbs: usize) -> Self {
        Self {
            id,
            _not_used: 0,
            datestamp: 0,
            seqnr,
            index: vec![0; (rbs - INDEX_HEADER_SIZE) / 4],
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::volume::{BMIBLKID, SBLKID};
    use crate::volume::{ABLKID, IBLKID};

    #[test]
    fn anode_block_layout() {
        let mut ab = AnodeBlock::new(3, 1024);
        assert_eq!(84, ab.nodes.len());
        ab.nodes[0] = Anode::UNINIT;
        ab.nodes[83] = Anode {
            clustersize: 7,
            blocknr: 600,
            next: 0x0003_0001,
        };

        let mut buf = vec![0u8; 1024];
        ab.encode(&mut buf).unwrap();
        assert_eq!(ABLKID.to_be_bytes(), buf[0..2]);
        assert_eq!(3, u32::from_be_bytes(buf[8..12].try_into().unwrap()));
        assert_eq!(&[0xFF; 4], &buf[20..24]);
        let last = ANODE_HEADER_SIZE + 83 * ANODE_SIZE;
        assert_eq!(7, u32::from_be_bytes(buf[last..last + 4].try_into().unwrap()));

        assert_eq!(ab, AnodeBlock::decode(&buf).unwrap());
    }

    #[test]
    fn wrong_id_rejected() {
        let ib = IndexBlock::new(IBLKID, 0, 1024);
        let mut buf = vec![0u8; 1024];
        ib.encode(&mut buf).unwrap();
        assert!(AnodeBlock::decode(&buf).is_err());
        assert_eq!(253, IndexBlock::decode(&buf).unwrap().index.len());
    }

    fn anode() -> impl Strategy<Value = Anode> {
        (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(clustersize, blocknr, next)| Anode {
            clustersize,
            blocknr,
            next,
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn anode_block_round_trip(
            seqnr in any::<u32>(),
            datestamp in any::<u32>(),
            nodes in proptest::collection::vec(anode(), 84),
        ) {
            let mut ab = AnodeBlock::new(seqnr, 1024);
            ab.datestamp = datestamp;
            ab.nodes = nodes;
            let mut buf = vec![0xEEu8; 1024];
            ab.encode(&mut buf).unwrap();
            prop_assert_eq!(ab, AnodeBlock::decode(&buf).unwrap());
        }

        #[test]
        fn index_block_round_trip(
            id in prop::sample::select(vec![IBLKID, BMIBLKID, SBLKID]),
            seqnr in any::<u32>(),
            index in proptest::collection::vec(any::<u32>(), 253),
        ) {
            let mut ib = IndexBlock::new(id, seqnr, 1024);
            ib.index = index;
            let mut buf = vec![0u8; 1024];
            ib.encode(&mut buf).unwrap();
            let back = IndexBlock::decode(&buf).unwrap();
            prop_assert_eq!(id, back.id);
            prop_assert_eq!(ib, back);
        }
    }
}
