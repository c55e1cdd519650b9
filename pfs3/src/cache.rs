//! 保留块缓存
//!
//! 固定数量的槽位，按LRU淘汰。目录块以块号为键，
//! 其余结构块以（类型，序号）为键，因为它们的块号在每次变脏时都会改变。
//!
//! 锁采用代数：槽的`used`等于当前代数即被锁住，
//! [`BlockCache::unlock_all`] 令代数加一，从而一次解开全部锁。

use std::collections::HashMap;

use binrw::BinResult;

use crate::error::{Error, Result};
use crate::volume::{AnodeBlock, BitmapBlock, DeldirBlock, DirBlock, IndexBlock};

pub(crate) type SlotId = usize;

/// 结构块的类型，声明顺序即提交时的写出顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Kind {
    Dir,
    Anode,
    Index,
    Super,
    Deldir,
    Bitmap,
    BitmapIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Key {
    Dir(u32),
    Seq(Kind, u32),
}

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Dir(DirBlock),
    Anode(AnodeBlock),
    Index(IndexBlock),
    Bitmap(BitmapBlock),
    Deldir(DeldirBlock),
}

impl Payload {
    /// 盖上本次提交的时间戳后编码成一个保留块
    pub fn encode(&mut self, datestamp: u32, rbs: usize) -> BinResult<Vec<u8>> {
        let mut buf = vec![0u8; rbs];
        match self {
            Self::Dir(b) => {
                b.datestamp = datestamp;
                b.encode(&mut buf)?;
            }
            Self::Anode(b) => {
                b.datestamp = datestamp;
                b.encode(&mut buf)?;
            }
            Self::Index(b) => {
                b.datestamp = datestamp;
                b.encode(&mut buf)?;
            }
            Self::Bitmap(b) => {
                b.datestamp = datestamp;
                b.encode(&mut buf)?;
            }
            Self::Deldir(b) => {
                b.datestamp = datestamp;
                b.encode(&mut buf)?;
            }
        }
        Ok(buf)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CachedBlock {
    pub blocknr: u32,
    /// 本轮提交前的块号，提交后释放
    pub oldblocknr: u32,
    pub kind: Kind,
    /// 目录块无序号
    pub seqnr: u32,
    pub dirty: bool,
    used: u32,
    stamp: u64,
    pub payload: Payload,
}

impl CachedBlock {
    pub fn new(kind: Kind, blocknr: u32, seqnr: u32, payload: Payload) -> Self {
        Self {
            blocknr,
            oldblocknr: 0,
            kind,
            seqnr,
            dirty: false,
            used: 0,
            stamp: 0,
            payload,
        }
    }

    pub fn key(&self) -> Key {
        match self.kind {
            Kind::Dir => Key::Dir(self.blocknr),
            kind => Key::Seq(kind, self.seqnr),
        }
    }
}

#[derive(Debug)]
pub(crate) struct BlockCache {
    slots: Vec<Option<CachedBlock>>,
    capacity: usize,
    index: HashMap<Key, SlotId>,
    lock_gen: u32,
    clock: u64,
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $get(&self, slot: SlotId) -> &$ty {
            match &self.block(slot).payload {
                Payload::$variant(b) => b,
                other => unreachable!("slot {slot} holds {other:?}"),
            }
        }

        pub fn $get_mut(&mut self, slot: SlotId) -> &mut $ty {
            match &mut self.block_mut(slot).payload {
                Payload::$variant(b) => b,
                other => unreachable!("slot {slot} holds {other:?}"),
            }
        }
    };
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            index: HashMap::new(),
            lock_gen: 1,
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn touch(&mut self, slot: SlotId) {
        self.clock += 1;
        if let Some(Some(block)) = self.slots.get_mut(slot) {
            block.stamp = self.clock;
        }
    }

    /// 命中时把块移到最近使用
    pub fn lookup(&mut self, key: Key) -> Option<SlotId> {
        let slot = *self.index.get(&key)?;
        log::trace!("cache hit {key:?}");
        self.touch(slot);
        Some(slot)
    }

    /// 取得一个空槽。槽满时淘汰最久未用且未上锁的块，
    /// 被淘汰的块交还调用者，脏块须由调用者写回。
    pub fn reserve(&mut self) -> Result<(SlotId, Option<CachedBlock>)> {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            return Ok((slot, None));
        }
        if self.slots.len() < self.capacity {
            self.slots.push(None);
            return Ok((self.slots.len() - 1, None));
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, b)| b.as_ref().map(|b| (slot, b)))
            .filter(|(_, b)| b.used != self.lock_gen)
            .min_by_key(|(_, b)| b.stamp)
            .map(|(slot, _)| slot)
            .ok_or_else(|| {
                log::error!("all {} cache slots are locked", self.capacity);
                Error::OutOfBuffers
            })?;

        let evicted = self.remove(victim);
        log::trace!(
            "evict slot {victim} {:?}",
            evicted.as_ref().map(CachedBlock::key)
        );
        Ok((victim, evicted))
    }

    pub fn install(&mut self, slot: SlotId, block: CachedBlock) {
        self.index.insert(block.key(), slot);
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(block);
        }
        self.touch(slot);
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<CachedBlock> {
        let block = self.slots.get_mut(slot)?.take()?;
        self.index.remove(&block.key());
        Some(block)
    }

    pub fn block(&self, slot: SlotId) -> &CachedBlock {
        match self.slots.get(slot) {
            Some(Some(block)) => block,
            _ => unreachable!("cache slot {slot} is empty"),
        }
    }

    pub fn block_mut(&mut self, slot: SlotId) -> &mut CachedBlock {
        match self.slots.get_mut(slot) {
            Some(Some(block)) => block,
            _ => unreachable!("cache slot {slot} is empty"),
        }
    }

    typed_access!(dir, dir_mut, Dir, DirBlock);
    typed_access!(anode, anode_mut, Anode, AnodeBlock);
    typed_access!(index, index_mut, Index, IndexBlock);
    typed_access!(bitmap, bitmap_mut, Bitmap, BitmapBlock);
    typed_access!(deldir, deldir_mut, Deldir, DeldirBlock);

    /// 块号改变后更新索引
    pub fn relocate(&mut self, slot: SlotId, blocknr: u32) {
        let old_key = self.block(slot).key();
        self.index.remove(&old_key);
        let block = self.block_mut(slot);
        block.blocknr = blocknr;
        let key = block.key();
        self.index.insert(key, slot);
    }

    pub fn lock(&mut self, slot: SlotId) {
        let lock_gen = self.lock_gen;
        self.block_mut(slot).used = lock_gen;
    }

    pub fn unlock(&mut self, slot: SlotId) {
        self.block_mut(slot).used = 0;
    }

    pub fn is_locked(&self, slot: SlotId) -> bool {
        self.block(slot).used == self.lock_gen
    }

    pub fn unlock_all(&mut self) {
        self.lock_gen = self.lock_gen.wrapping_add(1).max(1);
    }

    pub fn dirty_slots(&self, kind: Kind) -> Vec<SlotId> {
        let mut slots: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, b)| {
                b.as_ref()
                    .filter(|b| b.dirty && b.kind == kind)
                    .map(|b| (b.seqnr, b.blocknr, slot))
            })
            .collect();
        slots.sort_unstable();
        slots.into_iter().map(|(_, _, slot)| slot).collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.slots.iter().flatten().any(|b| b.dirty)
    }

    pub fn cached(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(seqnr: u32) -> CachedBlock {
        CachedBlock::new(
            Kind::Bitmap,
            100 + seqnr,
            seqnr,
            Payload::Bitmap(BitmapBlock::new(seqnr, 1024)),
        )
    }

    fn fill(cache: &mut BlockCache, seqnr: u32) -> Option<CachedBlock> {
        let (slot, victim) = cache.reserve().unwrap();
        cache.install(slot, bitmap(seqnr));
        victim
    }

    #[test]
    fn lru_eviction() {
        let mut cache = BlockCache::new(3);
        for seqnr in 0..3 {
            assert!(fill(&mut cache, seqnr).is_none());
        }
        // 0号最近被访问过，应淘汰1号
        cache.lookup(Key::Seq(Kind::Bitmap, 0)).unwrap();
        let victim = fill(&mut cache, 3).unwrap();
        assert_eq!(1, victim.seqnr);
        assert!(cache.lookup(Key::Seq(Kind::Bitmap, 1)).is_none());
        assert_eq!(3, cache.cached());
    }

    #[test]
    fn lock_generation() {
        let mut cache = BlockCache::new(2);
        fill(&mut cache, 0);
        fill(&mut cache, 1);
        let s0 = cache.lookup(Key::Seq(Kind::Bitmap, 0)).unwrap();
        let s1 = cache.lookup(Key::Seq(Kind::Bitmap, 1)).unwrap();
        cache.lock(s0);
        cache.lock(s1);
        assert!(matches!(cache.reserve(), Err(Error::OutOfBuffers)));

        cache.unlock_all();
        assert!(!cache.is_locked(s0));
        assert!(cache.reserve().is_ok());
    }

    #[test]
    fn dir_relocation_rekeys() {
        let mut cache = BlockCache::new(4);
        let (slot, _) = cache.reserve().unwrap();
        cache.install(
            slot,
            CachedBlock::new(Kind::Dir, 40, 0, Payload::Dir(DirBlock::new(5, 0, 1024))),
        );
        cache.relocate(slot, 42);
        assert!(cache.lookup(Key::Dir(40)).is_none());
        assert_eq!(Some(slot), cache.lookup(Key::Dir(42)));
        assert_eq!(5, cache.dir(slot).anodenr);
    }
}
