//! anode的查找与分配
//!
//! anode号经索引块定位到anode块：小卷时索引块指针在根块中，
//! 超级索引模式下多一层超级索引块，其指针在根块扩展中。

use block_dev::BlockDevice;

use crate::cache::{Key, Kind, Payload, SlotId};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::volume::{Anode, AnodeBlock, IBLKID, IndexBlock, SBLKID, SUPER_INDEX_SLOTS, anodes};

/// 文件中的一个区段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    pub anodenr: u32,
    pub anode: Anode,
    /// 区段第一块在文件中的块序号
    pub first: u64,
}

impl<D: BlockDevice> Session<D> {
    pub(crate) fn super_slot(&mut self, seqnr: u32, create: bool) -> Result<SlotId> {
        if let Some(slot) = self.cache.lookup(Key::Seq(Kind::Super, seqnr)) {
            return Ok(slot);
        }
        let blocknr = *self
            .rext
            .superindex
            .get(seqnr as usize)
            .ok_or(Error::DiskFull)?;
        if blocknr != 0 {
            return self.load(Kind::Super, seqnr, blocknr);
        }
        if !create {
            return Err(Error::corrupt(0, format!("super index {seqnr} missing")));
        }

        let block = IndexBlock::new(SBLKID, seqnr, self.layout.rbs);
        let slot = self.create(Kind::Super, seqnr, Payload::Index(block))?;
        self.rext.superindex[seqnr as usize] = self.cache.block(slot).blocknr;
        self.mark_rext_dirty()?;
        Ok(slot)
    }

    pub(crate) fn index_slot(&mut self, seqnr: u32, create: bool) -> Result<SlotId> {
        if let Some(slot) = self.cache.lookup(Key::Seq(Kind::Index, seqnr)) {
            return Ok(slot);
        }
        let ipb = self.layout.index_per_block;
        let blocknr = if self.layout.super_index {
            let sb = self.super_slot(seqnr / ipb, create)?;
            self.cache.index(sb).index[(seqnr % ipb) as usize]
        } else {
            self.root
                .index_block(seqnr as usize)
                .ok_or(Error::DiskFull)?
        };
        if blocknr != 0 {
            return self.load(Kind::Index, seqnr, blocknr);
        }
        if !create {
            return Err(Error::corrupt(0, format!("anode index {seqnr} missing")));
        }

        let block = IndexBlock::new(IBLKID, seqnr, self.layout.rbs);
        let slot = self.create(Kind::Index, seqnr, Payload::Index(block))?;
        let blocknr = self.cache.block(slot).blocknr;
        if self.layout.super_index {
            let sb = self.super_slot(seqnr / ipb, false)?;
            let sb = self.make_dirty(sb)?;
            self.cache.index_mut(sb).index[(seqnr % ipb) as usize] = blocknr;
        } else {
            self.root.set_index_block(seqnr as usize, blocknr);
            self.root_dirty = true;
        }
        Ok(slot)
    }

    fn anode_slot(&mut self, seqnr: u32, create: bool) -> Result<SlotId> {
        if let Some(slot) = self.cache.lookup(Key::Seq(Kind::Anode, seqnr)) {
            return Ok(slot);
        }
        let ipb = self.layout.index_per_block;
        let idx = self.index_slot(seqnr / ipb, create)?;
        let blocknr = self.cache.index(idx).index[(seqnr % ipb) as usize];
        if blocknr != 0 {
            return self.load(Kind::Anode, seqnr, blocknr);
        }
        if !create {
            return Err(Error::corrupt(0, format!("anode block {seqnr} missing")));
        }

        let block = AnodeBlock::new(seqnr, self.layout.rbs);
        let slot = self.create(Kind::Anode, seqnr, Payload::Anode(block))?;
        let blocknr = self.cache.block(slot).blocknr;
        // 建块时索引块可能已被淘汰，重新取
        let idx = self.index_slot(seqnr / ipb, false)?;
        let idx = self.make_dirty(idx)?;
        self.cache.index_mut(idx).index[(seqnr % ipb) as usize] = blocknr;
        Ok(slot)
    }

    pub(crate) fn get_anode(&mut self, anodenr: u32) -> Result<Anode> {
        let (seqnr, offset) = self.layout.split_anode(anodenr);
        let slot = self.anode_slot(seqnr, false)?;
        self.cache
            .anode(slot)
            .nodes
            .get(offset as usize)
            .copied()
            .ok_or_else(|| Error::corrupt(0, format!("anode {anodenr:#x} out of range")))
    }

    pub(crate) fn save_anode(&mut self, anodenr: u32, anode: Anode) -> Result<()> {
        let (seqnr, offset) = self.layout.split_anode(anodenr);
        let slot = self.anode_slot(seqnr, false)?;
        let slot = self.make_dirty(slot)?;
        let node = self
            .cache
            .anode_mut(slot)
            .nodes
            .get_mut(offset as usize)
            .ok_or_else(|| Error::corrupt(0, format!("anode {anodenr:#x} out of range")))?;
        *node = anode;
        Ok(())
    }

    /// 分配一个anode并置为UNINIT。
    /// 优先取`connect`所在块中其后的空槽，使同一条链聚在一起。
    pub(crate) fn alloc_anode(&mut self, connect: u32) -> Result<u32> {
        if connect != 0 {
            let (seqnr, offset) = self.layout.split_anode(connect);
            let slot = self.anode_slot(seqnr, false)?;
            let found = self
                .cache
                .anode(slot)
                .nodes
                .iter()
                .skip(offset as usize + 1)
                .position(Anode::is_free);
            if let Some(i) = found {
                return self.claim_anode(seqnr, offset + 1 + i as u32);
            }
        }

        for seqnr in 0..self.anode_hint.len() as u32 {
            if !self.anode_hint[seqnr as usize] {
                continue;
            }
            let slot = self.anode_slot(seqnr, false)?;
            match self.cache.anode(slot).nodes.iter().position(Anode::is_free) {
                Some(i) => return self.claim_anode(seqnr, i as u32),
                None => self.anode_hint[seqnr as usize] = false,
            }
        }

        let seqnr = self.anode_hint.len() as u32;
        if seqnr >= self.layout.max_anode_blocks() {
            log::error!("no room for anode block {seqnr}");
            return Err(Error::DiskFull);
        }
        self.anode_slot(seqnr, true)?;
        self.anode_hint.push(true);
        self.claim_anode(seqnr, 0)
    }

    fn claim_anode(&mut self, seqnr: u32, offset: u32) -> Result<u32> {
        let anodenr = self.layout.join_anode(seqnr, offset);
        self.save_anode(anodenr, Anode::UNINIT)?;
        log::trace!("alloc anode {anodenr:#x}");
        Ok(anodenr)
    }

    pub(crate) fn free_anode(&mut self, anodenr: u32) -> Result<()> {
        if anodenr < anodes::USERFIRST {
            log::warn!("refusing to free system anode {anodenr}");
            return Ok(());
        }
        self.save_anode(anodenr, Anode::default())?;
        let (seqnr, _) = self.layout.split_anode(anodenr);
        if let Some(hint) = self.anode_hint.get_mut(seqnr as usize) {
            *hint = true;
        }
        Ok(())
    }

    fn chain_limit(&self) -> usize {
        self.anode_hint.len() * self.layout.anodes_per_block as usize + 1
    }

    /// 沿`next`收集整条链。链头空闲时返回空表，遇到空闲anode视为链尾。
    pub(crate) fn collect_chain(&mut self, head: u32) -> Result<Vec<(u32, Anode)>> {
        let limit = self.chain_limit();
        let mut chain = Vec::new();
        let mut anodenr = head;
        loop {
            let anode = self.get_anode(anodenr)?;
            if anode.is_free() {
                if !chain.is_empty() {
                    log::warn!("anode chain {head:#x} ends at free anode {anodenr:#x}");
                }
                break;
            }
            chain.push((anodenr, anode));
            if anode.next == 0 {
                break;
            }
            if chain.len() > limit {
                return Err(Error::corrupt(0, format!("anode chain {head:#x} loops")));
            }
            anodenr = anode.next;
        }
        Ok(chain)
    }

    pub(crate) fn free_anode_chain(&mut self, head: u32) -> Result<()> {
        let chain = self.collect_chain(head)?;
        for &(anodenr, _) in chain.iter().rev() {
            self.free_anode(anodenr)?;
        }
        Ok(())
    }

    /// 找到包含文件第`index`块的区段。`from`为上次找到的区段位置，
    /// 目标不在其前面时从那里继续走。
    pub(crate) fn locate(
        &mut self,
        head: u32,
        from: Option<(u32, u64)>,
        index: u64,
    ) -> Result<Option<Extent>> {
        let (mut anodenr, mut first) = match from {
            Some((anodenr, first)) if first <= index => (anodenr, first),
            _ => (head, 0),
        };
        let limit = self.chain_limit();

        for _ in 0..limit {
            let anode = self.get_anode(anodenr)?;
            if anode.is_free() {
                return Ok(None);
            }
            let size = if anode.is_uninit() {
                0
            } else {
                u64::from(anode.clustersize)
            };
            if index < first + size {
                return Ok(Some(Extent {
                    anodenr,
                    anode,
                    first,
                }));
            }
            if anode.next == 0 {
                return Ok(None);
            }
            first += size;
            anodenr = anode.next;
        }
        Err(Error::corrupt(0, format!("anode chain {head:#x} loops")))
    }

    /// 挂载时统计已存在的anode块数
    pub(crate) fn count_anode_blocks(&mut self) -> Result<u32> {
        let ipb = self.layout.index_per_block;
        let mut index_blocks = Vec::new();
        if self.layout.super_index {
            for t in 0..SUPER_INDEX_SLOTS as u32 {
                if self.rext.superindex[t as usize] == 0 {
                    continue;
                }
                let sb = self.super_slot(t, false)?;
                index_blocks.extend(
                    self.cache
                        .index(sb)
                        .index
                        .iter()
                        .enumerate()
                        .filter(|&(_, &p)| p != 0)
                        .map(|(j, &p)| (t * ipb + j as u32, p)),
                );
            }
        } else {
            let mut k = 0;
            while let Some(blocknr) = self.root.index_block(k) {
                if blocknr != 0 {
                    index_blocks.push((k as u32, blocknr));
                }
                k += 1;
            }
        }

        let mut count = 0;
        for (seqnr, blocknr) in index_blocks {
            let slot = self.load(Kind::Index, seqnr, blocknr)?;
            if let Some(last) = self.cache.index(slot).index.iter().rposition(|&p| p != 0) {
                count = count.max(seqnr * ipb + last as u32 + 1);
            }
        }
        Ok(count)
    }
}
