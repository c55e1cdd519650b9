//! 写时复制与提交
//!
//! 结构块第一次被修改时搬到新分配的保留块上，旧块在提交后才归还，
//! 因此提交中途断电时磁盘上仍是上一次完整的状态。
//! 根块最后写入，它落盘即代表本次提交完成。

use block_dev::BlockDevice;

use crate::allocation::FreeMode;
use crate::cache::{Kind, SlotId};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::volume::PostponedOp;

/// 一次搬迁最多新占的保留块数：目录块、anode块、索引块、超级索引块、根块扩展
const RELOCATION_DEPTH: u32 = 5;

impl<D: BlockDevice> Session<D> {
    /// 标记为脏并上锁。首次变脏时分配新块号并修正父结构中的指针。
    ///
    /// 整条父链搬迁期间不会提交：提交只发生在最外层搬迁开始前，
    /// 某一级分配失败时已搬迁的各级原样退回。
    pub(crate) fn make_dirty(&mut self, slot: SlotId) -> Result<SlotId> {
        self.cache.lock(slot);
        if self.cache.block(slot).dirty {
            return Ok(slot);
        }

        if self.relocating == 0
            && !self.committing
            && self.root.reserved_free < RELOCATION_DEPTH
            && !self.alloc.res_tobefreed.is_empty()
        {
            log::debug!("reserved area low, committing before relocation");
            self.update_disk()?;
        }

        self.relocating += 1;
        let result = self.relocate(slot);
        self.relocating -= 1;
        result.map(|()| slot)
    }

    fn relocate(&mut self, slot: SlotId) -> Result<()> {
        let new = self.alloc_reserved()?;
        let block = self.cache.block_mut(slot);
        let old = block.blocknr;
        block.oldblocknr = old;
        block.dirty = true;
        self.cache.relocate(slot, new);
        self.alloc.res_tobefreed.push(old);
        log::trace!("relocate {:?} {old} -> {new}", self.cache.block(slot).kind);

        if let Err(e) = self.patch_parent(slot, old, new) {
            self.undo_relocation(slot, old, new);
            return Err(e);
        }
        Ok(())
    }

    /// 父结构未能指向新块时退回旧块，块内容此时尚未改动
    fn undo_relocation(&mut self, slot: SlotId, old: u32, new: u32) {
        log::debug!("relocation {old} -> {new} undone");
        self.cache.relocate(slot, old);
        let block = self.cache.block_mut(slot);
        block.dirty = false;
        block.oldblocknr = 0;
        if let Some(i) = self.alloc.res_tobefreed.iter().rposition(|&b| b == old) {
            self.alloc.res_tobefreed.swap_remove(i);
        }
        if let Some(index) = self.layout.reserved_index(new) {
            if self.rbitmap.set_free(index) {
                self.root.reserved_free += 1;
            }
        }
    }

    fn patch_parent(&mut self, slot: SlotId, old: u32, new: u32) -> Result<()> {
        let block = self.cache.block(slot);
        let (kind, seqnr) = (block.kind, block.seqnr);
        let ipb = self.layout.index_per_block;

        match kind {
            Kind::Dir => {
                let dir = self.cache.dir(slot).anodenr;
                let chain = self.collect_chain(dir)?;
                let (nr, mut anode) = chain
                    .into_iter()
                    .find(|(_, a)| a.blocknr == old)
                    .ok_or_else(|| Error::corrupt(old, format!("not in chain of dir {dir}")))?;
                anode.blocknr = new;
                self.save_anode(nr, anode)?;
                self.locks.moved_block(old, new);
            }
            Kind::Anode => {
                let idx = self.index_slot(seqnr / ipb, false)?;
                let idx = self.make_dirty(idx)?;
                self.cache.index_mut(idx).index[(seqnr % ipb) as usize] = new;
            }
            Kind::Index if self.layout.super_index => {
                let sb = self.super_slot(seqnr / ipb, false)?;
                let sb = self.make_dirty(sb)?;
                self.cache.index_mut(sb).index[(seqnr % ipb) as usize] = new;
            }
            Kind::Index => {
                self.root.set_index_block(seqnr as usize, new);
                self.root_dirty = true;
            }
            Kind::Super => {
                self.rext.superindex[seqnr as usize] = new;
                self.mark_rext_dirty()?;
            }
            Kind::Deldir => {
                self.rext.deldir[seqnr as usize] = new;
                self.mark_rext_dirty()?;
            }
            Kind::Bitmap => {
                let mi = self.bitmap_index_slot(seqnr / ipb)?;
                let mi = self.make_dirty(mi)?;
                self.cache.index_mut(mi).index[(seqnr % ipb) as usize] = new;
            }
            Kind::BitmapIndex => {
                self.root.set_bitmap_index(seqnr as usize, new);
                self.root_dirty = true;
            }
        }
        Ok(())
    }

    /// 根块扩展同样写时复制
    pub(crate) fn mark_rext_dirty(&mut self) -> Result<()> {
        if self.rext_dirty {
            return Ok(());
        }
        let new = self.alloc_reserved()?;
        if self.root.extension != 0 {
            self.alloc.res_tobefreed.push(self.root.extension);
        }
        self.root.extension = new;
        self.rext_dirty = true;
        self.root_dirty = true;
        Ok(())
    }

    fn has_changes(&self) -> bool {
        self.root_dirty
            || self.rext_dirty
            || self.cache.is_dirty()
            || !self.alloc.res_tobefreed.is_empty()
    }

    /// 提交：处理延迟释放表，按类型顺序写出脏块，最后写根簇。
    /// 提交过程中再次请求提交会被忽略。
    pub(crate) fn update_disk(&mut self) -> Result<()> {
        if self.committing {
            return Ok(());
        }
        self.committing = true;
        let result = self.commit();
        self.committing = false;
        result
    }

    fn commit(&mut self) -> Result<()> {
        self.update_free_list()?;
        if !self.has_changes() {
            return Ok(());
        }

        self.root.datestamp = self.root.datestamp.wrapping_add(1);
        let mut written = 0;
        for kind in [Kind::Dir, Kind::Anode, Kind::Index, Kind::Super, Kind::Deldir] {
            written += self.write_dirty(kind)?;
        }
        if self.rext_dirty {
            self.write_rext()?;
            written += 1;
        }
        for kind in [Kind::Bitmap, Kind::BitmapIndex] {
            written += self.write_dirty(kind)?;
        }

        self.root.blocksfree = self.alloc.clean_free;
        self.root.alwaysfree = self.alloc.always_free;
        self.write_root_cluster()?;
        self.dev.flush()?;
        self.root_dirty = false;

        // 旧块现在才可以复用
        let released = std::mem::take(&mut self.alloc.res_tobefreed);
        for blocknr in &released {
            match self.layout.reserved_index(*blocknr) {
                Some(index) if self.rbitmap.set_free(index) => self.root.reserved_free += 1,
                Some(_) => log::warn!("reserved block {blocknr} released twice"),
                None => log::warn!("released block {blocknr} is not a reserved block"),
            }
        }
        // 归还的块要在下次提交时记入保留区位图
        self.root_dirty = !released.is_empty();

        log::debug!(
            "commit {}: {written} blocks, {} reserved released, {} free",
            self.root.datestamp,
            released.len(),
            self.alloc.clean_free
        );
        Ok(())
    }

    fn write_dirty(&mut self, kind: Kind) -> Result<usize> {
        let slots = self.cache.dirty_slots(kind);
        for &slot in &slots {
            self.write_slot(slot)?;
        }
        Ok(slots.len())
    }

    fn write_rext(&mut self) -> Result<()> {
        self.rext.datestamp = self.root.datestamp;
        let mut buf = vec![0u8; self.layout.rbs];
        self.rext
            .encode(&mut buf)
            .map_err(|e| Error::corrupt(self.root.extension, e.to_string()))?;
        self.write_reserved(self.root.extension, &buf)?;
        self.rext_dirty = false;
        Ok(())
    }

    /// 把延迟释放表中的块在位图中置为空闲
    fn update_free_list(&mut self) -> Result<()> {
        let runs = std::mem::take(&mut self.alloc.tbf);
        for (start, count) in runs {
            for blocknr in start..start + count {
                self.release_data_block(blocknr)?;
            }
        }
        Ok(())
    }

    /// 写入挂起记录，在多步释放开始前调用
    pub(crate) fn postpone(&mut self, op: PostponedOp) -> Result<()> {
        self.rext.tobedone = op;
        self.mark_rext_dirty()
    }

    /// 重做上次会话中未完成的释放操作
    pub(crate) fn resume_postponed(&mut self) -> Result<()> {
        let op = self.rext.tobedone;
        if !op.is_pending() {
            return Ok(());
        }
        log::warn!("resuming postponed operation {op:?}");

        let result = match (op.operation_id, op.argument3) {
            (PostponedOp::FREEBLOCKS_FREE, _) => {
                self.free_blocks_inner(op.argument1, op.argument2, FreeMode::FreeAnodes)
            }
            (PostponedOp::FREEBLOCKS_KEEP, 0) => {
                self.free_blocks_inner(op.argument1, op.argument2, FreeMode::KeepHead)
            }
            (PostponedOp::FREEBLOCKS_KEEP, _) => {
                self.free_blocks_inner(op.argument1, op.argument2, FreeMode::KeepChain)
            }
            (PostponedOp::FREEANODECHAIN, _) => self.free_anode_chain(op.argument1),
            (id, _) => Err(Error::corrupt(
                self.root.extension,
                format!("unknown postponed operation {id}"),
            )),
        };
        result.map_err(|e| Error::Postponed(Box::new(e)))?;

        self.postpone(PostponedOp::default())?;
        self.update_disk()
    }
}
