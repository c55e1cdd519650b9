//! 空间分配
//!
//! 保留块由根簇中的保留区位图管理，数据块由位图块管理。
//! 释放的数据块先进入延迟释放表，提交时才回到位图，
//! 因此未提交前旧数据不会被覆盖。

use block_dev::BlockDevice;

use crate::cache::{Kind, SlotId};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::volume::{Anode, PostponedOp};

/// 释放链上数据块时如何处理anode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeMode {
    /// 一并释放anode（含链头）
    FreeAnodes,
    /// 释放多余的anode，链头保留
    KeepHead,
    /// anode全部保留，供回收站使用
    KeepChain,
}

impl<D: BlockDevice> Session<D> {
    /// 从游标处开始找空闲保留块，必要时提交以回收旧块
    pub(crate) fn alloc_reserved(&mut self) -> Result<u32> {
        if let Some(blocknr) = self.find_reserved() {
            return Ok(blocknr);
        }
        // 搬迁途中不能提交
        if !self.committing && self.relocating == 0 && !self.alloc.res_tobefreed.is_empty() {
            log::debug!("reserved area full, committing to reclaim old copies");
            self.update_disk()?;
            if let Some(blocknr) = self.find_reserved() {
                return Ok(blocknr);
            }
        }

        log::error!("reserved area exhausted");
        if self.committing {
            Err(Error::ReservedExhausted)
        } else {
            Err(Error::DiskFull)
        }
    }

    fn find_reserved(&mut self) -> Option<u32> {
        let total = self.layout.num_reserved();
        let roving = self.rext.reserved_roving * 32 + u32::from(self.rext.rovingbit);
        let start = if roving < total { roving } else { 0 };

        let index = self
            .rbitmap
            .find_free(start, total)
            .or_else(|| self.rbitmap.find_free(0, start))?;
        self.rbitmap.set_used(index);
        self.root.reserved_free = self.root.reserved_free.saturating_sub(1);
        self.root_dirty = true;

        // 游标随扩展块下次写出时保存
        let next = index + 1;
        self.rext.reserved_roving = next / 32;
        self.rext.rovingbit = (next % 32) as u16;
        Some(self.layout.reserved_blocknr(index))
    }

    pub(crate) fn bitmap_index_slot(&mut self, seqnr: u32) -> Result<SlotId> {
        let blocknr = self
            .root
            .bitmap_index(seqnr as usize)
            .filter(|&b| b != 0)
            .ok_or_else(|| Error::corrupt(0, format!("bitmap index {seqnr} missing")))?;
        self.load(Kind::BitmapIndex, seqnr, blocknr)
    }

    pub(crate) fn bitmap_slot(&mut self, seqnr: u32) -> Result<SlotId> {
        if let Some(slot) = self.cache.lookup(crate::cache::Key::Seq(Kind::Bitmap, seqnr)) {
            return Ok(slot);
        }
        let ipb = self.layout.index_per_block;
        let mi = self.bitmap_index_slot(seqnr / ipb)?;
        let blocknr = self.cache.index(mi).index[(seqnr % ipb) as usize];
        self.load(Kind::Bitmap, seqnr, blocknr)
    }

    /// 数据位图中的空闲位数
    pub(crate) fn bitmap_free(&mut self) -> Result<u32> {
        let bpb = self.layout.blocks_per_bitmap();
        let data = self.layout.data_blocks();
        let mut free = 0;
        for seqnr in 0..self.layout.bitmap_blocks() {
            let slot = self.bitmap_slot(seqnr)?;
            free += self.cache.bitmap(slot).count_free(0, (data - seqnr * bpb).min(bpb));
        }
        Ok(free)
    }

    /// 从`hint`（分区内块号）起找一个空闲数据块，到末尾后回绕
    fn find_free_data(&mut self, hint: u32) -> Result<Option<u32>> {
        let data = self.layout.data_blocks();
        if data == 0 {
            return Ok(None);
        }
        let start = hint
            .checked_sub(self.layout.bitmap_start())
            .filter(|&bit| bit < data)
            .unwrap_or(self.root.roving_ptr % data);

        let found = match self.scan_bitmap(start, data)? {
            Some(bit) => Some(bit),
            None => self.scan_bitmap(0, start)?,
        };
        Ok(found.map(|bit| bit + self.layout.bitmap_start()))
    }

    fn scan_bitmap(&mut self, from: u32, to: u32) -> Result<Option<u32>> {
        let bpb = self.layout.blocks_per_bitmap();
        let mut bit = from;
        while bit < to {
            let seqnr = bit / bpb;
            let base = seqnr * bpb;
            let end = (base + bpb).min(to);
            let slot = self.bitmap_slot(seqnr)?;
            if let Some(found) = self.cache.bitmap(slot).find_free(bit - base, end - base) {
                return Ok(Some(base + found));
            }
            bit = end;
        }
        Ok(None)
    }

    /// 从`start`起占用至多`max`个连续空闲块，返回实际占用数
    fn take_run(&mut self, start: u32, max: u32) -> Result<u32> {
        let bpb = self.layout.blocks_per_bitmap();
        let data = self.layout.data_blocks();
        let mut bit = start - self.layout.bitmap_start();
        let mut taken = 0;

        while taken < max && bit < data {
            let seqnr = bit / bpb;
            let base = seqnr * bpb;
            let slot = match self.bitmap_slot(seqnr).and_then(|s| self.make_dirty(s)) {
                Ok(slot) => slot,
                // 已占用的部分照常返回，错误留给下一轮
                Err(e) if taken > 0 && !e.is_fatal() => {
                    log::debug!("run at {start} stops after {taken} blocks: {e}");
                    break;
                }
                Err(e) => {
                    self.alloc.clean_free = self.alloc.clean_free.saturating_sub(taken);
                    return Err(e);
                }
            };

            let bitmap = self.cache.bitmap_mut(slot);
            let mut blocked = false;
            while taken < max && bit < data && bit < base + bpb {
                if !bitmap.set_used(bit - base) {
                    blocked = true;
                    break;
                }
                taken += 1;
                bit += 1;
            }
            self.cache.unlock(slot);
            if blocked {
                break;
            }
        }

        if taken > self.alloc.clean_free {
            log::error!(
                "free counter {} below {taken} blocks just taken",
                self.alloc.clean_free
            );
        }
        self.alloc.clean_free = self.alloc.clean_free.saturating_sub(taken);
        Ok(taken)
    }

    /// 位图中把一个数据块置为空闲，重复释放被忽略
    pub(crate) fn release_data_block(&mut self, blocknr: u32) -> Result<()> {
        let bpb = self.layout.blocks_per_bitmap();
        let Some(bit) = blocknr
            .checked_sub(self.layout.bitmap_start())
            .filter(|&bit| bit < self.layout.data_blocks())
        else {
            log::warn!("ignoring release of non-data block {blocknr}");
            return Ok(());
        };

        let slot = self.bitmap_slot(bit / bpb)?;
        if self.cache.bitmap(slot).is_free(bit % bpb) {
            log::debug!("block {blocknr} already free");
            return Ok(());
        }
        let slot = self.make_dirty(slot)?;
        if self.cache.bitmap_mut(slot).set_free(bit % bpb) {
            self.alloc.clean_free += 1;
        }
        self.cache.unlock(slot);
        Ok(())
    }

    /// 为`head`开头的链追加`count`个数据块。
    /// 要么全部分配成功，要么链恢复原长并返回`DiskFull`。
    pub(crate) fn allocate_data(&mut self, head: u32, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if self.alloc.clean_free < self.alloc.always_free.saturating_add(count) {
            log::debug!(
                "cannot allocate {count} blocks: {} free, {} kept",
                self.alloc.clean_free,
                self.alloc.always_free
            );
            return Err(Error::DiskFull);
        }

        let chain = self.collect_chain(head)?;
        let old_blocks: u32 = chain
            .iter()
            .filter(|(_, a)| !a.is_uninit())
            .map(|(_, a)| a.clustersize)
            .sum();
        let &(tail_nr, tail) = chain
            .last()
            .ok_or_else(|| Error::corrupt(0, format!("anode {head} is free")))?;

        if let Err(e) = self.extend_chain(tail_nr, tail, count) {
            if e.is_fatal() {
                return Err(e);
            }
            log::warn!("allocating {count} blocks for anode {head} failed: {e}, rolling back");
            self.free_blocks(head, old_blocks, FreeMode::KeepHead)?;
            return Err(Error::DiskFull);
        }
        Ok(())
    }

    fn extend_chain(&mut self, mut tail_nr: u32, mut tail: Anode, count: u32) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            let hint = if tail.is_uninit() || tail.clustersize == 0 {
                self.layout.bitmap_start() + self.root.roving_ptr
            } else {
                tail.blocknr + tail.clustersize
            };
            let start = self.find_free_data(hint)?.ok_or(Error::DiskFull)?;

            let contiguous = !tail.is_uninit() && tail.blocknr + tail.clustersize == start;
            let new_nr = if tail.is_uninit() || contiguous {
                None
            } else {
                // 先取anode，失败时还没有占用任何块
                Some(self.alloc_anode(tail_nr)?)
            };

            let got = match self.take_run(start, remaining) {
                Ok(0) => Err(Error::corrupt(start, "free block vanished")),
                other => other,
            };
            let got = match got {
                Ok(got) => got,
                Err(e) => {
                    if let Some(nr) = new_nr {
                        self.free_anode(nr)?;
                    }
                    return Err(e);
                }
            };

            match new_nr {
                None if tail.is_uninit() => {
                    tail = Anode {
                        clustersize: got,
                        blocknr: start,
                        next: 0,
                    };
                    self.save_anode(tail_nr, tail)?;
                }
                None => {
                    tail.clustersize += got;
                    self.save_anode(tail_nr, tail)?;
                }
                Some(nr) => {
                    let node = Anode {
                        clustersize: got,
                        blocknr: start,
                        next: 0,
                    };
                    self.save_anode(nr, node)?;
                    tail.next = nr;
                    self.save_anode(tail_nr, tail)?;
                    tail_nr = nr;
                    tail = node;
                }
            }

            remaining -= got;
            self.root.roving_ptr = start + got - self.layout.bitmap_start();
        }
        Ok(())
    }

    /// 区段加入延迟释放表，与上一段相接时合并
    fn push_tbf(&mut self, blocknr: u32, count: u32) {
        if count == 0 {
            return;
        }
        if let Some((start, len)) = self.alloc.tbf.last_mut() {
            if *start + *len == blocknr {
                *len += count;
                return;
            }
        }
        self.alloc.tbf.push((blocknr, count));
    }

    /// 表满时先提交。必须在修改anode之前调用。
    fn ensure_tbf_room(&mut self) -> Result<()> {
        if self.alloc.tbf.len() >= self.alloc.tbf_capacity {
            log::debug!("deferred free table full, forcing commit");
            self.update_disk()?;
        }
        Ok(())
    }

    /// 数据块是否在延迟释放表中
    pub(crate) fn is_pending_free(&self, blocknr: u32) -> bool {
        self.alloc
            .tbf
            .iter()
            .any(|&(start, len)| blocknr >= start && blocknr - start < len)
    }

    fn push_extent(&mut self, anode: Anode, skip: u32) {
        if !anode.is_uninit() && anode.clustersize > skip {
            self.push_tbf(anode.blocknr + skip, anode.clustersize - skip);
        }
    }

    /// 释放链上第`keep`块之后的全部数据块，带挂起记录
    pub(crate) fn free_blocks(&mut self, head: u32, keep: u32, mode: FreeMode) -> Result<()> {
        let (operation_id, argument3) = match mode {
            FreeMode::FreeAnodes => (PostponedOp::FREEBLOCKS_FREE, 0),
            FreeMode::KeepHead => (PostponedOp::FREEBLOCKS_KEEP, 0),
            FreeMode::KeepChain => (PostponedOp::FREEBLOCKS_KEEP, 1),
        };
        self.postpone(PostponedOp {
            operation_id,
            argument1: head,
            argument2: keep,
            argument3,
        })?;
        self.free_blocks_inner(head, keep, mode)?;
        self.postpone(PostponedOp::default())
    }

    /// 从链尾向前处理，中途被迫提交时磁盘上始终是一条完整的短链，
    /// 重做时只会把仍被占用的块再释放一次。
    pub(crate) fn free_blocks_inner(&mut self, head: u32, keep: u32, mode: FreeMode) -> Result<()> {
        let chain = self.collect_chain(head)?;
        if chain.is_empty() {
            return Ok(());
        }

        let (cut, keep_in_cut) = if mode == FreeMode::FreeAnodes && keep == 0 {
            (0, 0)
        } else {
            let mut acc = 0u32;
            let mut found = (chain.len(), 0);
            for (i, (_, anode)) in chain.iter().enumerate() {
                let size = if anode.is_uninit() { 0 } else { anode.clustersize };
                if acc + size > keep {
                    found = (i, keep - acc);
                    break;
                }
                acc += size;
            }
            found
        };
        if cut == chain.len() {
            return Ok(());
        }
        log::debug!(
            "free anode {head} from block {keep} ({mode:?}), {} extents",
            chain.len() - cut
        );

        for i in (cut + 1..chain.len()).rev() {
            self.ensure_tbf_room()?;
            let (nr, anode) = chain[i];
            if mode != FreeMode::KeepChain {
                let (prev_nr, mut prev) = chain[i - 1];
                prev.next = 0;
                self.save_anode(prev_nr, prev)?;
                self.free_anode(nr)?;
            }
            self.push_extent(anode, 0);
        }

        self.ensure_tbf_room()?;
        let (nr, anode) = chain[cut];
        if mode != FreeMode::KeepChain {
            if keep_in_cut > 0 {
                let truncated = Anode {
                    clustersize: keep_in_cut,
                    next: 0,
                    ..anode
                };
                self.save_anode(nr, truncated)?;
            } else if cut > 0 {
                let (prev_nr, mut prev) = chain[cut - 1];
                prev.next = 0;
                self.save_anode(prev_nr, prev)?;
                self.free_anode(nr)?;
            } else if mode == FreeMode::FreeAnodes {
                self.free_anode(nr)?;
            } else {
                self.save_anode(nr, Anode::UNINIT)?;
            }
        }
        self.push_extent(anode, keep_in_cut);
        Ok(())
    }

    /// 释放一整条anode链（不动数据块），带挂起记录
    pub(crate) fn discard_anode_chain(&mut self, head: u32) -> Result<()> {
        self.postpone(PostponedOp {
            operation_id: PostponedOp::FREEANODECHAIN,
            argument1: head,
            argument2: 0,
            argument3: 0,
        })?;
        self.free_anode_chain(head)?;
        self.postpone(PostponedOp::default())
    }
}

#[cfg(test)]
impl<D: BlockDevice> Session<D> {
    /// 把保留区占满，只留`spare`块，返回被占掉的位
    pub(crate) fn squeeze_reserved(&mut self, spare: u32) -> Vec<u32> {
        let mut left = spare;
        let mut taken = Vec::new();
        for index in 0..self.layout.num_reserved() {
            if !self.rbitmap.is_free(index) {
                continue;
            }
            if left > 0 {
                left -= 1;
            } else {
                self.rbitmap.set_used(index);
                taken.push(index);
            }
        }
        self.root.reserved_free = spare - left;
        self.root_dirty = true;
        taken
    }

    pub(crate) fn unsqueeze_reserved(&mut self, taken: &[u32]) {
        for &index in taken {
            if self.rbitmap.set_free(index) {
                self.root.reserved_free += 1;
            }
        }
        self.root_dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use block_dev::BlockFile;

    use super::FreeMode;
    use crate::volume::PostponedOp;
    use crate::{FormatOptions, Geometry, Session, format};

    type Mem = BlockFile<Cursor<Vec<u8>>>;

    fn fresh() -> (Session<Mem>, Geometry) {
        let geo = Geometry::from_size(4 << 20, 512);
        let dev = BlockFile::new(Cursor::new(vec![0u8; 4 << 20]), 512).unwrap();
        let options = FormatOptions {
            deldir_blocks: 0,
            ..FormatOptions::default()
        };
        let dev = format(dev, &geo, "Alloc", &options).unwrap();
        (Session::mount(dev, &geo).unwrap(), geo)
    }

    /// 交替写两个文件，得到每块一个区段的链
    fn fragmented(s: &mut Session<Mem>) -> u32 {
        let a = s.create_file("a").unwrap();
        let b = s.create_file("b").unwrap();
        for _ in 0..12 {
            s.write(a, &[1u8; 512]).unwrap();
            s.write(b, &[2u8; 512]).unwrap();
        }
        s.close(a).unwrap();
        s.close(b).unwrap();
        s.flush().unwrap();
        s.examine("a").unwrap().anode
    }

    #[test]
    fn interrupted_free_resumes_to_same_count() {
        let cases = [
            (FreeMode::FreeAnodes, 0, PostponedOp::FREEBLOCKS_FREE, 0, 12),
            (FreeMode::KeepHead, 3, PostponedOp::FREEBLOCKS_KEEP, 0, 9),
        ];
        for (mode, keep, op, arg3, freed) in cases {
            for capacity in 1..=4 {
                let (mut s, geo) = fresh();
                let head = fragmented(&mut s);
                let free = s.info().blocks_free;

                s.alloc.tbf_capacity = capacity;
                s.guard(|s| {
                    s.postpone(PostponedOp {
                        operation_id: op,
                        argument1: head,
                        argument2: keep,
                        argument3: arg3,
                    })?;
                    s.update_disk()?;
                    s.free_blocks_inner(head, keep, mode)
                })
                .unwrap();

                // 在最后一次提交之后断电
                let image = s.get_ref().get_ref().get_ref().clone();
                let dev = BlockFile::new(Cursor::new(image), 512).unwrap();
                let resumed = Session::mount(dev, &geo).unwrap();
                assert!(!resumed.rext.tobedone.is_pending());
                assert_eq!(free + freed, resumed.info().blocks_free, "{mode:?} cap {capacity}");

                // 不中断的同一操作
                s.guard(|s| s.postpone(PostponedOp::default())).unwrap();
                s.flush().unwrap();
                assert_eq!(free + freed, s.info().blocks_free);
            }
        }
    }

    #[test]
    fn failed_allocation_leaves_chain_unchanged() {
        let (mut s, _) = fresh();
        let head = fragmented(&mut s);
        let free = s.info().blocks_free;

        let err = s.guard(|s| s.allocate_data(head, free)).unwrap_err();
        assert!(matches!(err, crate::Error::DiskFull));
        assert_eq!(free, s.info().blocks_free);

        let blocks: u32 = s
            .guard(|s| s.collect_chain(head))
            .unwrap()
            .iter()
            .map(|(_, a)| a.clustersize)
            .sum();
        assert_eq!(12, blocks);
    }

    #[test]
    fn allocation_failing_midway_rolls_back() {
        let (mut s, _) = fresh();
        let head = fragmented(&mut s);
        // b的块成为a的链之间的空洞
        s.delete("b").unwrap();
        s.flush().unwrap();

        let chain = s.guard(|s| s.collect_chain(head)).unwrap();
        let real = s.guard(|s| s.bitmap_free()).unwrap();
        assert_eq!(real, s.alloc.clean_free);

        // 计数多报几块：请求通过预检，扩展到中途才找不到空闲块
        s.alloc.clean_free = real + s.alloc.always_free + 3;
        let counted = s.alloc.clean_free;
        let err = s.guard(|s| s.allocate_data(head, real + 3)).unwrap_err();
        assert!(matches!(err, crate::Error::DiskFull));
        assert_eq!(chain, s.guard(|s| s.collect_chain(head)).unwrap());

        s.flush().unwrap();
        assert_eq!(counted, s.alloc.clean_free);
        assert_eq!(real, s.guard(|s| s.bitmap_free()).unwrap());
    }

    #[test]
    fn low_free_counter_saturates() {
        let (mut s, _) = fresh();
        s.alloc.clean_free = 1;
        let got = s
            .guard(|s| {
                let start = s.find_free_data(0)?.ok_or(crate::Error::DiskFull)?;
                s.take_run(start, 4)
            })
            .unwrap();
        assert_eq!(4, got);
        assert_eq!(0, s.alloc.clean_free);
    }
}
