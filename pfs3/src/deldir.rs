//! 回收站
//!
//! 固定数量的槽位组成环，删除文件时按游标取槽，旧记录被覆盖。
//! 槽位是否有效不落盘：只要文件的区段中有块已被重新分配，记录即作废。

use block_dev::BlockDevice;

use crate::cache::{Key, Kind, Payload, SlotId};
use crate::date::DateStamp;
use crate::error::{Error, Result};
use crate::lock::{FileHandle, Lock, ObjectInfo, OpenFile};
use crate::path::{decode_name, names_equal};
use crate::session::Session;
use crate::volume::{DeldirBlock, DeldirEntry, DirEntry, MAX_DELDIR_BLOCKS, VolumeOption};

/// 回收站中的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedFile {
    pub slot: u32,
    /// 最多15个字符
    pub name: String,
    pub size: u64,
    /// 删除时间
    pub date: DateStamp,
}

impl<D: BlockDevice> Session<D> {
    pub(crate) fn deldir_capacity(&self) -> u32 {
        if self.root.has(VolumeOption::Deldir) {
            u32::from(self.rext.deldirsize) * self.layout.deldir_per_block
        } else {
            0
        }
    }

    fn deldir_block(&mut self, seqnr: u32) -> Result<SlotId> {
        if let Some(slot) = self.cache.lookup(Key::Seq(Kind::Deldir, seqnr)) {
            return Ok(slot);
        }
        let blocknr = self.rext.deldir[seqnr as usize];
        self.load(Kind::Deldir, seqnr, blocknr)
    }

    pub(crate) fn deldir_entry(&mut self, slot: u32) -> Result<DeldirEntry> {
        let dpb = self.layout.deldir_per_block;
        let block = self.deldir_block(slot / dpb)?;
        Ok(self.cache.deldir(block).entries[(slot % dpb) as usize].clone())
    }

    fn set_deldir_entry(&mut self, slot: u32, entry: DeldirEntry) -> Result<()> {
        let dpb = self.layout.deldir_per_block;
        let block = self.deldir_block(slot / dpb)?;
        let block = self.make_dirty(block)?;
        self.cache.deldir_mut(block).entries[(slot % dpb) as usize] = entry;
        Ok(())
    }

    /// 为被删除的文件取一个槽位，覆盖的旧记录的anode链随之释放。
    /// 没有可用槽位时返回`false`。
    pub(crate) fn deldir_store(&mut self, entry: &DirEntry) -> Result<bool> {
        let capacity = self.deldir_capacity();
        for _ in 0..capacity {
            let slot = u32::from(self.rext.deldirroving) % capacity;
            self.rext.deldirroving = ((slot + 1) % capacity) as u16;
            if self.locks.holds_deleted(slot) {
                continue;
            }

            let old = self.deldir_entry(slot)?;
            if !old.is_empty() {
                log::debug!("deldir slot {slot} recycled");
                self.discard_anode_chain(old.anodenr)?;
            }
            let record = DeldirEntry::new(entry.anode, entry.size(), DateStamp::now(), &entry.name);
            self.set_deldir_entry(slot, record)?;
            self.mark_rext_dirty()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn data_block_free(&mut self, blocknr: u32) -> Result<bool> {
        let bpb = self.layout.blocks_per_bitmap();
        let Some(bit) = blocknr
            .checked_sub(self.layout.bitmap_start())
            .filter(|&bit| bit < self.layout.data_blocks())
        else {
            return Ok(false);
        };
        let slot = self.bitmap_slot(bit / bpb)?;
        Ok(self.cache.bitmap(slot).is_free(bit % bpb))
    }

    /// 检查槽位，作废的记录被清除，其anode链被释放
    pub(crate) fn deldir_valid(&mut self, slot: u32) -> Result<Option<DeldirEntry>> {
        let entry = self.deldir_entry(slot)?;
        if entry.is_empty() {
            return Ok(None);
        }

        let chain = match self.collect_chain(entry.anodenr) {
            Ok(chain) => chain,
            Err(e) if e.kind() == crate::ErrorKind::Fatal => return Err(e),
            Err(_) => Vec::new(),
        };
        let blocks: u64 = chain
            .iter()
            .filter(|(_, a)| !a.is_uninit())
            .map(|(_, a)| u64::from(a.clustersize))
            .sum();
        let mut valid = !chain.is_empty() && blocks == self.layout.blocks_for(entry.size());

        'extents: for (_, anode) in chain.iter().filter(|(_, a)| !a.is_uninit()) {
            if !valid {
                break;
            }
            for blocknr in anode.blocknr..anode.blocknr + anode.clustersize {
                if !self.data_block_free(blocknr)? && !self.is_pending_free(blocknr) {
                    valid = false;
                    break 'extents;
                }
            }
        }
        if valid {
            return Ok(Some(entry));
        }

        log::warn!(
            "deldir slot {slot} ({}) was overwritten, clearing",
            decode_name(&entry.name())
        );
        self.set_deldir_entry(slot, DeldirEntry::default())?;
        if !chain.is_empty() {
            self.discard_anode_chain(entry.anodenr)?;
        }
        Ok(None)
    }

    /// 同名时取最近删除的一个
    pub(crate) fn find_deleted(&mut self, name: &[u8]) -> Result<Option<u32>> {
        let mut best: Option<(DateStamp, u32)> = None;
        for slot in 0..self.deldir_capacity() {
            if let Some(entry) = self.deldir_valid(slot)? {
                if names_equal(&entry.name(), name)
                    && best.is_none_or(|(date, _)| entry.creation >= date)
                {
                    best = Some((entry.creation, slot));
                }
            }
        }
        Ok(best.map(|(_, slot)| slot))
    }

    /// 列出回收站中仍可恢复的文件
    pub fn deleted_files(&mut self) -> Result<Vec<DeletedFile>> {
        self.guard(|s| {
            let mut files = Vec::new();
            for slot in 0..s.deldir_capacity() {
                if let Some(entry) = s.deldir_valid(slot)? {
                    files.push(DeletedFile {
                        slot,
                        name: decode_name(&entry.name()),
                        size: entry.size(),
                        date: entry.creation,
                    });
                }
            }
            Ok(files)
        })
    }

    /// 只读打开回收站中的文件
    pub fn open_deleted(&mut self, slot: u32) -> Result<FileHandle> {
        self.guard(|s| {
            if slot >= s.deldir_capacity() {
                return Err(Error::DeldirSlotInvalid);
            }
            s.open_deleted_slot(slot)
        })
    }

    pub(crate) fn open_deleted_slot(&mut self, slot: u32) -> Result<FileHandle> {
        let entry = self.deldir_valid(slot)?.ok_or(Error::DeldirSlotInvalid)?;
        let id = self.locks.insert(Lock {
            info: ObjectInfo::DelFile(slot),
            anode: entry.anodenr,
            dir: 0,
            file: Some(OpenFile {
                write: false,
                pos: 0,
                cursor: None,
            }),
        });
        Ok(FileHandle::from(id))
    }

    /// 调整回收站大小，0为关闭
    pub fn set_deldir(&mut self, blocks: u16) -> Result<()> {
        self.guard(|s| s.resize_deldir(blocks))
    }

    pub(crate) fn resize_deldir(&mut self, blocks: u16) -> Result<()> {
        if usize::from(blocks) > MAX_DELDIR_BLOCKS {
            log::warn!("deldir limited to {MAX_DELDIR_BLOCKS} blocks");
        }
        let blocks = blocks.min(MAX_DELDIR_BLOCKS as u16);
        let old = if self.root.has(VolumeOption::Deldir) {
            self.rext.deldirsize
        } else {
            0
        };
        if blocks == old {
            return Ok(());
        }
        let dpb = self.layout.deldir_per_block;

        if blocks < old {
            let dropped = u32::from(blocks) * dpb..u32::from(old) * dpb;
            if dropped.clone().any(|slot| self.locks.holds_deleted(slot)) {
                return Err(Error::InUse);
            }
            for slot in dropped {
                let entry = self.deldir_entry(slot)?;
                if !entry.is_empty() {
                    self.discard_anode_chain(entry.anodenr)?;
                }
            }
            for seqnr in u32::from(blocks)..u32::from(old) {
                if let Some(slot) = self.cache.lookup(Key::Seq(Kind::Deldir, seqnr)) {
                    self.cache.remove(slot);
                }
                self.alloc
                    .res_tobefreed
                    .push(self.rext.deldir[seqnr as usize]);
                self.rext.deldir[seqnr as usize] = 0;
            }
        } else {
            for seqnr in u32::from(old)..u32::from(blocks) {
                let mut block = DeldirBlock::new(seqnr, self.layout.rbs);
                block.creation = DateStamp::now();
                block.protection = self.rext.dd_protection;
                let slot = self.create(Kind::Deldir, seqnr, Payload::Deldir(block))?;
                self.rext.deldir[seqnr as usize] = self.cache.block(slot).blocknr;
            }
        }

        self.rext.deldirsize = blocks;
        if u32::from(self.rext.deldirroving) >= u32::from(blocks) * dpb {
            self.rext.deldirroving = 0;
        }
        let mut options = self.root.options();
        if blocks > 0 {
            options |= VolumeOption::Deldir | VolumeOption::SuperDeldir;
        } else {
            options.remove(VolumeOption::Deldir | VolumeOption::SuperDeldir);
        }
        self.root.set_options(options);
        self.root_dirty = true;
        log::info!("deldir resized from {old} to {blocks} blocks");
        self.mark_rext_dirty()
    }
}
