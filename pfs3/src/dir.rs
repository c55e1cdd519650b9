//! 目录管理
//!
//! 目录是一条anode链，每个anode的区段恰好是一个目录块（clustersize为1）。
//! 链头anode号即目录的身份，新块总是插在链头，原链头的内容移到新anode上。

use block_dev::BlockDevice;

use crate::cache::{Key, Kind, Payload, SlotId};
use crate::error::{Error, Result};
use crate::lock::{EntryLoc, Lock, ObjectInfo};
use crate::path::names_equal;
use crate::session::Session;
use crate::volume::{Anode, DirBlock, DirEntry};

impl<D: BlockDevice> Session<D> {
    pub(crate) fn dir_slot(&mut self, blocknr: u32) -> Result<SlotId> {
        self.load(Kind::Dir, 0, blocknr)
    }

    /// 修改前调用，返回槽位与（可能已改变的）块号
    fn dirty_dir(&mut self, blocknr: u32) -> Result<(SlotId, u32)> {
        let slot = self.dir_slot(blocknr)?;
        let slot = self.make_dirty(slot)?;
        Ok((slot, self.cache.block(slot).blocknr))
    }

    /// 目录块号，按链的顺序
    pub(crate) fn dir_blocks(&mut self, dir: u32) -> Result<Vec<u32>> {
        let chain = self.collect_chain(dir)?;
        if chain.is_empty() || chain.iter().any(|(_, a)| a.is_uninit()) {
            return Err(Error::corrupt(0, format!("directory {dir} has no blocks")));
        }
        Ok(chain.into_iter().map(|(_, a)| a.blocknr).collect())
    }

    pub(crate) fn dir_parent(&mut self, dir: u32) -> Result<u32> {
        let first = self.dir_blocks(dir)?[0];
        let slot = self.dir_slot(first)?;
        Ok(self.cache.dir(slot).parent)
    }

    pub(crate) fn set_dir_parent(&mut self, dir: u32, parent: u32) -> Result<()> {
        for blocknr in self.dir_blocks(dir)? {
            let (slot, _) = self.dirty_dir(blocknr)?;
            self.cache.dir_mut(slot).parent = parent;
        }
        Ok(())
    }

    fn find_entry(
        &mut self,
        dir: u32,
        pred: impl Fn(&DirEntry) -> bool,
    ) -> Result<Option<(EntryLoc, DirEntry)>> {
        let dir_ext = self.layout.dir_ext;
        for blocknr in self.dir_blocks(dir)? {
            let slot = self.dir_slot(blocknr)?;
            let block = self.cache.dir(slot);
            for (offset, _) in block.spans() {
                let entry = block.entry(offset, dir_ext).ok_or_else(|| {
                    Error::corrupt(blocknr, format!("bad directory entry at {offset}"))
                })?;
                if pred(&entry) {
                    return Ok(Some((
                        EntryLoc {
                            block: blocknr,
                            offset,
                        },
                        entry,
                    )));
                }
            }
        }
        Ok(None)
    }

    /// 按名字查找，不区分大小写
    pub(crate) fn search(&mut self, dir: u32, name: &[u8]) -> Result<Option<(EntryLoc, DirEntry)>> {
        self.find_entry(dir, |e| names_equal(&e.name, name))
    }

    pub(crate) fn find_by_anode(
        &mut self,
        dir: u32,
        anode: u32,
    ) -> Result<Option<(EntryLoc, DirEntry)>> {
        self.find_entry(dir, |e| e.anode == anode)
    }

    pub(crate) fn read_entry(&mut self, loc: EntryLoc) -> Result<DirEntry> {
        let slot = self.dir_slot(loc.block)?;
        self.cache
            .dir(slot)
            .entry(loc.offset, self.layout.dir_ext)
            .ok_or_else(|| Error::corrupt(loc.block, format!("no entry at {}", loc.offset)))
    }

    pub(crate) fn list_entries(&mut self, dir: u32) -> Result<Vec<(EntryLoc, DirEntry)>> {
        let dir_ext = self.layout.dir_ext;
        let mut entries = Vec::new();
        for blocknr in self.dir_blocks(dir)? {
            let slot = self.dir_slot(blocknr)?;
            let block = self.cache.dir(slot);
            for (offset, _) in block.spans() {
                let entry = block.entry(offset, dir_ext).ok_or_else(|| {
                    Error::corrupt(blocknr, format!("bad directory entry at {offset}"))
                })?;
                entries.push((
                    EntryLoc {
                        block: blocknr,
                        offset,
                    },
                    entry,
                ));
            }
        }
        Ok(entries)
    }

    pub(crate) fn dir_is_empty(&mut self, dir: u32) -> Result<bool> {
        for blocknr in self.dir_blocks(dir)? {
            let slot = self.dir_slot(blocknr)?;
            if !self.cache.dir(slot).is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn encode_entry(&self, entry: &DirEntry) -> Result<Vec<u8>> {
        let bytes = entry
            .encode(self.layout.dir_ext)
            .map_err(|e| Error::corrupt(0, format!("encoding entry {:?}: {e}", entry.name)))?;
        if bytes.len() > self.layout.dir_space() {
            return Err(Error::NameTooLong);
        }
        Ok(bytes)
    }

    /// 放进最后一个装得下的目录块，都装不下时在链头插入新块
    pub(crate) fn add_entry(&mut self, dir: u32, entry: &DirEntry) -> Result<EntryLoc> {
        let bytes = self.encode_entry(entry)?;

        let mut target = None;
        for blocknr in self.dir_blocks(dir)?.into_iter().rev() {
            let slot = self.dir_slot(blocknr)?;
            if self.cache.dir(slot).free_space() >= bytes.len() {
                target = Some(blocknr);
                break;
            }
        }
        let blocknr = match target {
            Some(blocknr) => blocknr,
            None => self.prepend_dir_block(dir)?,
        };

        let (slot, blocknr) = self.dirty_dir(blocknr)?;
        let offset = self
            .cache
            .dir_mut(slot)
            .append(&bytes)
            .ok_or_else(|| Error::corrupt(blocknr, "directory block overflow"))?;
        log::trace!("add entry {:?} to dir {dir} at {blocknr}+{offset}", entry.name);
        Ok(EntryLoc {
            block: blocknr,
            offset,
        })
    }

    /// 在链头插入一个空目录块，链头anode号不变，返回新块号
    fn prepend_dir_block(&mut self, dir: u32) -> Result<u32> {
        let parent = self.dir_parent(dir)?;
        let head = self.get_anode(dir)?;

        let block = DirBlock::new(dir, parent, self.layout.rbs);
        let slot = self.create(Kind::Dir, 0, Payload::Dir(block))?;
        let blocknr = self.cache.block(slot).blocknr;
        let moved = match self.alloc_anode(dir) {
            Ok(moved) => moved,
            Err(e) => {
                self.cache.remove(slot);
                self.alloc.res_tobefreed.push(blocknr);
                return Err(e);
            }
        };

        self.save_anode(
            moved,
            Anode {
                clustersize: 1,
                blocknr: head.blocknr,
                next: head.next,
            },
        )?;
        self.save_anode(
            dir,
            Anode {
                clustersize: 1,
                blocknr,
                next: moved,
            },
        )?;
        log::debug!("dir {dir} grows: new head block {blocknr}");
        Ok(blocknr)
    }

    pub(crate) fn remove_entry(&mut self, loc: EntryLoc) -> Result<()> {
        let (slot, blocknr) = self.dirty_dir(loc.block)?;
        let len = self.cache.dir_mut(slot).remove(loc.offset);
        if len == 0 {
            return Err(Error::corrupt(blocknr, format!("no entry at {}", loc.offset)));
        }
        self.locks.entry_removed(blocknr, loc.offset, len);

        let block = self.cache.dir(slot);
        if block.is_empty() {
            let dir = block.anodenr;
            self.release_dir_block(dir, blocknr)?;
        }
        Ok(())
    }

    /// 释放一个空目录块。目录至少保留一个目录块。
    fn release_dir_block(&mut self, dir: u32, blocknr: u32) -> Result<()> {
        let chain = self.collect_chain(dir)?;
        if chain.len() < 2 {
            return Ok(());
        }
        let i = chain
            .iter()
            .position(|(_, a)| a.blocknr == blocknr)
            .ok_or_else(|| Error::corrupt(blocknr, format!("not in chain of dir {dir}")))?;

        if i == 0 {
            // 链头接管下一个anode的内容
            let (next_nr, next) = chain[1];
            self.save_anode(dir, next)?;
            self.free_anode(next_nr)?;
        } else {
            let (prev_nr, mut prev) = chain[i - 1];
            prev.next = chain[i].1.next;
            self.save_anode(prev_nr, prev)?;
            self.free_anode(chain[i].0)?;
        }

        self.drop_reserved(blocknr);
        log::debug!("dir {dir} shrinks: released block {blocknr}");
        Ok(())
    }

    /// 丢弃缓存中的块并在提交后归还
    fn drop_reserved(&mut self, blocknr: u32) {
        if let Some(slot) = self.cache.lookup(Key::Dir(blocknr)) {
            self.cache.remove(slot);
        }
        self.alloc.res_tobefreed.push(blocknr);
    }

    fn tracked(&self, id: u32) -> Result<EntryLoc> {
        match self.locks.get(id).map(|l| l.info) {
            Some(ObjectInfo::Entry(loc)) => Ok(loc),
            _ => Err(Error::corrupt(0, "lost track of directory entry")),
        }
    }

    /// 执行`op`期间跟踪`loc`处的目录项，返回其结果和目录项的新位置
    pub(crate) fn with_tracked<T>(
        &mut self,
        loc: EntryLoc,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<(T, EntryLoc)> {
        let tracker = self.locks.insert(Lock {
            info: ObjectInfo::Entry(loc),
            anode: 0,
            dir: 0,
            file: None,
        });
        let result = op(self).and_then(|value| Ok((value, self.tracked(tracker)?)));
        self.locks.remove(tracker);
        result
    }

    /// 替换目录项。原地放不下时把前面的目录项挪到前一块，
    /// 必要时在链头新建块，直到腾出空间。返回目录项的新位置。
    pub(crate) fn change_entry(&mut self, loc: EntryLoc, entry: &DirEntry) -> Result<EntryLoc> {
        let bytes = self.encode_entry(entry)?;
        let tracker = self.locks.insert(Lock {
            info: ObjectInfo::Entry(loc),
            anode: entry.anode,
            dir: 0,
            file: None,
        });
        let result = self.change_tracked(tracker, &bytes);
        self.locks.remove(tracker);
        result
    }

    fn change_tracked(&mut self, tracker: u32, bytes: &[u8]) -> Result<EntryLoc> {
        let mut moved = false;
        let (slot, blocknr) = loop {
            let loc = self.tracked(tracker)?;
            let (slot, blocknr) = self.dirty_dir(loc.block)?;
            let loc = self.tracked(tracker)?;

            let old_len = self.cache.dir(slot).entry_len(loc.offset);
            if self.cache.dir_mut(slot).replace(loc.offset, bytes) {
                let delta = bytes.len() as isize - old_len as isize;
                self.locks.entry_resized(blocknr, loc.offset, delta);
                break (slot, blocknr);
            }
            self.move_first_entry_to_previous(blocknr)?;
            moved = true;
        };

        let loc = self.tracked(tracker)?;
        if moved {
            let dir = self.cache.dir(slot).anodenr;
            self.release_empty_blocks(dir)?;
        }
        log::trace!("changed entry at {blocknr}+{}", loc.offset);
        self.tracked(tracker)
    }

    /// 把`blocknr`的第一个目录项移到链上前一块的末尾
    fn move_first_entry_to_previous(&mut self, blocknr: u32) -> Result<()> {
        let slot = self.dir_slot(blocknr)?;
        let dir = self.cache.dir(slot).anodenr;
        let len = self.cache.dir(slot).entry_len(0);
        if len == 0 {
            return Err(Error::corrupt(blocknr, "cannot make room in empty block"));
        }

        let prev = loop {
            let chain = self.dir_blocks(dir)?;
            let i = chain
                .iter()
                .position(|&b| b == blocknr)
                .ok_or_else(|| Error::corrupt(blocknr, format!("not in chain of dir {dir}")))?;
            if i == 0 {
                self.prepend_dir_block(dir)?;
                continue;
            }
            let prev = chain[i - 1];
            let ps = self.dir_slot(prev)?;
            if self.cache.dir(ps).free_space() >= len {
                break prev;
            }
            self.move_first_entry_to_previous(prev)?;
        };

        let (ps, prev) = self.dirty_dir(prev)?;
        let (bs, blocknr) = self.dirty_dir(blocknr)?;
        let bytes = self.cache.dir(bs).entries[..len].to_vec();
        let offset = self
            .cache
            .dir_mut(ps)
            .append(&bytes)
            .ok_or_else(|| Error::corrupt(prev, "directory block overflow"))?;
        self.cache.dir_mut(bs).remove(0);

        self.locks.retarget(
            EntryLoc {
                block: blocknr,
                offset: 0,
            },
            EntryLoc {
                block: prev,
                offset,
            },
        );
        self.locks.entry_removed(blocknr, 0, len);
        Ok(())
    }

    fn release_empty_blocks(&mut self, dir: u32) -> Result<()> {
        for blocknr in self.dir_blocks(dir)? {
            let slot = self.dir_slot(blocknr)?;
            if self.cache.dir(slot).is_empty() {
                self.release_dir_block(dir, blocknr)?;
            }
        }
        Ok(())
    }

    /// 建立一个只有一个空目录块的新目录，返回其anode
    pub(crate) fn new_directory(&mut self, parent: u32) -> Result<u32> {
        let anodenr = self.alloc_anode(0)?;
        let block = DirBlock::new(anodenr, parent, self.layout.rbs);
        let slot = match self.create(Kind::Dir, 0, Payload::Dir(block)) {
            Ok(slot) => slot,
            Err(e) => {
                self.free_anode(anodenr)?;
                return Err(e);
            }
        };
        let blocknr = self.cache.block(slot).blocknr;
        self.save_anode(
            anodenr,
            Anode {
                clustersize: 1,
                blocknr,
                next: 0,
            },
        )?;
        Ok(anodenr)
    }

    /// 释放空目录的全部目录块与anode
    pub(crate) fn free_directory(&mut self, dir: u32) -> Result<()> {
        let chain = self.collect_chain(dir)?;
        for &(anodenr, anode) in chain.iter().rev() {
            self.drop_reserved(anode.blocknr);
            self.free_anode(anodenr)?;
        }
        Ok(())
    }
}
