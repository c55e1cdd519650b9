//! 文件读写
//!
//! 数据直接读写设备，不经过块缓存；只有目录项和anode的修改走缓存。
//! 环形文件的物理大小固定，逻辑窗口从`rollpointer`开始，长`virtualsize`字节。

use std::io::SeekFrom;

use block_dev::BlockDevice;

use crate::allocation::FreeMode;
use crate::date::DateStamp;
use crate::error::{Error, Result};
use crate::lock::{EntryLoc, FileHandle, Lock, ObjectInfo, OpenFile};
use crate::path::Object;
use crate::session::Session;
use crate::volume::{DirEntry, EntryType, protection};

/// 文件的逻辑视图
#[derive(Debug, Clone, Copy)]
struct View {
    size: u64,
    /// 环形文件的（物理大小，逻辑起点），物理大小不为零
    roll: Option<(u64, u64)>,
}

impl View {
    fn physical(&self, pos: u64) -> u64 {
        match self.roll {
            Some((fsize, start)) => (start + pos) % fsize,
            None => pos,
        }
    }
}

/// 环形文件的物理大小，为零说明目录项已损坏
fn rollover_size(loc: EntryLoc, entry: &DirEntry) -> Result<u64> {
    match entry.fsize {
        0 => Err(Error::corrupt(loc.block, "rollover file of size 0")),
        fsize => Ok(u64::from(fsize)),
    }
}

impl<D: BlockDevice> Session<D> {
    /// 打开文件。写方式打开时同一文件只能有一个写者。
    pub fn open(&mut self, path: &str, write: bool) -> Result<FileHandle> {
        self.guard(|s| s.open_path(path, write))
    }

    fn open_path(&mut self, path: &str, write: bool) -> Result<FileHandle> {
        let (dir, loc, entry) = match self.resolve(path)? {
            Object::Root | Object::DelDir => return Err(Error::NotAFile),
            Object::DelFile(slot) if write => {
                log::debug!("refusing to write deleted file in slot {slot}");
                return Err(Error::WriteProtected);
            }
            Object::DelFile(slot) => return self.open_deleted_slot(slot),
            Object::Entry { dir, loc, entry } => (dir, loc, entry),
        };
        let (dir, loc, entry) = match entry.kind {
            EntryType::File | EntryType::Rollover => (dir, loc, entry),
            EntryType::LinkFile => self.link_target(&entry)?,
            EntryType::SoftLink => return Err(Error::IsSoftLink),
            EntryType::Dir | EntryType::LinkDir => return Err(Error::NotAFile),
        };

        let prot = entry.full_protection();
        if write && prot & protection::WRITE != 0 {
            return Err(Error::WriteProtected);
        }
        if !write && prot & protection::READ != 0 {
            return Err(Error::ReadProtected);
        }
        if write && self.locks.has_writer(entry.anode) {
            return Err(Error::InUse);
        }
        Ok(self.insert_handle(dir, loc, entry.anode, write))
    }

    fn insert_handle(&mut self, dir: u32, loc: EntryLoc, anode: u32, write: bool) -> FileHandle {
        let id = self.locks.insert(Lock {
            info: ObjectInfo::Entry(loc),
            anode,
            dir,
            file: Some(OpenFile {
                write,
                pos: 0,
                cursor: None,
            }),
        });
        log::trace!("open anode {anode:#x} as #{id} (write={write})");
        FileHandle::from(id)
    }

    /// 新建文件并以写方式打开；文件已存在时将其截断为空
    pub fn create_file(&mut self, path: &str) -> Result<FileHandle> {
        self.guard(|s| {
            let (dir, name) = s.resolve_parent(path)?;
            let (dir, loc, entry) = match s.search(dir, &name)? {
                Some((loc, entry)) => s.truncate_existing(dir, loc, entry)?,
                None => s.new_file(dir, &name)?,
            };
            Ok(s.insert_handle(dir, loc, entry.anode, true))
        })
    }

    fn new_file(&mut self, dir: u32, name: &[u8]) -> Result<(u32, EntryLoc, DirEntry)> {
        let anode = self.alloc_anode(0)?;
        let entry = DirEntry::new(EntryType::File, anode, name);
        match self.add_entry(dir, &entry) {
            Ok(loc) => Ok((dir, loc, entry)),
            Err(e) => {
                self.free_anode(anode)?;
                Err(e)
            }
        }
    }

    fn truncate_existing(
        &mut self,
        dir: u32,
        loc: EntryLoc,
        entry: DirEntry,
    ) -> Result<(u32, EntryLoc, DirEntry)> {
        let (dir, loc, mut entry) = match entry.kind {
            EntryType::File | EntryType::Rollover => (dir, loc, entry),
            EntryType::LinkFile => self.link_target(&entry)?,
            EntryType::SoftLink => return Err(Error::IsSoftLink),
            EntryType::Dir | EntryType::LinkDir => return Err(Error::WrongType),
        };
        if entry.full_protection() & protection::WRITE != 0 {
            return Err(Error::WriteProtected);
        }
        if self.locks.in_use(entry.anode) {
            return Err(Error::InUse);
        }

        if entry.kind == EntryType::Rollover {
            // 环形文件保留空间，只清空逻辑窗口
            entry.extra.virtualsize = 0;
            entry.extra.rollpointer = 0;
        } else {
            self.free_blocks(entry.anode, 0, FreeMode::KeepHead)?;
            entry.set_size(0);
        }
        entry.date = DateStamp::now();
        let loc = self.change_entry(loc, &entry)?;
        Ok((dir, loc, entry))
    }

    /// 建立固定大小的环形文件
    pub fn create_rollover(&mut self, path: &str, size: u32) -> Result<()> {
        self.guard(|s| {
            if !s.layout.dir_ext || size == 0 {
                return Err(Error::WrongType);
            }
            let (dir, name) = s.resolve_parent(path)?;
            if s.search(dir, &name)?.is_some() {
                return Err(Error::Exists);
            }

            let anode = s.alloc_anode(0)?;
            let blocks = s.layout.blocks_for(u64::from(size)) as u32;
            if let Err(e) = s.allocate_data(anode, blocks) {
                s.free_anode(anode)?;
                return Err(e);
            }
            let mut entry = DirEntry::new(EntryType::Rollover, anode, &name);
            entry.fsize = size;
            if let Err(e) = s.add_entry(dir, &entry) {
                s.free_blocks(anode, 0, FreeMode::FreeAnodes)?;
                return Err(e);
            }
            log::debug!("rollover file of {size} bytes at anode {anode:#x}");
            Ok(())
        })
    }

    fn file_lock(&self, id: u32) -> Result<(Lock, OpenFile)> {
        let lock = *self.locks.get(id).ok_or(Error::InvalidHandle)?;
        let file = lock.file.ok_or(Error::InvalidHandle)?;
        Ok((lock, file))
    }

    fn store_file(&mut self, id: u32, file: OpenFile) {
        if let Some(lock) = self.locks.get_mut(id) {
            lock.file = Some(file);
        }
    }

    fn view(&mut self, info: ObjectInfo) -> Result<View> {
        match info {
            ObjectInfo::Entry(loc) => {
                let entry = self.read_entry(loc)?;
                Ok(if entry.kind == EntryType::Rollover {
                    rollover_size(loc, &entry)?;
                    View {
                        size: u64::from(entry.extra.virtualsize),
                        roll: Some((u64::from(entry.fsize), u64::from(entry.extra.rollpointer))),
                    }
                } else {
                    View {
                        size: entry.size(),
                        roll: None,
                    }
                })
            }
            ObjectInfo::DelFile(slot) => Ok(View {
                size: self.deldir_entry(slot)?.size(),
                roll: None,
            }),
            ObjectInfo::Root | ObjectInfo::DelDir => Err(Error::InvalidHandle),
        }
    }

    pub(crate) fn max_file_size(&self) -> u64 {
        if self.layout.large_files && self.layout.dir_ext {
            (1 << 48) - 1
        } else {
            u64::from(u32::MAX)
        }
    }

    /// 文件第`index`块的块号，以及区段内从它起剩余的块数
    fn map_block(
        &mut self,
        anode: u32,
        cursor: &mut Option<(u32, u64)>,
        index: u64,
    ) -> Result<(u32, u32)> {
        let extent = self.locate(anode, *cursor, index)?.ok_or_else(|| {
            Error::corrupt(0, format!("anode chain {anode:#x} has no block {index}"))
        })?;
        *cursor = Some((extent.anodenr, extent.first));
        let skip = (index - extent.first) as u32;
        Ok((extent.anode.blocknr + skip, extent.anode.clustersize - skip))
    }

    /// 从物理偏移`pos`起读满`buf`
    pub(crate) fn read_at(
        &mut self,
        anode: u32,
        cursor: &mut Option<(u32, u64)>,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let bs = self.layout.block_size;
        let mut done = 0;
        while done < buf.len() {
            let at = pos + done as u64;
            let (blocknr, run) = self.map_block(anode, cursor, at / bs as u64)?;
            let off = (at % bs as u64) as usize;
            let left = buf.len() - done;

            if off == 0 && left >= bs {
                let len = left.min(run as usize * bs) / bs * bs;
                self.read_data(blocknr, &mut buf[done..done + len])?;
                done += len;
            } else {
                let len = left.min(bs - off);
                let mut block = vec![0u8; bs];
                self.read_data(blocknr, &mut block)?;
                buf[done..done + len].copy_from_slice(&block[off..off + len]);
                done += len;
            }
        }
        Ok(())
    }

    /// 从物理偏移`pos`起写入`data`，块必须已经分配
    pub(crate) fn write_at(
        &mut self,
        anode: u32,
        cursor: &mut Option<(u32, u64)>,
        pos: u64,
        data: &[u8],
    ) -> Result<()> {
        let bs = self.layout.block_size;
        let mut done = 0;
        while done < data.len() {
            let at = pos + done as u64;
            let (blocknr, run) = self.map_block(anode, cursor, at / bs as u64)?;
            let off = (at % bs as u64) as usize;
            let left = data.len() - done;

            if off == 0 && left >= bs {
                let len = left.min(run as usize * bs) / bs * bs;
                self.write_data(blocknr, &data[done..done + len])?;
                done += len;
            } else {
                let len = left.min(bs - off);
                let mut block = vec![0u8; bs];
                self.read_data(blocknr, &mut block)?;
                block[off..off + len].copy_from_slice(&data[done..done + len]);
                self.write_data(blocknr, &block)?;
                done += len;
            }
        }
        Ok(())
    }

    /// 从当前位置读，返回读到的字节数，0表示已到末尾
    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.guard(|s| s.read_file(u32::from(handle), buf))
    }

    fn read_file(&mut self, id: u32, buf: &mut [u8]) -> Result<usize> {
        let (lock, mut file) = self.file_lock(id)?;
        let view = self.view(lock.info)?;
        let n = view.size.saturating_sub(file.pos).min(buf.len() as u64) as usize;

        let mut done = 0;
        while done < n {
            let phys = view.physical(file.pos + done as u64);
            let mut len = n - done;
            if let Some((fsize, _)) = view.roll {
                len = len.min((fsize - phys) as usize);
            }
            self.read_at(lock.anode, &mut file.cursor, phys, &mut buf[done..done + len])?;
            done += len;
        }

        file.pos += n as u64;
        self.store_file(id, file);
        Ok(n)
    }

    /// 在当前位置写入。所需的块先全部分配好，空间不足时文件保持原样。
    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize> {
        self.guard(|s| s.write_file(u32::from(handle), data))
    }

    fn write_file(&mut self, id: u32, data: &[u8]) -> Result<usize> {
        let (lock, mut file) = self.file_lock(id)?;
        let ObjectInfo::Entry(loc) = lock.info else {
            return Err(Error::WriteProtected);
        };
        if !file.write {
            return Err(Error::WriteProtected);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut entry = self.read_entry(loc)?;
        if entry.kind == EntryType::Rollover {
            return self.write_rollover(id, lock.anode, file, loc, entry, data);
        }

        let end = file
            .pos
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.max_file_size())
            .ok_or(Error::FileTooLarge)?;
        let size = entry.size();
        self.grow(lock.anode, size, end.max(size))?;

        let result = self
            .write_at(lock.anode, &mut file.cursor, file.pos, data)
            .and_then(|()| {
                entry.set_size(end.max(size));
                entry.date = DateStamp::now();
                self.change_entry(loc, &entry)
            });
        if let Err(e) = result {
            return Err(self.undo_grow(lock.anode, size, end, e));
        }
        file.pos = end;
        self.store_file(id, file);
        Ok(data.len())
    }

    /// 把链从`old`字节扩到`new`字节所需的块
    fn grow(&mut self, anode: u32, old: u64, new: u64) -> Result<()> {
        let have = self.layout.blocks_for(old);
        let need = self.layout.blocks_for(new);
        if need <= have {
            return Ok(());
        }
        let count = u32::try_from(need - have).map_err(|_| Error::DiskFull)?;
        if let Err(e) = self.allocate_data(anode, count) {
            // 回滚可能改动了链尾
            self.locks.reset_cursors(anode);
            return Err(e);
        }
        Ok(())
    }

    /// 扩链之后的步骤失败时，把链截回`old`字节对应的块数
    fn undo_grow(&mut self, anode: u32, old: u64, new: u64, err: Error) -> Error {
        let keep = self.layout.blocks_for(old);
        if err.is_fatal() || self.layout.blocks_for(new) <= keep {
            return err;
        }
        log::warn!("growing anode {anode:#x} failed: {err}, truncating back");
        let result = self.free_blocks(anode, keep as u32, FreeMode::KeepHead);
        self.locks.reset_cursors(anode);
        match result {
            Ok(()) => err,
            Err(e) => e,
        }
    }

    fn write_rollover(
        &mut self,
        id: u32,
        anode: u32,
        mut file: OpenFile,
        loc: EntryLoc,
        mut entry: DirEntry,
        data: &[u8],
    ) -> Result<usize> {
        let fsize = rollover_size(loc, &entry)?;
        let mut start = u64::from(entry.extra.rollpointer);
        let mut virtual_size = u64::from(entry.extra.virtualsize);
        let mut pos = file.pos;

        // 超过一圈的部分会被自身覆盖
        let mut tail = data;
        if tail.len() as u64 > fsize {
            let skip = tail.len() - fsize as usize;
            tail = &tail[skip..];
            pos += skip as u64;
        }
        let end = pos + tail.len() as u64;
        if end > fsize {
            let shift = end - fsize;
            start = (start + shift) % fsize;
            pos -= shift;
            virtual_size = fsize;
        }

        let mut done = 0;
        while done < tail.len() {
            let phys = (start + pos + done as u64) % fsize;
            let len = (tail.len() - done).min((fsize - phys) as usize);
            self.write_at(anode, &mut file.cursor, phys, &tail[done..done + len])?;
            done += len;
        }

        pos += tail.len() as u64;
        file.pos = pos;
        entry.extra.virtualsize = virtual_size.max(pos) as u32;
        entry.extra.rollpointer = start as u32;
        entry.date = DateStamp::now();
        self.change_entry(loc, &entry)?;
        self.store_file(id, file);
        Ok(data.len())
    }

    /// 移动读写位置，超出文件末尾时失败。返回新位置。
    pub fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64> {
        self.guard(|s| {
            let id = u32::from(handle);
            let (lock, mut file) = s.file_lock(id)?;
            let size = s.view(lock.info)?.size;
            let target = match pos {
                SeekFrom::Start(offset) => Some(offset),
                SeekFrom::Current(delta) => file.pos.checked_add_signed(delta),
                SeekFrom::End(delta) => size.checked_add_signed(delta),
            };
            let target = target
                .filter(|&target| target <= size)
                .ok_or(Error::SeekError)?;
            file.pos = target;
            s.store_file(id, file);
            Ok(target)
        })
    }

    pub fn tell(&self, handle: FileHandle) -> Result<u64> {
        self.file_lock(u32::from(handle)).map(|(_, file)| file.pos)
    }

    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        self.guard(|s| {
            let id = u32::from(handle);
            s.file_lock(id)?;
            s.locks.remove(id);
            log::trace!("close {handle}");
            Ok(())
        })
    }

    /// 截断或扩展文件，扩展出的内容未定义
    pub fn set_file_size(&mut self, handle: FileHandle, size: u64) -> Result<()> {
        self.guard(|s| {
            let (lock, file) = s.file_lock(u32::from(handle))?;
            let ObjectInfo::Entry(loc) = lock.info else {
                return Err(Error::WriteProtected);
            };
            if !file.write {
                return Err(Error::WriteProtected);
            }
            let mut entry = s.read_entry(loc)?;
            if entry.kind == EntryType::Rollover {
                return Err(Error::WrongType);
            }
            if size > s.max_file_size() {
                return Err(Error::FileTooLarge);
            }

            let old = entry.size();
            if size > old {
                s.grow(lock.anode, old, size)?;
            }
            entry.set_size(size);
            entry.date = DateStamp::now();
            if let Err(e) = s.change_entry(loc, &entry) {
                return Err(s.undo_grow(lock.anode, old, size, e));
            }

            // 目录项先缩小，截断中途失败时只会多占块
            let keep = s.layout.blocks_for(size);
            if keep < s.layout.blocks_for(old) {
                s.free_blocks(lock.anode, keep as u32, FreeMode::KeepHead)?;
            }
            s.locks.reset_cursors(lock.anode);
            s.locks.clamp_positions(lock.anode, size);
            Ok(())
        })
    }
}
