//! 锁与文件句柄
//!
//! 每把锁记住对象目录项的位置（目录块号 + 块内偏移）。
//! 目录块搬迁、目录项移动或变长时，所有受影响的锁在这里统一修正。

use std::collections::HashMap;

use derive_more::{Display, From, Into};

/// 打开的文件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From, Into)]
#[display(fmt = "#{}", _0)]
pub struct FileHandle(u32);

/// 目录项在目录块中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryLoc {
    pub block: u32,
    pub offset: usize,
}

/// 锁指向的对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectInfo {
    Root,
    /// 虚拟的回收站目录
    DelDir,
    /// 回收站中的文件
    DelFile(u32),
    Entry(EntryLoc),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenFile {
    pub write: bool,
    pub pos: u64,
    /// 上次访问的区段（anode号，首块序号）
    pub cursor: Option<(u32, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lock {
    pub info: ObjectInfo,
    /// 对象的anode
    pub anode: u32,
    /// 所在目录的anode
    pub dir: u32,
    /// `None`为临时锁，只用于跟踪目录项位置
    pub file: Option<OpenFile>,
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: HashMap<u32, Lock>,
    next: u32,
}

impl LockTable {
    pub fn insert(&mut self, lock: Lock) -> u32 {
        self.next = self.next.wrapping_add(1).max(1);
        while self.locks.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1).max(1);
        }
        self.locks.insert(self.next, lock);
        self.next
    }

    pub fn remove(&mut self, id: u32) -> Option<Lock> {
        self.locks.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Lock> {
        self.locks.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Lock> {
        self.locks.get_mut(&id)
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut EntryLoc> {
        self.locks.values_mut().filter_map(|lock| match &mut lock.info {
            ObjectInfo::Entry(loc) => Some(loc),
            _ => None,
        })
    }

    /// 目录块换了块号
    pub fn moved_block(&mut self, old: u32, new: u32) {
        for loc in self.entries_mut().filter(|loc| loc.block == old) {
            loc.block = new;
        }
    }

    /// `block`中`offset`处删去了`len`字节
    pub fn entry_removed(&mut self, block: u32, offset: usize, len: usize) {
        for loc in self
            .entries_mut()
            .filter(|loc| loc.block == block && loc.offset > offset)
        {
            loc.offset -= len;
        }
    }

    /// `offset`处的目录项长度改变了`delta`
    pub fn entry_resized(&mut self, block: u32, offset: usize, delta: isize) {
        for loc in self
            .entries_mut()
            .filter(|loc| loc.block == block && loc.offset > offset)
        {
            loc.offset = loc.offset.wrapping_add_signed(delta);
        }
    }

    /// 目录项整体移到了别处
    pub fn retarget(&mut self, from: EntryLoc, to: EntryLoc) {
        for loc in self.entries_mut().filter(|loc| **loc == from) {
            *loc = to;
        }
    }

    /// 对象搬到了另一个目录
    pub fn moved_object(&mut self, anode: u32, dir: u32) {
        for lock in self.locks.values_mut().filter(|l| l.anode == anode) {
            lock.dir = dir;
        }
    }

    /// 是否有打开的文件句柄引用此anode
    pub fn in_use(&self, anode: u32) -> bool {
        self.locks
            .values()
            .any(|l| l.anode == anode && l.file.is_some())
    }

    pub fn has_writer(&self, anode: u32) -> bool {
        self.locks
            .values()
            .any(|l| l.anode == anode && l.file.is_some_and(|f| f.write))
    }

    pub fn holds_deleted(&self, slot: u32) -> bool {
        self.locks
            .values()
            .any(|l| l.info == ObjectInfo::DelFile(slot))
    }

    /// 文件被截断后，所有句柄的区段游标作废
    pub fn reset_cursors(&mut self, anode: u32) {
        for file in self
            .locks
            .values_mut()
            .filter(|l| l.anode == anode)
            .filter_map(|l| l.file.as_mut())
        {
            file.cursor = None;
        }
    }

    /// 文件变短后，超出末尾的读写位置移到末尾
    pub fn clamp_positions(&mut self, anode: u32, size: u64) {
        for file in self
            .locks
            .values_mut()
            .filter(|l| l.anode == anode)
            .filter_map(|l| l.file.as_mut())
        {
            file.pos = file.pos.min(size);
        }
    }

    pub fn open_files(&self) -> usize {
        self.locks.values().filter(|l| l.file.is_some()).count()
    }
}
