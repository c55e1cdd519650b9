//! 目录与对象操作：建目录、删除、改名、属性

use block_dev::BlockDevice;

use crate::allocation::FreeMode;
use crate::date::DateStamp;
use crate::error::{Error, Result};
use crate::lock::EntryLoc;
use crate::path::{DELDIR_NAME, Object, Place, decode_name};
use crate::session::Session;
use crate::volume::{DeldirEntry, DirEntry, EntryType, anodes, protection};

/// 注释的最大长度
pub const MAX_COMMENT: usize = 79;

/// 对象的属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub kind: EntryType,
    /// 环形文件为逻辑长度
    pub size: u64,
    pub protection: u32,
    pub comment: String,
    pub date: DateStamp,
    pub uid: u16,
    pub gid: u16,
    pub anode: u32,
}

impl EntryInfo {
    fn from_entry(entry: &DirEntry) -> Self {
        let size = match entry.kind {
            EntryType::Rollover => u64::from(entry.extra.virtualsize),
            _ => entry.size(),
        };
        Self {
            name: decode_name(&entry.name),
            kind: entry.kind,
            size,
            protection: entry.full_protection(),
            comment: decode_name(&entry.comment),
            date: entry.date,
            uid: entry.extra.uid,
            gid: entry.extra.gid,
            anode: entry.anode,
        }
    }

    fn deleted(entry: &DeldirEntry) -> Self {
        Self {
            name: decode_name(&entry.name()),
            kind: EntryType::File,
            size: entry.size(),
            protection: 0,
            comment: String::new(),
            date: entry.creation,
            uid: 0,
            gid: 0,
            anode: entry.anodenr,
        }
    }

    fn directory(name: String, anode: u32, date: DateStamp) -> Self {
        Self {
            name,
            kind: EntryType::Dir,
            size: 0,
            protection: 0,
            comment: String::new(),
            date,
            uid: 0,
            gid: 0,
            anode,
        }
    }
}

impl<D: BlockDevice> Session<D> {
    /// `dir`是否就是`ancestor`或在其之下
    pub(crate) fn is_within(&mut self, dir: u32, ancestor: u32) -> Result<bool> {
        let mut current = dir;
        for _ in 0..=self.anode_hint.len() * self.layout.anodes_per_block as usize {
            if current == ancestor {
                return Ok(true);
            }
            if current == anodes::ROOTDIR || current == 0 {
                return Ok(false);
            }
            current = self.dir_parent(current)?;
        }
        Err(Error::corrupt(0, format!("parent chain of dir {dir} loops")))
    }

    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        self.guard(|s| {
            let (dir, name) = s.resolve_parent(path)?;
            if s.search(dir, &name)?.is_some() {
                return Err(Error::Exists);
            }
            let anode = s.new_directory(dir)?;
            let entry = DirEntry::new(EntryType::Dir, anode, &name);
            if let Err(e) = s.add_entry(dir, &entry) {
                s.free_directory(anode)?;
                return Err(e);
            }
            log::debug!("mkdir {:?} as anode {anode:#x} in dir {dir}", decode_name(&name));
            Ok(())
        })
    }

    /// 删除对象。启用回收站时文件的数据保留在回收站里。
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.guard(|s| match s.resolve(path)? {
            Object::Root => Err(Error::WrongType),
            Object::DelDir | Object::DelFile(_) => Err(Error::WriteProtected),
            Object::Entry { dir, loc, entry } => s.delete_entry(dir, loc, &entry),
        })
    }

    fn delete_entry(&mut self, dir: u32, loc: EntryLoc, entry: &DirEntry) -> Result<()> {
        if entry.full_protection() & protection::DELETE != 0 {
            return Err(Error::DeleteProtected);
        }
        if entry.kind.is_link() {
            return self.delete_link(loc, entry);
        }
        if self.locks.in_use(entry.anode) {
            return Err(Error::InUse);
        }
        if entry.kind == EntryType::Dir && self.is_within(self.cwd, entry.anode)? {
            return Err(Error::InUse);
        }
        if entry.extra.link != 0 {
            return self.promote_link(dir, loc, entry);
        }

        match entry.kind {
            EntryType::Dir => {
                if !self.dir_is_empty(entry.anode)? {
                    return Err(Error::DirectoryNotEmpty);
                }
                self.remove_entry(loc)?;
                self.free_directory(entry.anode)
            }
            EntryType::File if self.deldir_capacity() > 0 => {
                self.remove_entry(loc)?;
                if self.deldir_store(entry)? {
                    self.free_blocks(entry.anode, 0, FreeMode::KeepChain)
                } else {
                    self.free_blocks(entry.anode, 0, FreeMode::FreeAnodes)
                }
            }
            _ => {
                self.remove_entry(loc)?;
                self.free_blocks(entry.anode, 0, FreeMode::FreeAnodes)
            }
        }
    }

    /// 改名或移动到另一个目录
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.guard(|s| {
            let (sdir, sloc, entry) = match s.resolve(from)? {
                Object::Entry { dir, loc, entry } => (dir, loc, entry),
                Object::Root => return Err(Error::WrongType),
                Object::DelDir | Object::DelFile(_) => return Err(Error::WriteProtected),
            };
            let (ddir, name) = s.resolve_parent(to)?;
            if let Some((_, existing)) = s.search(ddir, &name)? {
                // 同一目录内只改大小写
                if !(ddir == sdir && existing.anode == entry.anode) {
                    return Err(Error::Exists);
                }
            }

            let mut renamed = entry.clone();
            renamed.name = name;
            if ddir == sdir {
                s.change_entry(sloc, &renamed)?;
                return Ok(());
            }
            if entry.kind == EntryType::Dir && s.is_within(ddir, entry.anode)? {
                return Err(Error::InvalidMove);
            }
            s.move_entry(sloc, &renamed, ddir)
        })
    }

    fn move_entry(&mut self, from: EntryLoc, entry: &DirEntry, dir: u32) -> Result<()> {
        let (to, from) = self.with_tracked(from, |s| s.add_entry(dir, entry))?;
        self.locks.retarget(from, to);
        self.remove_entry(from)?;
        self.locks.moved_object(entry.anode, dir);

        match entry.kind {
            EntryType::Dir => self.set_dir_parent(entry.anode, dir)?,
            EntryType::LinkFile | EntryType::LinkDir => self.link_moved(entry, dir)?,
            _ => {}
        }
        self.object_moved(entry, dir)?;
        log::debug!("moved {:?} into dir {dir}", decode_name(&entry.name));
        Ok(())
    }

    /// 对象的属性
    pub fn examine(&mut self, path: &str) -> Result<EntryInfo> {
        self.guard(|s| match s.resolve(path)? {
            Object::Root => Ok(EntryInfo::directory(
                s.volume_name(),
                anodes::ROOTDIR,
                s.rext.root_date,
            )),
            Object::DelDir => Ok(EntryInfo::directory(
                decode_name(DELDIR_NAME),
                0,
                s.rext.dd_creation,
            )),
            Object::DelFile(slot) => Ok(EntryInfo::deleted(&s.deldir_entry(slot)?)),
            Object::Entry { entry, .. } => Ok(EntryInfo::from_entry(&entry)),
        })
    }

    /// 列出目录内容。回收站本身不出现在根目录的列表里。
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<EntryInfo>> {
        self.guard(|s| match s.resolve_dir(path)? {
            Place::Dir(dir) => Ok(s
                .list_entries(dir)?
                .iter()
                .map(|(_, entry)| EntryInfo::from_entry(entry))
                .collect()),
            Place::DelDir => {
                let mut infos = Vec::new();
                for slot in 0..s.deldir_capacity() {
                    if let Some(entry) = s.deldir_valid(slot)? {
                        infos.push(EntryInfo::deleted(&entry));
                    }
                }
                Ok(infos)
            }
        })
    }

    pub fn change_directory(&mut self, path: &str) -> Result<()> {
        self.guard(|s| match s.resolve_dir(path)? {
            Place::Dir(dir) => {
                s.cwd = dir;
                Ok(())
            }
            Place::DelDir => Err(Error::NotADirectory),
        })
    }

    /// 修改目录项的公共外壳
    fn modify_entry(&mut self, path: &str, edit: impl FnOnce(&mut DirEntry)) -> Result<()> {
        self.guard(|s| match s.resolve(path)? {
            Object::Entry { loc, mut entry, .. } => {
                edit(&mut entry);
                s.change_entry(loc, &entry)?;
                Ok(())
            }
            Object::Root => Err(Error::WrongType),
            Object::DelDir | Object::DelFile(_) => Err(Error::WriteProtected),
        })
    }

    /// 32位保护位，置位即禁止
    pub fn set_protection(&mut self, path: &str, protection: u32) -> Result<()> {
        self.modify_entry(path, |entry| entry.set_full_protection(protection))
    }

    pub fn set_comment(&mut self, path: &str, comment: &str) -> Result<()> {
        let bytes = comment
            .chars()
            .map(|c| u8::try_from(u32::from(c)).map_err(|_| Error::InvalidName))
            .collect::<Result<Vec<u8>>>()?;
        if bytes.len() > MAX_COMMENT {
            return Err(Error::CommentTooLong);
        }
        self.modify_entry(path, |entry| entry.comment = bytes)
    }

    /// 用户与组只在扩展目录项中保存
    pub fn set_owner(&mut self, path: &str, uid: u16, gid: u16) -> Result<()> {
        if !self.layout.dir_ext {
            return Err(Error::WrongType);
        }
        self.modify_entry(path, |entry| {
            entry.extra.uid = uid;
            entry.extra.gid = gid;
        })
    }

    pub fn set_date(&mut self, path: &str, date: DateStamp) -> Result<()> {
        self.modify_entry(path, |entry| entry.date = date)
    }
}
