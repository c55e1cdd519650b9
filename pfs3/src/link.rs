//! 硬链接与软链接
//!
//! 每个硬链接目录项有自己的链接节点（一个anode）：
//! `clustersize`为链接所在目录，`blocknr`为对象的anode，`next`指向下一个节点。
//! 对象目录项的`extra.link`是节点链的链头，链接目录项的`extra.link`是对象所在目录。

use block_dev::BlockDevice;

use crate::allocation::FreeMode;
use crate::error::{Error, Result};
use crate::lock::EntryLoc;
use crate::path::{Object, decode_name, encode_name};
use crate::session::Session;
use crate::volume::{Anode, DirEntry, EntryType};

impl<D: BlockDevice> Session<D> {
    /// 硬链接指向的对象：（所在目录，位置，目录项）
    pub(crate) fn link_target(&mut self, link: &DirEntry) -> Result<(u32, EntryLoc, DirEntry)> {
        let node = self.get_anode(link.anode)?;
        let dir = link.extra.link;
        let (loc, entry) = self.find_by_anode(dir, node.blocknr)?.ok_or_else(|| {
            Error::corrupt(
                0,
                format!("link {:?} lost object {:#x}", decode_name(&link.name), node.blocknr),
            )
        })?;
        Ok((dir, loc, entry))
    }

    /// 对象的链接节点链
    fn link_nodes(&mut self, head: u32) -> Result<Vec<(u32, Anode)>> {
        let limit = self.anode_hint.len() * self.layout.anodes_per_block as usize + 1;
        let mut nodes = Vec::new();
        let mut nr = head;
        while nr != 0 {
            if nodes.len() > limit {
                return Err(Error::corrupt(0, format!("link chain {head:#x} loops")));
            }
            let node = self.get_anode(nr)?;
            nodes.push((nr, node));
            nr = node.next;
        }
        Ok(nodes)
    }

    /// 为`target`建立名为`name`的硬链接
    pub fn make_link(&mut self, target: &str, name: &str) -> Result<()> {
        self.guard(|s| {
            if !s.layout.dir_ext {
                return Err(Error::WrongType);
            }
            let (odir, oloc, object) = match s.resolve(target)? {
                Object::Entry { entry, .. } if entry.kind.is_link() => s.link_target(&entry)?,
                Object::Entry { dir, loc, entry } => (dir, loc, entry),
                _ => return Err(Error::WrongType),
            };
            let kind = match object.kind {
                EntryType::File | EntryType::Rollover => EntryType::LinkFile,
                EntryType::Dir => EntryType::LinkDir,
                _ => return Err(Error::WrongType),
            };

            let (dir, lname) = s.resolve_parent(name)?;
            if s.search(dir, &lname)?.is_some() {
                return Err(Error::Exists);
            }
            if kind == EntryType::LinkDir && s.is_within(dir, object.anode)? {
                return Err(Error::InvalidMove);
            }

            let node_nr = s.alloc_anode(0)?;
            s.save_anode(
                node_nr,
                Anode {
                    clustersize: dir,
                    blocknr: object.anode,
                    next: object.extra.link,
                },
            )?;
            let mut link = DirEntry::new(kind, node_nr, &lname);
            link.extra.link = odir;

            let added = s.with_tracked(oloc, |s| s.add_entry(dir, &link));
            let (_, oloc) = match added {
                Ok(added) => added,
                Err(e) => {
                    s.free_anode(node_nr)?;
                    return Err(e);
                }
            };

            let mut object = object;
            object.extra.link = node_nr;
            s.change_entry(oloc, &object)?;
            log::debug!(
                "link {:?} -> anode {:#x} via node {node_nr:#x}",
                decode_name(&lname),
                object.anode
            );
            Ok(())
        })
    }

    /// 删除一个硬链接目录项，对象本身不动
    pub(crate) fn delete_link(&mut self, loc: EntryLoc, link: &DirEntry) -> Result<()> {
        let node = self.get_anode(link.anode)?;
        self.remove_entry(loc)?;

        let odir = link.extra.link;
        let (oloc, mut object) = self
            .find_by_anode(odir, node.blocknr)?
            .ok_or_else(|| Error::corrupt(0, format!("link node {:#x} lost its object", link.anode)))?;

        if object.extra.link == link.anode {
            object.extra.link = node.next;
            self.change_entry(oloc, &object)?;
        } else {
            let nodes = self.link_nodes(object.extra.link)?;
            let (prev_nr, mut prev) = nodes
                .into_iter()
                .find(|(_, n)| n.next == link.anode)
                .ok_or_else(|| Error::corrupt(0, format!("link node {:#x} not threaded", link.anode)))?;
            prev.next = node.next;
            self.save_anode(prev_nr, prev)?;
        }
        self.free_anode(link.anode)
    }

    /// 删除有链接的对象：第一个链接接替成为对象
    pub(crate) fn promote_link(&mut self, dir: u32, loc: EntryLoc, object: &DirEntry) -> Result<()> {
        let first = object.extra.link;
        let node = self.get_anode(first)?;
        let ldir = node.clustersize;

        let ((), loc) = self.with_tracked(loc, |s| {
            let (lloc, link) = s
                .find_by_anode(ldir, first)?
                .ok_or_else(|| Error::corrupt(0, format!("link node {first:#x} has no entry")))?;

            let mut promoted = object.clone();
            promoted.name = link.name.clone();
            promoted.extra.link = node.next;
            s.change_entry(lloc, &promoted)?;

            for (nr, n) in s.link_nodes(node.next)? {
                s.set_link_dir(n.clustersize, nr, ldir)?;
            }
            s.free_anode(first)
        })?;
        self.remove_entry(loc)?;

        if object.kind == EntryType::Dir && ldir != dir {
            self.set_dir_parent(object.anode, ldir)?;
        }
        self.locks.moved_object(object.anode, ldir);
        log::debug!(
            "object {:#x} promoted into dir {ldir} after delete",
            object.anode
        );
        Ok(())
    }

    /// 修改`dir`中节点为`node`的链接目录项所记的对象目录
    fn set_link_dir(&mut self, dir: u32, node: u32, object_dir: u32) -> Result<()> {
        let (loc, mut link) = self
            .find_by_anode(dir, node)?
            .ok_or_else(|| Error::corrupt(0, format!("link node {node:#x} has no entry")))?;
        if link.extra.link != object_dir {
            link.extra.link = object_dir;
            self.change_entry(loc, &link)?;
        }
        Ok(())
    }

    /// 对象搬到新目录后更新其全部链接
    pub(crate) fn object_moved(&mut self, object: &DirEntry, dir: u32) -> Result<()> {
        if object.kind.is_link() || object.extra.link == 0 {
            return Ok(());
        }
        for (nr, n) in self.link_nodes(object.extra.link)? {
            self.set_link_dir(n.clustersize, nr, dir)?;
        }
        Ok(())
    }

    /// 链接目录项搬到新目录后更新其节点
    pub(crate) fn link_moved(&mut self, link: &DirEntry, dir: u32) -> Result<()> {
        let mut node = self.get_anode(link.anode)?;
        node.clustersize = dir;
        self.save_anode(link.anode, node)
    }

    /// 建立软链接，目标路径作为文件内容存放
    pub fn make_softlink(&mut self, name: &str, target: &str) -> Result<()> {
        self.guard(|s| {
            let data = encode_path(target)?;
            let (dir, lname) = s.resolve_parent(name)?;
            if s.search(dir, &lname)?.is_some() {
                return Err(Error::Exists);
            }

            let anode = s.alloc_anode(0)?;
            let blocks = s.layout.blocks_for(data.len() as u64) as u32;
            if let Err(e) = s.allocate_data(anode, blocks) {
                s.free_anode(anode)?;
                return Err(e);
            }
            let mut entry = DirEntry::new(EntryType::SoftLink, anode, &lname);
            entry.set_size(data.len() as u64);
            let result = s
                .write_at(anode, &mut None, 0, &data)
                .and_then(|()| s.add_entry(dir, &entry));
            if let Err(e) = result {
                s.free_blocks(anode, 0, FreeMode::FreeAnodes)?;
                return Err(e);
            }
            Ok(())
        })
    }

    /// 读出软链接的目标路径
    pub fn read_link(&mut self, path: &str) -> Result<String> {
        self.guard(|s| {
            let entry = match s.resolve(path)? {
                Object::Entry { entry, .. } if entry.kind == EntryType::SoftLink => entry,
                _ => return Err(Error::WrongType),
            };
            let mut data = vec![0u8; entry.size() as usize];
            s.read_at(entry.anode, &mut None, 0, &mut data)?;
            Ok(decode_name(&data))
        })
    }
}

fn encode_path(path: &str) -> Result<Vec<u8>> {
    if path.is_empty() {
        return Err(Error::InvalidName);
    }
    path.chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| Error::InvalidName))
        .collect()
}
