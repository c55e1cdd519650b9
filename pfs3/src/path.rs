//! 路径解析
//!
//! `卷名:a/b/c`形式，冒号前的部分表示从根目录开始；
//! 空的路径分量表示上一级目录，末尾的一个`/`被忽略。
//! 名字按Latin-1存放，比较时不区分大小写。

use block_dev::BlockDevice;

use crate::error::{Error, Result};
use crate::lock::EntryLoc;
use crate::session::Session;
use crate::volume::{DirEntry, EntryType, VolumeOption, anodes};

/// 根目录中的虚拟回收站目录名
pub(crate) const DELDIR_NAME: &[u8] = b".deldir";

/// 解析得到的对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Object {
    Root,
    DelDir,
    DelFile(u32),
    Entry {
        /// 所在目录的anode
        dir: u32,
        loc: EntryLoc,
        entry: DirEntry,
    },
}

/// 目录位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Place {
    Dir(u32),
    DelDir,
}

/// Amiga国际字符集的大写转换
pub(crate) fn intl_upper(c: u8) -> u8 {
    match c {
        b'a'..=b'z' => c - 0x20,
        0xE0..=0xFE if c != 0xF7 => c - 0x20,
        _ => c,
    }
}

pub(crate) fn names_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(&x, &y)| intl_upper(x) == intl_upper(y))
}

/// 名字转成Latin-1字节并检查合法性
pub(crate) fn encode_name(name: &str, max: usize) -> Result<Vec<u8>> {
    if name.is_empty() || name.contains([':', '/']) {
        return Err(Error::InvalidName);
    }
    let bytes = name
        .chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| Error::InvalidName))
        .collect::<Result<Vec<u8>>>()?;
    if bytes.len() > max {
        return Err(Error::NameTooLong);
    }
    Ok(bytes)
}

pub(crate) fn decode_name(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// 拆成（是否从根开始，分量）。最后一个空分量被丢弃，其余空分量表示上一级。
fn split_path(path: &str) -> (bool, Vec<&str>) {
    let (absolute, rest) = match path.find(':') {
        Some(colon) => (true, &path[colon + 1..]),
        None => (false, path),
    };
    let mut components: Vec<&str> = rest.split('/').collect();
    if components.last().is_some_and(|c| c.is_empty()) {
        components.pop();
    }
    (absolute, components)
}

impl<D: BlockDevice> Session<D> {
    fn deldir_enabled(&self) -> bool {
        self.root.has(VolumeOption::Deldir) && self.rext.deldirsize > 0
    }

    /// 沿一串目录分量走下去
    fn walk(&mut self, start: Place, components: &[&str]) -> Result<Place> {
        let mut place = start;
        for component in components {
            place = match place {
                Place::DelDir if component.is_empty() => Place::Dir(anodes::ROOTDIR),
                Place::DelDir => return Err(Error::NotADirectory),
                Place::Dir(dir) if component.is_empty() => {
                    let parent = self.dir_parent(dir)?;
                    if parent == 0 {
                        return Err(Error::NotFound);
                    }
                    Place::Dir(parent)
                }
                Place::Dir(dir) => match self.lookup(dir, component)? {
                    Object::DelDir => Place::DelDir,
                    Object::Entry { entry, .. } => Place::Dir(self.enter(&entry)?),
                    _ => return Err(Error::NotFound),
                },
            };
        }
        Ok(place)
    }

    /// 在目录中按名字查找，根目录下可找到回收站
    fn lookup(&mut self, dir: u32, component: &str) -> Result<Object> {
        let name = match encode_name(component, usize::MAX) {
            Ok(name) => name,
            Err(_) => return Err(Error::NotFound),
        };
        if dir == anodes::ROOTDIR && self.deldir_enabled() && names_equal(&name, DELDIR_NAME) {
            return Ok(Object::DelDir);
        }
        let (loc, entry) = self.search(dir, &name)?.ok_or(Error::NotFound)?;
        Ok(Object::Entry { dir, loc, entry })
    }

    /// 目录项指向的目录anode
    pub(crate) fn enter(&mut self, entry: &DirEntry) -> Result<u32> {
        match entry.kind {
            EntryType::Dir => Ok(entry.anode),
            EntryType::LinkDir => Ok(self.get_anode(entry.anode)?.blocknr),
            EntryType::SoftLink => Err(Error::IsSoftLink),
            _ => Err(Error::NotADirectory),
        }
    }

    fn start(&self, absolute: bool) -> Place {
        Place::Dir(if absolute { anodes::ROOTDIR } else { self.cwd })
    }

    /// 目录位置对应的对象
    fn place_object(&mut self, place: Place) -> Result<Object> {
        match place {
            Place::DelDir => Ok(Object::DelDir),
            Place::Dir(anodes::ROOTDIR) => Ok(Object::Root),
            Place::Dir(dir) => {
                let parent = self.dir_parent(dir)?;
                let (loc, entry) = self
                    .find_by_anode(parent, dir)?
                    .ok_or_else(|| Error::corrupt(0, format!("dir {dir} has no entry")))?;
                Ok(Object::Entry {
                    dir: parent,
                    loc,
                    entry,
                })
            }
        }
    }

    pub(crate) fn resolve(&mut self, path: &str) -> Result<Object> {
        let (absolute, components) = split_path(path);
        let start = self.start(absolute);
        match components.split_last() {
            None => self.place_object(start),
            Some((last, _)) if last.is_empty() => {
                let place = self.walk(start, &components)?;
                self.place_object(place)
            }
            Some((last, prefix)) => match self.walk(start, prefix)? {
                Place::Dir(dir) => self.lookup(dir, last),
                Place::DelDir => {
                    let name = encode_name(last, usize::MAX).map_err(|_| Error::NotFound)?;
                    let slot = self.find_deleted(&name)?.ok_or(Error::NotFound)?;
                    Ok(Object::DelFile(slot))
                }
            },
        }
    }

    /// 解析新对象所在的目录与名字
    pub(crate) fn resolve_parent(&mut self, path: &str) -> Result<(u32, Vec<u8>)> {
        let (absolute, components) = split_path(path);
        let (last, prefix) = components.split_last().ok_or(Error::InvalidName)?;
        let start = self.start(absolute);
        match self.walk(start, prefix)? {
            Place::Dir(dir) => {
                let name = encode_name(last, self.layout.max_name)?;
                if dir == anodes::ROOTDIR && self.deldir_enabled() && names_equal(&name, DELDIR_NAME)
                {
                    return Err(Error::Exists);
                }
                Ok((dir, name))
            }
            Place::DelDir => Err(Error::WriteProtected),
        }
    }

    /// 解析路径，必须是目录
    pub(crate) fn resolve_dir(&mut self, path: &str) -> Result<Place> {
        match self.resolve(path)? {
            Object::Root => Ok(Place::Dir(anodes::ROOTDIR)),
            Object::DelDir => Ok(Place::DelDir),
            Object::DelFile(_) => Err(Error::NotADirectory),
            Object::Entry { entry, .. } => Ok(Place::Dir(self.enter(&entry)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split() {
        assert_eq!((true, vec!["a", "b"]), split_path("Work:a/b"));
        assert_eq!((false, vec!["a"]), split_path("a/"));
        assert_eq!((false, vec![""]), split_path("/"));
        assert_eq!((false, vec!["", ""]), split_path("//"));
        assert_eq!((false, vec!["", "x"]), split_path("/x"));
        assert_eq!((false, vec!["a", "", "b"]), split_path("a//b"));
        assert_eq!((true, Vec::<&str>::new()), split_path(":"));
        assert_eq!((false, Vec::<&str>::new()), split_path(""));
    }

    #[test]
    fn case_folding() {
        assert!(names_equal(b"ReadMe", b"README"));
        assert!(names_equal(&[0xE4], &[0xC4]));
        assert!(!names_equal(&[0xF7], &[0xD7]));
        assert!(!names_equal(b"a", b"ab"));
    }

    #[test]
    fn names() {
        assert_eq!(b"caf\xe9".to_vec(), encode_name("café", 31).unwrap());
        assert_eq!("café", decode_name(b"caf\xe9"));
        assert!(matches!(encode_name("a/b", 31), Err(Error::InvalidName)));
        assert!(matches!(encode_name("", 31), Err(Error::InvalidName)));
        assert!(matches!(encode_name("€", 31), Err(Error::InvalidName)));
        assert!(matches!(encode_name(&"x".repeat(32), 31), Err(Error::NameTooLong)));
    }
}
