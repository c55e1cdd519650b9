//! 目录块与变长目录项
//!
//! 目录项紧密排列，`next`为零的位置即结束。
//! 在扩展目录模式下，目录项末尾附有打包的扩展字段：
//! 非零字段倒序写出，最后是一个标志字，第i位表示第i个字段存在。

use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, binrw};
use derive_more::Display;

use super::DIR_HEADER_SIZE;
use crate::date::DateStamp;

/// 目录项固定部分的长度（到名字之前）
const HEAD_SIZE: usize = 18;

/// 扩展字段已写入
const EXTRAFIELDSSET: u16 = 0x8000;

const EXTRA_WORDS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(i8)]
pub enum EntryType {
    File = -3,
    Dir = 2,
    SoftLink = 3,
    LinkDir = 4,
    LinkFile = -4,
    Rollover = -16,
}

impl EntryType {
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Dir | Self::LinkDir)
    }

    pub fn is_link(self) -> bool {
        matches!(self, Self::LinkDir | Self::LinkFile)
    }
}

impl TryFrom<i8> for EntryType {
    type Error = i8;

    fn try_from(raw: i8) -> Result<Self, Self::Error> {
        Ok(match raw {
            -3 => Self::File,
            2 => Self::Dir,
            3 => Self::SoftLink,
            4 => Self::LinkDir,
            -4 => Self::LinkFile,
            -16 => Self::Rollover,
            _ => return Err(raw),
        })
    }
}

/// 可选的扩展字段，全为零时不占空间
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtraFields {
    /// 硬链接：对象上为链接链头，链接项上为对象所在目录
    pub link: u32,
    pub uid: u16,
    pub gid: u16,
    /// 保护位的高24位
    pub prot: u32,
    /// 环形文件的逻辑长度
    pub virtualsize: u32,
    /// 环形文件的逻辑起点
    pub rollpointer: u32,
    /// 文件大小的高16位
    pub fsizex: u16,
}

impl ExtraFields {
    fn to_words(self) -> [u16; EXTRA_WORDS] {
        [
            (self.link >> 16) as u16,
            self.link as u16,
            self.uid,
            self.gid,
            (self.prot >> 16) as u16,
            (self.prot & 0xFF00) as u16,
            (self.virtualsize >> 16) as u16,
            self.virtualsize as u16,
            (self.rollpointer >> 16) as u16,
            self.rollpointer as u16,
            self.fsizex,
        ]
    }

    fn from_words(w: [u16; EXTRA_WORDS]) -> Self {
        let long = |hi: u16, lo: u16| (u32::from(hi) << 16) | u32::from(lo);
        Self {
            link: long(w[0], w[1]),
            uid: w[2],
            gid: w[3],
            prot: long(w[4], w[5]),
            virtualsize: long(w[6], w[7]),
            rollpointer: long(w[8], w[9]),
            fsizex: w[10],
        }
    }

    /// 打包后的字节数（含标志字）
    fn packed_len(self) -> usize {
        2 + 2 * self.to_words().iter().filter(|&&w| w != 0).count()
    }
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy)]
struct EntryHead {
    next: u8,
    kind: i8,
    anode: u32,
    fsize: u32,
    date: DateStamp,
    protection: u8,
    nlength: u8,
}

/// 解包后的目录项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryType,
    pub anode: u32,
    pub fsize: u32,
    pub date: DateStamp,
    /// 保护位的低8位
    pub protection: u8,
    pub name: Vec<u8>,
    pub comment: Vec<u8>,
    pub extra: ExtraFields,
}

impl DirEntry {
    pub fn new(kind: EntryType, anode: u32, name: &[u8]) -> Self {
        Self {
            kind,
            anode,
            fsize: 0,
            date: DateStamp::now(),
            protection: 0,
            name: name.to_vec(),
            comment: Vec::new(),
            extra: ExtraFields::default(),
        }
    }

    fn base_len(&self) -> usize {
        (20 + self.name.len() + self.comment.len()) & !1
    }

    pub fn encoded_len(&self, dir_ext: bool) -> usize {
        if dir_ext {
            self.base_len() + self.extra.packed_len()
        } else {
            self.base_len()
        }
    }

    pub fn size(&self) -> u64 {
        u64::from(self.fsize) | (u64::from(self.extra.fsizex) << 32)
    }

    pub fn set_size(&mut self, size: u64) {
        self.fsize = size as u32;
        self.extra.fsizex = (size >> 32) as u16;
    }

    pub fn full_protection(&self) -> u32 {
        (self.extra.prot & !0xFF) | u32::from(self.protection)
    }

    pub fn set_full_protection(&mut self, protection: u32) {
        self.protection = protection as u8;
        self.extra.prot = protection & !0xFF;
    }

    pub fn encode(&self, dir_ext: bool) -> BinResult<Vec<u8>> {
        let len = self.encoded_len(dir_ext);
        let mut buf = vec![0u8; len];

        let head = EntryHead {
            next: len as u8,
            kind: self.kind as i8,
            anode: self.anode,
            fsize: self.fsize,
            date: self.date,
            protection: self.protection,
            nlength: self.name.len() as u8,
        };
        head.write(&mut Cursor::new(&mut buf[..HEAD_SIZE]))?;

        let n = self.name.len();
        let c = self.comment.len();
        buf[HEAD_SIZE..HEAD_SIZE + n].copy_from_slice(&self.name);
        buf[HEAD_SIZE + n] = c as u8;
        buf[HEAD_SIZE + n + 1..HEAD_SIZE + n + 1 + c].copy_from_slice(&self.comment);

        if dir_ext {
            let mut flags = 0u16;
            let mut present = Vec::with_capacity(EXTRA_WORDS);
            for (i, word) in self.extra.to_words().into_iter().enumerate() {
                if word != 0 {
                    present.push(word);
                    flags |= 1 << i;
                }
            }

            let mut pos = self.base_len();
            for word in present.iter().rev() {
                buf[pos..pos + 2].copy_from_slice(&word.to_be_bytes());
                pos += 2;
            }
            buf[pos..pos + 2].copy_from_slice(&(flags | EXTRAFIELDSSET).to_be_bytes());
        }

        Ok(buf)
    }

    /// `buf`从目录项开头起，长度至少为`next`
    pub fn decode(buf: &[u8], dir_ext: bool) -> Option<Self> {
        if buf.len() < HEAD_SIZE + 2 {
            return None;
        }
        let head = EntryHead::read(&mut Cursor::new(&buf[..HEAD_SIZE])).ok()?;
        let next = head.next as usize;
        let n = head.nlength as usize;
        if next > buf.len() || HEAD_SIZE + n + 1 > next {
            return None;
        }
        let c = buf[HEAD_SIZE + n] as usize;
        let base = (20 + n + c) & !1;
        if base > next {
            return None;
        }

        let mut entry = Self {
            kind: EntryType::try_from(head.kind).ok()?,
            anode: head.anode,
            fsize: head.fsize,
            date: head.date,
            protection: head.protection,
            name: buf[HEAD_SIZE..HEAD_SIZE + n].to_vec(),
            comment: buf[HEAD_SIZE + n + 1..HEAD_SIZE + n + 1 + c].to_vec(),
            extra: ExtraFields::default(),
        };

        if dir_ext && next >= base + 2 {
            let word = |pos: usize| u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let mut pos = next - 2;
            let mut flags = word(pos);
            if flags & EXTRAFIELDSSET != 0 {
                let mut words = [0u16; EXTRA_WORDS];
                for w in words.iter_mut() {
                    if flags & 1 != 0 {
                        if pos < base + 2 {
                            return None;
                        }
                        pos -= 2;
                        *w = word(pos);
                    }
                    flags >>= 1;
                }
                entry.extra = ExtraFields::from_words(words);
            }
        }

        Some(entry)
    }
}

/// 目录块
#[binrw]
#[brw(big, magic = 0x4442u16)]
#[br(import(count: usize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirBlock {
    _not_used: u16,
    pub datestamp: u32,
    _not_used_2: [u16; 2],
    /// 所属目录的anode
    pub anodenr: u32,
    /// 父目录的anode
    pub parent: u32,
    #[br(count = count)]
    pub entries: Vec<u8>,
}

impl DirBlock {
    pub fn new(anodenr: u32, parent: u32, rbs: usize) -> Self {
        Self {
            _not_used: 0,
            datestamp: 0,
            _not_used_2: [0; 2],
            anodenr,
            parent,
            entries: vec![0; rbs - DIR_HEADER_SIZE],
        }
    }

    pub fn decode(buf: &[u8]) -> BinResult<Self> {
        let count = buf.len().saturating_sub(DIR_HEADER_SIZE);
        Self::read_args(&mut Cursor::new(buf), (count,))
    }

    pub fn encode(&self, buf: &mut [u8]) -> BinResult<()> {
        buf.fill(0);
        self.write(&mut Cursor::new(buf))
    }

    /// 每个目录项的（偏移，长度），遇到非法长度即停止
    pub fn spans(&self) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut offset = 0;
        while let Some(&next) = self.entries.get(offset) {
            let next = next as usize;
            if next == 0 {
                break;
            }
            if next < HEAD_SIZE + 2 || offset + next > self.entries.len() {
                log::warn!("malformed directory entry at offset {offset}");
                break;
            }
            spans.push((offset, next));
            offset += next;
        }
        spans
    }

    /// 已用字节数
    pub fn used(&self) -> usize {
        self.spans().last().map_or(0, |&(offset, len)| offset + len)
    }

    pub fn free_space(&self) -> usize {
        self.entries.len() - self.used()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.first().is_none_or(|&next| next == 0)
    }

    pub fn entry_len(&self, offset: usize) -> usize {
        self.entries.get(offset).copied().unwrap_or(0) as usize
    }

    pub fn entry(&self, offset: usize, dir_ext: bool) -> Option<DirEntry> {
        let len = self.entry_len(offset);
        if len == 0 || offset + len > self.entries.len() {
            return None;
        }
        DirEntry::decode(&self.entries[offset..offset + len], dir_ext)
    }

    /// 追加到末尾，返回偏移；空间不足返回`None`
    pub fn append(&mut self, bytes: &[u8]) -> Option<usize> {
        let offset = self.used();
        if offset + bytes.len() > self.entries.len() {
            return None;
        }
        self.entries[offset..offset + bytes.len()].copy_from_slice(bytes);
        Some(offset)
    }

    /// 删除`offset`处的目录项，其后的目录项左移，返回被删长度
    pub fn remove(&mut self, offset: usize) -> usize {
        let len = self.entry_len(offset);
        let used = self.used();
        if len == 0 || offset + len > used {
            return 0;
        }
        self.entries.copy_within(offset + len..used, offset);
        self.entries[used - len..used].fill(0);
        len
    }

    /// 原地替换`offset`处的目录项，其后的目录项随之移动。
    /// 空间不足时返回`false`且不做修改。
    pub fn replace(&mut self, offset: usize, bytes: &[u8]) -> bool {
        let old = self.entry_len(offset);
        let used = self.used();
        if old == 0 || used - old + bytes.len() > self.entries.len() {
            return false;
        }

        let tail = offset + old..used;
        let new_tail = offset + bytes.len();
        self.entries.copy_within(tail, new_tail);
        let new_used = used - old + bytes.len();
        if new_used < used {
            self.entries[new_used..used].fill(0);
        }
        self.entries[offset..offset + bytes.len()].copy_from_slice(bytes);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> DirEntry {
        let mut e = DirEntry::new(EntryType::File, 0x0001_0006, b"hello.txt");
        e.fsize = 11;
        e.date = DateStamp::new(100, 200, 30);
        e.comment = b"note".to_vec();
        e
    }

    #[test]
    fn base_layout() {
        let e = sample();
        let bytes = e.encode(false).unwrap();
        // (20 + 9 + 4) & !1
        assert_eq!(32, bytes.len());
        assert_eq!(32, bytes[0]);
        assert_eq!(-3i8 as u8, bytes[1]);
        assert_eq!(&[0, 1, 0, 6], &bytes[2..6]);
        assert_eq!(9, bytes[17]);
        assert_eq!(b"hello.txt", &bytes[18..27]);
        assert_eq!(4, bytes[27]);
        assert_eq!(b"note", &bytes[28..32]);
        assert_eq!(Some(e), DirEntry::decode(&bytes, false));
    }

    #[test]
    fn extra_fields_packing() {
        let mut e = sample();
        e.extra.uid = 0x0102;
        e.extra.fsizex = 0x0003;
        e.set_full_protection(0xAB00_0005);

        let bytes = e.encode(true).unwrap();
        // uid, prot hi, fsizex 三个字 + 标志字
        assert_eq!(32 + 8, bytes.len());
        let words: Vec<u16> = bytes[32..]
            .chunks(2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]))
            .collect();
        assert_eq!(vec![0x0003, 0xAB00, 0x0102, 0x8000 | (1 << 2) | (1 << 4) | (1 << 10)], words);

        let back = DirEntry::decode(&bytes, true).unwrap();
        assert_eq!(0xAB00_0005, back.full_protection());
        assert_eq!((3u64 << 32) | 11, back.size());
        assert_eq!(e, back);
    }

    #[test]
    fn flag_word_always_present() {
        let e = sample();
        let bytes = e.encode(true).unwrap();
        assert_eq!(34, bytes.len());
        assert_eq!(&[0x80, 0x00], &bytes[32..34]);
        assert_eq!(Some(e), DirEntry::decode(&bytes, true));
    }

    #[test]
    fn block_edit() {
        let mut db = DirBlock::new(5, 0, 1024);
        assert!(db.is_empty());
        let a = DirEntry::new(EntryType::Dir, 7, b"a").encode(true).unwrap();
        let b = DirEntry::new(EntryType::File, 8, b"bb").encode(true).unwrap();
        let c = DirEntry::new(EntryType::File, 9, b"ccc").encode(true).unwrap();

        assert_eq!(Some(0), db.append(&a));
        assert_eq!(Some(a.len()), db.append(&b));
        let c_off = db.append(&c).unwrap();
        assert_eq!(3, db.spans().len());

        let removed = db.remove(a.len());
        assert_eq!(b.len(), removed);
        assert_eq!(9, db.entry(c_off - removed, true).unwrap().anode);

        let mut longer = DirEntry::new(EntryType::Dir, 7, b"a");
        longer.comment = b"a much longer comment".to_vec();
        assert!(db.replace(0, &longer.encode(true).unwrap()));
        let spans = db.spans();
        assert_eq!(2, spans.len());
        assert_eq!(9, db.entry(spans[1].0, true).unwrap().anode);
        assert_eq!(db.used(), spans[1].0 + spans[1].1);
        assert!(db.entries[db.used()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn only_last_field_set() {
        let mut e = sample();
        e.extra.fsizex = 0x0042;
        let bytes = e.encode(true).unwrap();
        assert_eq!(32 + 4, bytes.len());
        assert_eq!(&[0x00, 0x42, 0x84, 0x00], &bytes[32..36]);
        assert_eq!(Some(e), DirEntry::decode(&bytes, true));
    }

    fn date() -> impl Strategy<Value = DateStamp> {
        (any::<u16>(), any::<u16>(), any::<u16>()).prop_map(|(d, m, t)| DateStamp::new(d, m, t))
    }

    fn extra() -> impl Strategy<Value = ExtraFields> {
        // 每个字段有一半概率为零，覆盖压缩的各种组合
        let word = || prop_oneof![Just(0u16), any::<u16>()];
        let long = || prop_oneof![Just(0u32), any::<u32>()];
        (long(), word(), word(), long(), long(), long(), word()).prop_map(
            |(link, uid, gid, prot, virtualsize, rollpointer, fsizex)| ExtraFields {
                link,
                uid,
                gid,
                prot: prot & !0xFF,
                virtualsize,
                rollpointer,
                fsizex,
            },
        )
    }

    fn entry() -> impl Strategy<Value = DirEntry> {
        (
            prop::sample::select(vec![
                EntryType::File,
                EntryType::Dir,
                EntryType::SoftLink,
                EntryType::LinkDir,
                EntryType::LinkFile,
                EntryType::Rollover,
            ]),
            any::<u32>(),
            any::<u32>(),
            date(),
            any::<u8>(),
            proptest::collection::vec(any::<u8>(), 1..=30),
            proptest::collection::vec(any::<u8>(), 0..=79),
            extra(),
        )
            .prop_map(
                |(kind, anode, fsize, date, protection, name, comment, extra)| DirEntry {
                    kind,
                    anode,
                    fsize,
                    date,
                    protection,
                    name,
                    comment,
                    extra,
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn entry_round_trip(e in entry()) {
            let bytes = e.encode(true).unwrap();
            prop_assert_eq!(e.encoded_len(true), bytes.len());
            prop_assert_eq!(bytes.len(), bytes[0] as usize);
            prop_assert_eq!(Some(e.clone()), DirEntry::decode(&bytes, true));

            let plain = DirEntry { extra: ExtraFields::default(), ..e };
            let bytes = plain.encode(false).unwrap();
            prop_assert_eq!(Some(plain), DirEntry::decode(&bytes, false));
        }

        #[test]
        fn block_round_trip(
            anodenr in any::<u32>(),
            parent in any::<u32>(),
            entries in proptest::collection::vec(entry(), 0..6),
        ) {
            let mut db = DirBlock::new(anodenr, parent, 1024);
            for e in &entries {
                db.append(&e.encode(true).unwrap()).unwrap();
            }
            let mut buf = vec![0u8; 1024];
            db.encode(&mut buf).unwrap();
            let back = DirBlock::decode(&buf).unwrap();

            let decoded: Vec<DirEntry> = back
                .spans()
                .into_iter()
                .filter_map(|(offset, _)| back.entry(offset, true))
                .collect();
            prop_assert_eq!(entries, decoded);
            prop_assert_eq!(db, back);
        }
    }
}
