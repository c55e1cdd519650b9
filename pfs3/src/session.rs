//! 会话：一个已挂载卷的全部内存状态

use std::io;

use block_dev::BlockDevice;

use crate::cache::{BlockCache, CachedBlock, Key, Kind, Payload, SlotId};
use crate::error::{Error, Result};
use crate::geometry::{Geometry, Layout};
use crate::lock::LockTable;
use crate::volume::{
    self, AnodeBlock, BMIBLKID, BitmapBlock, BootBlock, DeldirBlock, DirBlock, IBLKID,
    IndexBlock, RootBlock, RootExtension, SBLKID, VolumeOption, anodes,
};

/// 延迟释放表的容量
pub(crate) const TBF_CACHE_SIZE: usize = 256;

/// 数据区分配状态
#[derive(Debug, Default)]
pub(crate) struct AllocData {
    /// 位图中空闲的数据块数
    pub clean_free: u32,
    /// 必须保留的空闲块数
    pub always_free: u32,
    /// 待释放的数据块区段（起始块号，块数）
    pub tbf: Vec<(u32, u32)>,
    pub tbf_capacity: usize,
    /// 提交后才归还的保留块
    pub res_tobefreed: Vec<u32>,
}

/// 已挂载的卷
///
/// 所有操作都经由`&mut self`串行执行，会话独占底层设备。
pub struct Session<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) layout: Layout,
    pub(crate) root: RootBlock,
    pub(crate) root_dirty: bool,
    pub(crate) rext: RootExtension,
    pub(crate) rext_dirty: bool,
    /// 保留区位图
    pub(crate) rbitmap: BitmapBlock,
    pub(crate) cache: BlockCache,
    pub(crate) alloc: AllocData,
    /// 每个anode块是否可能有空槽，只作提示
    pub(crate) anode_hint: Vec<bool>,
    pub(crate) locks: LockTable,
    /// 当前目录的anode
    pub(crate) cwd: u32,
    pub(crate) committing: bool,
    /// 正在进行的写时复制搬迁层数
    pub(crate) relocating: u32,
    aborted: bool,
}

/// 卷信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub block_size: u32,
    pub reserved_blksize: u32,
    /// 分区扇区数
    pub disk_size: u32,
    /// 数据区块数
    pub data_blocks: u32,
    /// 位图中的空闲数据块（不含待释放的块）
    pub blocks_free: u32,
    pub always_free: u32,
    pub reserved_total: u32,
    pub reserved_free: u32,
    pub datestamp: u32,
    pub deldir_slots: u32,
    pub super_index: bool,
}

impl<D: BlockDevice> Session<D> {
    pub(crate) fn new(dev: D, geometry: &Geometry, layout: Layout, root: RootBlock) -> Self {
        Self {
            dev,
            layout,
            root,
            root_dirty: false,
            rext: RootExtension::new(),
            rext_dirty: false,
            rbitmap: BitmapBlock::new(0, volume::INDEX_HEADER_SIZE),
            cache: BlockCache::new(geometry.cache_slots()),
            alloc: AllocData {
                tbf_capacity: TBF_CACHE_SIZE,
                ..AllocData::default()
            },
            anode_hint: Vec::new(),
            locks: LockTable::default(),
            cwd: anodes::ROOTDIR,
            committing: false,
            relocating: 0,
            aborted: false,
        }
    }

    /// 挂载卷：校验引导块与根块，读入根簇和根块扩展，
    /// 统计anode块，最后恢复挂起的操作。
    pub fn mount(mut dev: D, geometry: &Geometry) -> Result<Self> {
        geometry.validate()?;
        check_device(&dev, geometry)?;

        let bs = geometry.block_size as usize;
        let start = geometry.first_block();

        let mut buf = vec![0u8; bs];
        dev.read_block(start + u64::from(volume::BOOTBLOCK1), &mut buf)?;
        let boot = BootBlock::decode(&buf)
            .map_err(|e| Error::corrupt(volume::BOOTBLOCK1, e.to_string()))?;
        if !volume::is_pfs_disktype(boot.disktype) {
            log::error!("boot block disktype {:#010x}", boot.disktype);
            return Err(Error::NotPfs {
                disktype: boot.disktype,
            });
        }

        let mut buf = vec![0u8; volume::ROOT_SIZE.max(bs)];
        dev.read_block(start + u64::from(volume::ROOTBLOCK), &mut buf)?;
        let root = RootBlock::decode(&buf)
            .map_err(|e| Error::corrupt(volume::ROOTBLOCK, e.to_string()))?;
        if !volume::is_pfs_disktype(root.disktype) {
            return Err(Error::NotPfs {
                disktype: root.disktype,
            });
        }

        let rbs = root.reserved_blksize as usize;
        if !rbs.is_power_of_two() || rbs < bs || rbs < volume::ROOT_SIZE {
            return Err(Error::corrupt(
                volume::ROOTBLOCK,
                format!("reserved block size {rbs}"),
            ));
        }
        if u64::from(root.disksize) > geometry.total_blocks()
            || root.lastreserved >= root.disksize
            || root.firstreserved != volume::ROOTBLOCK
            || root.rblkcluster < 2
        {
            return Err(Error::corrupt(
                volume::ROOTBLOCK,
                "reserved area does not fit the partition",
            ));
        }

        let options = root.options();
        let mut layout = Layout::new(geometry, rbs);
        layout.disksize = root.disksize;
        layout.first_reserved = root.firstreserved;
        layout.last_reserved = root.lastreserved;
        layout.rblkcluster = u32::from(root.rblkcluster);
        layout.split_anodes = options.contains(VolumeOption::SplittedAnodes);
        layout.super_index = options.contains(VolumeOption::SuperIndex);
        layout.dir_ext = options.contains(VolumeOption::DirExtension);
        layout.large_files = options.contains(VolumeOption::LargeFile);

        let mut session = Self::new(dev, geometry, layout, root);
        session.read_root_cluster()?;

        if session.root.has(VolumeOption::Extension) && session.root.extension != 0 {
            let buf = session.read_reserved(session.root.extension)?;
            session.rext = RootExtension::decode(&buf)
                .map_err(|e| Error::corrupt(session.root.extension, e.to_string()))?;
        } else {
            // 没有扩展块的旧卷，补建一个
            log::warn!("volume has no root block extension, creating one");
            session.rext = RootExtension::new();
            session.rext.pfs2version = volume::PFS2_VERSION;
            session.rext.fnsize = 32;
            session.root.set_options(options | VolumeOption::Extension);
            session.mark_rext_dirty()?;
        }
        session.layout.max_name = match session.rext.fnsize {
            0 => 31,
            n => usize::from(n) - 1,
        };

        session.alloc.clean_free = session.root.blocksfree;
        session.alloc.always_free = session.root.alwaysfree;
        let anode_blocks = session.count_anode_blocks()?;
        session.anode_hint = vec![true; anode_blocks as usize];

        log::info!(
            "mounted {:?}: {} sectors, reserved {}..={}, {} free, {} anode blocks, datestamp {}",
            session.volume_name(),
            session.layout.disksize,
            session.layout.first_reserved,
            session.layout.last_reserved,
            session.alloc.clean_free,
            anode_blocks,
            session.root.datestamp
        );

        session.resume_postponed()?;
        Ok(session)
    }

    /// 刷新后交还底层设备
    pub fn unmount(mut self) -> Result<D> {
        let open = self.locks.open_files();
        if open > 0 {
            log::warn!("unmounting with {open} open files");
        }
        self.flush()?;
        log::info!(
            "unmounted {:?} ({} blocks cached)",
            self.volume_name(),
            self.cache.cached()
        );
        Ok(self.dev)
    }

    /// 把所有修改提交到磁盘
    pub fn flush(&mut self) -> Result<()> {
        self.guard(|s| s.update_disk())
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            name: self.volume_name(),
            block_size: self.layout.block_size as u32,
            reserved_blksize: self.layout.rbs as u32,
            disk_size: self.layout.disksize,
            data_blocks: self.layout.data_blocks(),
            blocks_free: self.alloc.clean_free,
            always_free: self.alloc.always_free,
            reserved_total: self.layout.num_reserved(),
            reserved_free: self.root.reserved_free,
            datestamp: self.root.datestamp,
            deldir_slots: self.deldir_capacity(),
            super_index: self.layout.super_index,
        }
    }

    /// 修改卷名
    pub fn relabel(&mut self, name: &str) -> Result<()> {
        self.guard(|s| {
            let name = crate::path::encode_name(name, 30)?;
            s.root.set_name(&name);
            s.rext.volume_date = crate::date::DateStamp::now();
            s.root_dirty = true;
            s.mark_rext_dirty()
        })
    }

    /// 会话是否因致命错误而作废
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn get_ref(&self) -> &D {
        &self.dev
    }

    pub(crate) fn volume_name(&self) -> String {
        crate::path::decode_name(&self.root.name())
    }

    /// 每个公开操作的外壳：先解开上一操作的锁，遇到致命错误则作废会话
    pub(crate) fn guard<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        self.cache.unlock_all();

        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("fatal error, session aborted: {e}");
                self.aborted = true;
            }
        }
        result
    }

    fn read_root_cluster(&mut self) -> Result<()> {
        let rbs = self.layout.rbs;
        let mut buf = vec![0u8; self.layout.rblkcluster as usize * rbs];
        let sector = self.device_sector(volume::ROOTBLOCK, buf.len())?;
        self.dev.read_block(sector, &mut buf)?;

        self.rbitmap = BitmapBlock::decode(&buf[rbs..])
            .map_err(|e| Error::corrupt(volume::ROOTBLOCK, format!("reserved bitmap: {e}")))?;
        Ok(())
    }

    /// 根簇（根块 + 保留区位图）始终写回原处
    pub(crate) fn write_root_cluster(&mut self) -> Result<()> {
        let rbs = self.layout.rbs;
        let mut buf = vec![0u8; self.layout.rblkcluster as usize * rbs];
        self.rbitmap.datestamp = self.root.datestamp;
        self.root
            .encode(&mut buf[..rbs])
            .and_then(|()| self.rbitmap.encode(&mut buf[rbs..]))
            .map_err(|e| Error::corrupt(volume::ROOTBLOCK, e.to_string()))?;

        let sector = self.device_sector(volume::ROOTBLOCK, buf.len())?;
        self.dev.write_block(sector, &buf)?;
        Ok(())
    }

    /// 分区内块号换算成设备扇区号，并做越界检查
    fn device_sector(&self, blocknr: u32, bytes: usize) -> Result<u64> {
        let sectors = bytes.div_ceil(self.layout.block_size) as u64;
        if u64::from(blocknr) + sectors > u64::from(self.layout.disksize) {
            log::error!("access to block {blocknr} (+{sectors}) outside partition");
            return Err(Error::OutOfRange {
                block: u64::from(blocknr),
            });
        }
        Ok(self.layout.partition_start + u64::from(blocknr))
    }

    pub(crate) fn read_reserved(&mut self, blocknr: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.layout.rbs];
        let sector = self.device_sector(blocknr, buf.len())?;
        log::trace!("read reserved block {blocknr}");
        self.dev.read_block(sector, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_reserved(&mut self, blocknr: u32, buf: &[u8]) -> Result<()> {
        let sector = self.device_sector(blocknr, buf.len())?;
        log::trace!("write reserved block {blocknr}");
        self.dev.write_block(sector, buf)?;
        Ok(())
    }

    /// 读连续的数据块，`buf`长度须为块大小的整数倍
    pub(crate) fn read_data(&mut self, blocknr: u32, buf: &mut [u8]) -> Result<()> {
        let sector = self.device_sector(blocknr, buf.len())?;
        self.dev.read_block(sector, buf)?;
        Ok(())
    }

    pub(crate) fn write_data(&mut self, blocknr: u32, buf: &[u8]) -> Result<()> {
        let sector = self.device_sector(blocknr, buf.len())?;
        self.dev.write_block(sector, buf)?;
        Ok(())
    }

    /// 在缓存中查找或从磁盘读入一个结构块
    pub(crate) fn load(&mut self, kind: Kind, seqnr: u32, blocknr: u32) -> Result<SlotId> {
        let key = match kind {
            Kind::Dir => Key::Dir(blocknr),
            kind => Key::Seq(kind, seqnr),
        };
        if let Some(slot) = self.cache.lookup(key) {
            return Ok(slot);
        }
        if blocknr == 0 || self.layout.reserved_index(blocknr).is_none() {
            return Err(Error::corrupt(
                blocknr,
                format!("{kind:?} {seqnr} points outside the reserved area"),
            ));
        }

        log::trace!("cache miss {key:?}, reading block {blocknr}");
        let buf = self.read_reserved(blocknr)?;
        let payload = decode_payload(kind, seqnr, blocknr, &buf)?;
        self.install(CachedBlock::new(kind, blocknr, seqnr, payload))
    }

    /// 分配保留块并建立一个新的脏块，调用者负责更新父指针
    pub(crate) fn create(&mut self, kind: Kind, seqnr: u32, payload: Payload) -> Result<SlotId> {
        let blocknr = self.alloc_reserved()?;
        let mut block = CachedBlock::new(kind, blocknr, seqnr, payload);
        block.dirty = true;
        let slot = self.install(block)?;
        self.cache.lock(slot);
        log::debug!("new {kind:?} block seqnr={seqnr} at {blocknr}");
        Ok(slot)
    }

    fn install(&mut self, block: CachedBlock) -> Result<SlotId> {
        let (slot, victim) = self.cache.reserve()?;
        if let Some(mut victim) = victim {
            if victim.dirty {
                // 被淘汰的脏块必须先落盘
                self.write_cached(&mut victim)?;
            }
        }
        self.cache.install(slot, block);
        Ok(slot)
    }

    pub(crate) fn write_cached(&mut self, block: &mut CachedBlock) -> Result<()> {
        let buf = block
            .payload
            .encode(self.root.datestamp, self.layout.rbs)
            .map_err(|e| Error::corrupt(block.blocknr, e.to_string()))?;
        self.write_reserved(block.blocknr, &buf)?;
        block.dirty = false;
        block.oldblocknr = 0;
        Ok(())
    }

    pub(crate) fn write_slot(&mut self, slot: SlotId) -> Result<()> {
        let (datestamp, rbs) = (self.root.datestamp, self.layout.rbs);
        let block = self.cache.block_mut(slot);
        let blocknr = block.blocknr;
        let buf = block
            .payload
            .encode(datestamp, rbs)
            .map_err(|e| Error::corrupt(blocknr, e.to_string()))?;
        self.write_reserved(blocknr, &buf)?;

        let block = self.cache.block_mut(slot);
        block.dirty = false;
        block.oldblocknr = 0;
        Ok(())
    }
}

pub(crate) fn check_device<D: BlockDevice>(dev: &D, geometry: &Geometry) -> Result<()> {
    if dev.sector_size() != geometry.block_size as usize {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "device sector size {} differs from block size {}",
                dev.sector_size(),
                geometry.block_size
            ),
        )));
    }
    if dev.sectors() <= geometry.last_block() {
        log::error!(
            "device has {} sectors, partition ends at {}",
            dev.sectors(),
            geometry.last_block()
        );
        return Err(Error::OutOfRange {
            block: geometry.last_block(),
        });
    }
    Ok(())
}

fn decode_payload(kind: Kind, seqnr: u32, blocknr: u32, buf: &[u8]) -> Result<Payload> {
    let corrupt = |detail: String| Error::corrupt(blocknr, format!("{kind:?} {seqnr}: {detail}"));

    let (payload, found) = match kind {
        Kind::Dir => {
            let db = DirBlock::decode(buf).map_err(|e| corrupt(e.to_string()))?;
            return Ok(Payload::Dir(db));
        }
        Kind::Anode => {
            let ab = AnodeBlock::decode(buf).map_err(|e| corrupt(e.to_string()))?;
            let found = ab.seqnr;
            (Payload::Anode(ab), found)
        }
        Kind::Index | Kind::Super | Kind::BitmapIndex => {
            let ib = IndexBlock::decode(buf).map_err(|e| corrupt(e.to_string()))?;
            let expected = match kind {
                Kind::Index => IBLKID,
                Kind::Super => SBLKID,
                _ => BMIBLKID,
            };
            if ib.id != expected {
                return Err(corrupt(format!("block id {:#06x}", ib.id)));
            }
            let found = ib.seqnr;
            (Payload::Index(ib), found)
        }
        Kind::Bitmap => {
            let bm = BitmapBlock::decode(buf).map_err(|e| corrupt(e.to_string()))?;
            let found = bm.seqnr;
            (Payload::Bitmap(bm), found)
        }
        Kind::Deldir => {
            let dd = DeldirBlock::decode(buf).map_err(|e| corrupt(e.to_string()))?;
            let found = dd.seqnr;
            (Payload::Deldir(dd), found)
        }
    };

    if found != seqnr {
        return Err(corrupt(format!("found sequence number {found}")));
    }
    Ok(payload)
}
