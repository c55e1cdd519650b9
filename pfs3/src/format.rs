//! 格式化
//!
//! 先在内存中建好一个会话，用正常的分配路径建出位图、anode与根目录，
//! 提交一次后再写引导块。引导块最后落盘，中途失败的分区不会被认作PFS卷。

use block_dev::BlockDevice;

use crate::cache::{Kind, Payload};
use crate::date::DateStamp;
use crate::error::{Error, Result};
use crate::geometry::{FormatOptions, Geometry, Layout, MAX_NUM_RESERVED, MIN_NUM_RESERVED};
use crate::path::encode_name;
use crate::session::{Session, check_device};
use crate::volume::{
    self, BMIBLKID, BitmapBlock, BootBlock, ID_PFS_DISK, INDEX_HEADER_SIZE, IndexBlock,
    RootBlock, RootExtension, SMALL_BITMAP_SLOTS, VolumeOption, anodes,
};

/// 按分区大小选择保留块大小
fn default_reserved_blksize(total: u64) -> usize {
    if total >= 1 << 28 {
        4096
    } else if total >= 1 << 27 {
        2048
    } else {
        1024
    }
}

/// 计算保留区布局，返回（保留块数，根簇块数）
fn reserved_area(total: u32, rescluster: u32, rbs: usize) -> Result<(u32, u32)> {
    let wanted = (total / rescluster / 32).clamp(MIN_NUM_RESERVED, MAX_NUM_RESERVED);
    let numreserved = wanted.min(total / 2 / rescluster);
    if numreserved < MIN_NUM_RESERVED {
        log::error!("partition of {total} blocks is too small");
        return Err(Error::OutOfRange {
            block: u64::from(total),
        });
    }
    let bitmap_bytes = INDEX_HEADER_SIZE + 4 * numreserved.div_ceil(32) as usize;
    let rblkcluster = 1 + bitmap_bytes.div_ceil(rbs) as u32;
    Ok((numreserved, rblkcluster))
}

/// 在分区上建立空的PFS3卷，返回底层设备
pub fn format<D: BlockDevice>(
    dev: D,
    geometry: &Geometry,
    name: &str,
    options: &FormatOptions,
) -> Result<D> {
    geometry.validate()?;
    check_device(&dev, geometry)?;
    let name = encode_name(name, 30)?;

    let bs = geometry.block_size as usize;
    let total = geometry.total_blocks() as u32;
    let rbs = match geometry.reserved_blksize {
        Some(rbs) => usize::from(rbs),
        None => default_reserved_blksize(u64::from(total)),
    }
    .max(bs);
    if !rbs.is_power_of_two() || rbs < volume::ROOT_SIZE || rbs > 1 << 15 {
        log::error!("unsupported reserved block size {rbs}");
        return Err(Error::OutOfRange { block: 0 });
    }

    let mut layout = Layout::new(geometry, rbs);
    let (numreserved, rblkcluster) = reserved_area(total, layout.rescluster, rbs)?;
    layout.first_reserved = volume::ROOTBLOCK;
    layout.last_reserved = volume::ROOTBLOCK + numreserved * layout.rescluster - 1;
    layout.rblkcluster = rblkcluster;
    layout.split_anodes = options.split_anodes;
    layout.dir_ext = options.dir_extension;
    layout.large_files = options.large_files && options.dir_extension;
    layout.max_name = if options.long_filenames { 107 } else { 31 };

    let index_blocks = layout.bitmap_blocks().div_ceil(layout.index_per_block);
    let needs_super = index_blocks as usize > SMALL_BITMAP_SLOTS;
    layout.super_index = match options.super_index {
        Some(false) if needs_super => {
            log::error!("{index_blocks} bitmap index blocks need super index mode");
            return Err(Error::OutOfRange {
                block: u64::from(total),
            });
        }
        Some(forced) => forced,
        None => needs_super,
    };
    if index_blocks as usize > volume::ROOT_INDEX_SLOTS {
        return Err(Error::OutOfRange {
            block: u64::from(total),
        });
    }

    let mut flags = VolumeOption::HardDisk
        | VolumeOption::Extension
        | VolumeOption::Datestamp
        | VolumeOption::SizeField
        | VolumeOption::ExtRoving;
    for (on, flag) in [
        (layout.split_anodes, VolumeOption::SplittedAnodes),
        (layout.dir_ext, VolumeOption::DirExtension),
        (layout.super_index, VolumeOption::SuperIndex),
        (options.long_filenames, VolumeOption::LongFn),
        (layout.large_files, VolumeOption::LargeFile),
    ] {
        if on {
            flags |= flag;
        }
    }

    let data = layout.data_blocks();
    let mut root = RootBlock::new();
    root.disktype = ID_PFS_DISK;
    root.set_options(flags);
    root.creation = DateStamp::now();
    root.set_name(&name);
    root.firstreserved = layout.first_reserved;
    root.lastreserved = layout.last_reserved;
    root.reserved_free = numreserved - rblkcluster;
    root.reserved_blksize = rbs as u16;
    root.rblkcluster = rblkcluster as u16;
    root.blocksfree = data;
    root.alwaysfree = data / 20;
    root.disksize = total;

    let mut session = Session::new(dev, geometry, layout, root);
    session.build(numreserved, options)?;

    let mut boot = vec![0u8; 2 * bs];
    BootBlock {
        disktype: ID_PFS_DISK,
    }
    .encode(&mut boot)
    .map_err(|e| Error::corrupt(volume::BOOTBLOCK1, e.to_string()))?;
    session.write_data(volume::BOOTBLOCK1, &boot)?;
    session.dev.flush()?;

    let info = session.info();
    log::info!(
        "formatted {:?}: {} blocks of {bs} bytes, {} reserved ({} bytes each), {} data blocks",
        info.name,
        total,
        numreserved,
        rbs,
        info.data_blocks
    );
    Ok(session.dev)
}

impl<D: BlockDevice> Session<D> {
    fn build(&mut self, numreserved: u32, options: &FormatOptions) -> Result<()> {
        let rbs = self.layout.rbs;
        let rblkcluster = self.layout.rblkcluster;

        // 根簇和超出保留区的位都标为已用
        self.rbitmap = BitmapBlock::new(0, (rblkcluster as usize - 1) * rbs);
        let capacity = self.rbitmap.bitmap.len() as u32 * 32;
        for bit in (0..rblkcluster).chain(numreserved..capacity) {
            self.rbitmap.set_used(bit);
        }

        let now = DateStamp::now();
        self.rext = RootExtension::new();
        self.rext.pfs2version = volume::PFS2_VERSION;
        self.rext.fnsize = self.layout.max_name as u16 + 1;
        self.rext.root_date = now;
        self.rext.volume_date = now;
        self.rext.dd_creation = now;
        self.mark_rext_dirty()?;

        self.alloc.clean_free = self.root.blocksfree;
        self.alloc.always_free = self.root.alwaysfree;

        self.build_bitmap()?;

        // anode 0..4保留不用，5是根目录
        for _ in 0..anodes::ROOTDIR {
            self.alloc_anode(0)?;
        }
        let rootdir = self.new_directory(0)?;
        if rootdir != anodes::ROOTDIR {
            return Err(Error::corrupt(
                volume::ROOTBLOCK,
                format!("root directory got anode {rootdir}"),
            ));
        }

        if options.deldir_blocks > 0 {
            self.resize_deldir(options.deldir_blocks)?;
        }
        self.update_disk()
    }

    /// 建立数据区位图及其索引块，数据区之后的位标为已用
    fn build_bitmap(&mut self) -> Result<()> {
        let bpb = self.layout.blocks_per_bitmap();
        let ipb = self.layout.index_per_block;
        let data = self.layout.data_blocks();
        let count = self.layout.bitmap_blocks();

        for mi in 0..count.div_ceil(ipb) {
            let block = IndexBlock::new(BMIBLKID, mi, self.layout.rbs);
            let mi_slot = self.create(Kind::BitmapIndex, mi, Payload::Index(block))?;

            for seqnr in mi * ipb..((mi + 1) * ipb).min(count) {
                let mut bitmap = BitmapBlock::new(seqnr, self.layout.rbs);
                let base = seqnr * bpb;
                for bit in data.saturating_sub(base).min(bpb)..bpb {
                    bitmap.set_used(bit);
                }
                let slot = self.create(Kind::Bitmap, seqnr, Payload::Bitmap(bitmap))?;
                let blocknr = self.cache.block(slot).blocknr;
                self.cache.unlock(slot);
                self.cache.index_mut(mi_slot).index[(seqnr % ipb) as usize] = blocknr;
            }

            let blocknr = self.cache.block(mi_slot).blocknr;
            self.root.set_bitmap_index(mi as usize, blocknr);
            self.cache.unlock(mi_slot);
        }
        log::debug!("built {count} bitmap blocks for {data} data blocks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_sizing() {
        // 4 MiB，512字节扇区，1 KiB保留块
        let (num, cluster) = reserved_area(8192, 2, 1024).unwrap();
        assert_eq!(128, num);
        assert_eq!(2, cluster);

        // 小分区取下限
        let (num, _) = reserved_area(2048, 2, 1024).unwrap();
        assert_eq!(MIN_NUM_RESERVED, num);

        assert!(reserved_area(200, 2, 1024).is_err());
        assert_eq!(1024, default_reserved_blksize(1 << 20));
        assert_eq!(4096, default_reserved_blksize(1 << 28));
    }
}
