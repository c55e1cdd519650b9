//! 一致性检查
//!
//! 只读地遍历整棵目录树，核对anode链、位图与空闲计数。发现问题即报告损坏，不做修复。

use block_dev::BlockDevice;

use crate::error::{Error, Result};
use crate::session::Session;
use crate::volume::{EntryType, anodes};

/// 检查结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub files: u32,
    pub directories: u32,
    pub links: u32,
    /// 活动对象占用的数据块
    pub data_blocks_used: u64,
    /// 位图中的空闲块
    pub free_blocks: u32,
}

impl<D: BlockDevice> Session<D> {
    /// 检查卷的结构
    pub fn verify(&mut self) -> Result<CheckReport> {
        self.guard(|s| s.check_volume())
    }

    fn check_volume(&mut self) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let mut owner = vec![0u32; self.layout.data_blocks() as usize];
        let mut pending = vec![(anodes::ROOTDIR, 0u32)];

        while let Some((dir, parent)) = pending.pop() {
            for blocknr in self.dir_blocks(dir)? {
                let slot = self.dir_slot(blocknr)?;
                let block = self.cache.dir(slot);
                if block.anodenr != dir || block.parent != parent {
                    return Err(Error::corrupt(
                        blocknr,
                        format!(
                            "directory block owned by {}/{} instead of {dir}/{parent}",
                            block.anodenr, block.parent
                        ),
                    ));
                }
            }

            for (loc, entry) in self.list_entries(dir)? {
                match entry.kind {
                    EntryType::Dir => {
                        report.directories += 1;
                        pending.push((entry.anode, dir));
                    }
                    EntryType::LinkFile | EntryType::LinkDir => {
                        report.links += 1;
                        let node = self.get_anode(entry.anode)?;
                        if node.clustersize != dir || node.blocknr == 0 {
                            return Err(Error::corrupt(
                                loc.block,
                                format!("link node {:#x} is inconsistent", entry.anode),
                            ));
                        }
                    }
                    EntryType::File | EntryType::SoftLink | EntryType::Rollover => {
                        report.files += 1;
                        let size = match entry.kind {
                            EntryType::Rollover => u64::from(entry.fsize),
                            _ => entry.size(),
                        };
                        report.data_blocks_used +=
                            self.check_chain(entry.anode, size, &mut owner)?;
                    }
                }
            }
        }

        report.free_blocks = self.bitmap_free()?;
        if report.free_blocks != self.alloc.clean_free {
            return Err(Error::corrupt(
                0,
                format!(
                    "bitmap has {} free blocks, counter says {}",
                    report.free_blocks, self.alloc.clean_free
                ),
            ));
        }

        log::info!("verified: {report:?}");
        Ok(report)
    }

    /// 核对一条数据链：长度与大小相符，块不重复使用且在位图中已分配
    fn check_chain(&mut self, head: u32, size: u64, owner: &mut [u32]) -> Result<u64> {
        let start = self.layout.bitmap_start();
        let bpb = self.layout.blocks_per_bitmap();
        let mut blocks = 0u64;

        for (_, anode) in self.collect_chain(head)? {
            if anode.is_uninit() {
                continue;
            }
            for blocknr in anode.blocknr..anode.blocknr + anode.clustersize {
                let bit = blocknr
                    .checked_sub(start)
                    .filter(|&bit| (bit as usize) < owner.len())
                    .ok_or_else(|| {
                        Error::corrupt(blocknr, format!("anode {head:#x} points outside data area"))
                    })?;
                if owner[bit as usize] != 0 {
                    return Err(Error::corrupt(
                        blocknr,
                        format!("used by both {:#x} and {head:#x}", owner[bit as usize]),
                    ));
                }
                owner[bit as usize] = head;

                let slot = self.bitmap_slot(bit / bpb)?;
                if self.cache.bitmap(slot).is_free(bit % bpb) {
                    return Err(Error::corrupt(
                        blocknr,
                        format!("block of anode {head:#x} is marked free"),
                    ));
                }
            }
            blocks += u64::from(anode.clustersize);
        }

        if blocks != self.layout.blocks_for(size) {
            return Err(Error::corrupt(
                0,
                format!("anode {head:#x} has {blocks} blocks for {size} bytes"),
            ));
        }
        Ok(blocks)
    }
}
