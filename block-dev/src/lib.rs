//! # 块设备接口层
//!
//! 块设备是以**扇区**为单位存储数据的设备，例如磁盘镜像、分区、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，实现了此特质的类型称为**块设备驱动**。
//!
//! 文件系统只通过块设备驱动读写设备，分区的几何信息由上层另行提供。

use std::io::{self, Read, Seek, SeekFrom, Write};

/// 块设备驱动特质
///
/// 一次读写可以跨越多个连续扇区，缓冲区长度必须是扇区大小的整数倍。
pub trait BlockDevice {
    /// 扇区的字节数
    fn sector_size(&self) -> usize;

    /// 设备的扇区总数
    fn sectors(&self) -> u64;

    fn read_block(&mut self, block_id: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_block(&mut self, block_id: u64, buf: &[u8]) -> io::Result<()>;

    /// 把设备自身的缓冲写到介质
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }

    fn sectors(&self) -> u64 {
        (**self).sectors()
    }

    fn read_block(&mut self, block_id: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_block(block_id, buf)
    }

    fn write_block(&mut self, block_id: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write_block(block_id, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// 以可定位的字节流（镜像文件、内存缓冲）充当块设备。
#[derive(Debug)]
pub struct BlockFile<S> {
    inner: S,
    sector_size: usize,
    sectors: u64,
}

impl<S: Read + Write + Seek> BlockFile<S> {
    /// 扇区总数取自流的当前长度，不足一扇区的尾部被忽略。
    pub fn new(mut inner: S, sector_size: usize) -> io::Result<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sector size {sector_size} is not a power of two"),
            ));
        }
        let len = inner.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner,
            sector_size,
            sectors: len / sector_size as u64,
        })
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> BlockFile<S> {
    fn check_span(&self, block_id: u64, len: usize) -> io::Result<u64> {
        if len % self.sector_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a complete block!",
            ));
        }

        let count = (len / self.sector_size) as u64;
        match block_id.checked_add(count) {
            Some(end) if end <= self.sectors => Ok(block_id * self.sector_size as u64),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "sectors {block_id}..{} beyond device end {}",
                    block_id.saturating_add(count),
                    self.sectors
                ),
            )),
        }
    }
}

impl<S: Read + Write + Seek> BlockDevice for BlockFile<S> {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn read_block(&mut self, block_id: u64, buf: &mut [u8]) -> io::Result<()> {
        let pos = self.check_span(block_id, buf.len())?;
        log::trace!("read sector={block_id} len={}", buf.len());
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.read_exact(buf)
    }

    fn write_block(&mut self, block_id: u64, buf: &[u8]) -> io::Result<()> {
        let pos = self.check_span(block_id, buf.len())?;
        log::trace!("write sector={block_id} len={}", buf.len());
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn cursor_round_trip() {
        let mut dev = BlockFile::new(Cursor::new(vec![0u8; 512 * 8]), 512).unwrap();
        assert_eq!(8, dev.sectors());

        let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        dev.write_block(3, &data).unwrap();

        let mut buf = vec![0u8; 1024];
        dev.read_block(3, &mut buf).unwrap();
        assert_eq!(data, buf);
    }

    #[test]
    fn rejects_partial_and_out_of_range() {
        let mut dev = BlockFile::new(Cursor::new(vec![0u8; 512 * 4]), 512).unwrap();

        let mut small = [0u8; 100];
        assert_eq!(
            io::ErrorKind::InvalidInput,
            dev.read_block(0, &mut small).unwrap_err().kind()
        );

        let mut two = [0u8; 1024];
        assert_eq!(
            io::ErrorKind::UnexpectedEof,
            dev.read_block(3, &mut two).unwrap_err().kind()
        );
    }

    #[test]
    fn file_backed() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(512 * 16).unwrap();
        let mut dev = BlockFile::new(file, 512).unwrap();

        dev.write_block(15, &[0xA5; 512]).unwrap();
        dev.flush().unwrap();

        let mut buf = [0u8; 512];
        dev.read_block(15, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xA5));
    }
}
