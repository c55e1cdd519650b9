mod common;

use std::cell::Cell;
use std::io::{self, Cursor};
use std::rc::Rc;

use common::*;
use pfs3::{BlockDevice, BlockFile, Error, ErrorKind, FormatOptions, Geometry, Session, format};

/// 可以随时让写操作失败的设备
struct Flaky {
    inner: Mem,
    broken: Rc<Cell<bool>>,
}

impl BlockDevice for Flaky {
    fn sector_size(&self) -> usize {
        self.inner.sector_size()
    }

    fn sectors(&self) -> u64 {
        self.inner.sectors()
    }

    fn read_block(&mut self, block_id: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_block(block_id, buf)
    }

    fn write_block(&mut self, block_id: u64, buf: &[u8]) -> io::Result<()> {
        if self.broken.get() {
            return Err(io::Error::other("medium error"));
        }
        self.inner.write_block(block_id, buf)
    }
}

#[test]
fn write_failure_aborts_session() {
    init_logger();
    let bytes = 4 << 20;
    let geo = Geometry::from_size(bytes as u64, 512);
    let dev = format(device(bytes), &geo, "Flaky", &FormatOptions::default()).unwrap();

    let broken = Rc::new(Cell::new(false));
    let flaky = Flaky {
        inner: dev,
        broken: Rc::clone(&broken),
    };
    let mut s = Session::mount(flaky, &geo).unwrap();

    let h = s.create_file("kept").unwrap();
    s.write(h, b"committed").unwrap();
    s.close(h).unwrap();
    s.flush().unwrap();

    s.create_directory("lost").unwrap();
    broken.set(true);
    let err = s.flush().unwrap_err();
    assert_eq!(ErrorKind::Fatal, err.kind());
    assert!(s.is_aborted());

    broken.set(false);
    assert!(matches!(s.examine("kept"), Err(Error::Aborted)));
    assert!(matches!(s.flush(), Err(Error::Aborted)));

    // 根块未被改写，盘上仍是上一次提交的状态
    let image = s.get_ref().inner.get_ref().get_ref().clone();
    let dev = BlockFile::new(Cursor::new(image), 512).unwrap();
    let mut s = Session::mount(dev, &geo).unwrap();
    assert_eq!(b"committed".to_vec(), read_file(&mut s, "kept"));
    assert!(matches!(s.examine("lost"), Err(Error::NotFound)));
    s.verify().unwrap();
}
