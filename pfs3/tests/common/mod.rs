#![allow(dead_code)]

use std::io::Cursor;

use pfs3::{BlockFile, FormatOptions, Geometry, Session, format};

pub type Mem = BlockFile<Cursor<Vec<u8>>>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn device(bytes: usize) -> Mem {
    BlockFile::new(Cursor::new(vec![0u8; bytes]), 512).unwrap()
}

/// 格式化一块内存盘并挂载
pub fn volume_with(bytes: usize, options: &FormatOptions) -> (Session<Mem>, Geometry) {
    init_logger();
    let geo = Geometry::from_size(bytes as u64, 512);
    let dev = format(device(bytes), &geo, "Test", options).unwrap();
    (Session::mount(dev, &geo).unwrap(), geo)
}

pub fn volume() -> (Session<Mem>, Geometry) {
    volume_with(4 << 20, &FormatOptions::default())
}

pub fn write_file(s: &mut Session<Mem>, path: &str, data: &[u8]) {
    let h = s.create_file(path).unwrap();
    assert_eq!(data.len(), s.write(h, data).unwrap());
    s.close(h).unwrap();
}

pub fn read_file(s: &mut Session<Mem>, path: &str) -> Vec<u8> {
    let h = s.open(path, false).unwrap();
    let mut data = Vec::new();
    let mut buf = [0u8; 700];
    loop {
        let n = s.read(h, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    s.close(h).unwrap();
    data
}

/// 卸载后重新挂载
pub fn remount(s: Session<Mem>, geo: &Geometry) -> Session<Mem> {
    let dev = s.unmount().unwrap();
    Session::mount(dev, geo).unwrap()
}

pub fn names(s: &mut Session<Mem>, dir: &str) -> Vec<String> {
    let mut names: Vec<String> = s
        .list_directory(dir)
        .unwrap()
        .into_iter()
        .map(|info| info.name)
        .collect();
    names.sort();
    names
}
