mod common;

use std::io::SeekFrom;

use common::*;
use pfs3::{EntryType, Error, FormatOptions};

#[test]
fn write_then_read_back() {
    let (mut s, geo) = volume();
    s.create_directory("A").unwrap();
    write_file(&mut s, "A/f.txt", b"hello world");
    assert_eq!(b"hello world".to_vec(), read_file(&mut s, "A/f.txt"));

    let mut s = remount(s, &geo);
    assert_eq!(b"hello world".to_vec(), read_file(&mut s, ":A/f.txt"));
    let info = s.examine("a/F.TXT").unwrap();
    assert_eq!("f.txt", info.name);
    assert_eq!(EntryType::File, info.kind);
    assert_eq!(11, info.size);
    s.verify().unwrap();
}

#[test]
fn directory_split() {
    let (mut s, geo) = volume();
    s.create_directory("many").unwrap();
    for i in 0..50 {
        write_file(&mut s, &format!("many/file_{i:02}"), format!("#{i}").as_bytes());
    }

    let listed = names(&mut s, "many");
    assert_eq!(50, listed.len());
    let mut s = remount(s, &geo);
    for i in 0..50 {
        let name = format!("file_{i:02}");
        assert!(listed.contains(&name));
        assert_eq!(
            format!("#{i}").into_bytes(),
            read_file(&mut s, &format!("many/{name}"))
        );
    }
    let report = s.verify().unwrap();
    assert_eq!(50, report.files);
    assert_eq!(1, report.directories);
}

#[test]
fn delete_into_deldir() {
    let (mut s, _) = volume();
    let data = vec![0x5Au8; 3000];
    write_file(&mut s, "victim", &data);
    s.flush().unwrap();
    let free = s.info().blocks_free;

    s.delete("victim").unwrap();
    assert!(matches!(s.examine("victim"), Err(Error::NotFound)));
    // 提交前位图不变
    assert_eq!(free, s.info().blocks_free);

    let deleted = s.deleted_files().unwrap();
    assert_eq!(1, deleted.len());
    assert_eq!("victim", deleted[0].name);
    assert_eq!(3000, deleted[0].size);

    s.flush().unwrap();
    assert_eq!(free + 6, s.info().blocks_free);

    // 块未被复用，内容仍可读出
    assert_eq!(data, read_file(&mut s, ".deldir/victim"));
    let h = s.open_deleted(deleted[0].slot).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(10, s.read(h, &mut buf).unwrap());
    assert!(matches!(s.write(h, b"x"), Err(Error::WriteProtected)));
    s.close(h).unwrap();
    s.verify().unwrap();
}

#[test]
fn rename_with_open_reader() {
    let (mut s, geo) = volume();
    s.create_directory("src").unwrap();
    s.create_directory("dst").unwrap();
    // 让两个目录都多于一块
    for i in 0..30 {
        write_file(&mut s, &format!("src/pad{i}"), b"p");
        write_file(&mut s, &format!("dst/pad{i}"), b"p");
    }
    let data: Vec<u8> = (0..3000).map(|i| (i % 253) as u8).collect();
    write_file(&mut s, "src/f.txt", &data);

    let h = s.open("src/f.txt", false).unwrap();
    let mut head = vec![0u8; 1000];
    assert_eq!(1000, s.read(h, &mut head).unwrap());

    s.rename("src/f.txt", "dst/g.txt").unwrap();
    s.flush().unwrap();
    assert!(!names(&mut s, "src").contains(&"f.txt".to_string()));
    assert!(names(&mut s, "dst").contains(&"g.txt".to_string()));

    let mut rest = vec![0u8; 3000];
    assert_eq!(2000, s.read(h, &mut rest).unwrap());
    assert_eq!(&data[1000..], &rest[..2000]);
    assert_eq!(1000, s.seek(h, SeekFrom::Start(1000)).unwrap());
    s.close(h).unwrap();

    let mut s = remount(s, &geo);
    assert_eq!(data, read_file(&mut s, "dst/g.txt"));
    assert!(matches!(s.open("src/f.txt", false), Err(Error::NotFound)));
    s.verify().unwrap();
}

#[test]
fn disk_full_mid_write() {
    let options = FormatOptions {
        deldir_blocks: 0,
        ..FormatOptions::default()
    };
    let (mut s, _) = volume_with(1 << 20, &options);
    let h = s.create_file("big").unwrap();
    let chunk = vec![0xC3u8; 32 * 1024];

    let mut written = 0u64;
    let err = loop {
        match s.write(h, &chunk) {
            Ok(n) => written += n as u64,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::DiskFull));
    assert!(written > 0);

    let free = s.info().blocks_free;
    assert!(matches!(s.write(h, &chunk), Err(Error::DiskFull)));
    assert_eq!(free, s.info().blocks_free);
    assert_eq!(written, s.tell(h).unwrap());
    assert_eq!(written, s.examine("big").unwrap().size);

    // 小块写入仍可用剩余空间
    if free > s.info().always_free {
        assert_eq!(512, s.write(h, &[1u8; 512]).unwrap());
        assert_eq!(written + 512, s.examine("big").unwrap().size);
    }
    s.close(h).unwrap();
    s.flush().unwrap();
    let report = s.verify().unwrap();
    assert_eq!(s.info().blocks_free, report.free_blocks);
}
