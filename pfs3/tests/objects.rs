mod common;

use std::io::SeekFrom;

use common::*;
use pfs3::{DateStamp, EntryType, Error, FormatOptions, Geometry, Session, format, protection};

#[test]
fn hard_link_survives_object_delete() {
    let (mut s, geo) = volume();
    s.create_directory("one").unwrap();
    s.create_directory("two").unwrap();
    write_file(&mut s, "one/obj", b"shared contents");
    s.make_link("one/obj", "two/lnk").unwrap();
    s.make_link("two/lnk", "alias").unwrap();

    assert_eq!(EntryType::LinkFile, s.examine("two/lnk").unwrap().kind);
    assert_eq!(b"shared contents".to_vec(), read_file(&mut s, "two/lnk"));
    assert_eq!(b"shared contents".to_vec(), read_file(&mut s, "alias"));
    let report = s.verify().unwrap();
    assert_eq!(2, report.links);

    // 对象删除后第一个链接接替它
    s.delete("one/obj").unwrap();
    assert!(matches!(s.examine("one/obj"), Err(Error::NotFound)));
    let promoted = s.examine("alias").unwrap();
    assert_eq!(EntryType::File, promoted.kind);
    assert_eq!(EntryType::LinkFile, s.examine("two/lnk").unwrap().kind);

    let mut s = remount(s, &geo);
    assert_eq!(b"shared contents".to_vec(), read_file(&mut s, "two/lnk"));
    s.delete("two/lnk").unwrap();
    assert_eq!(b"shared contents".to_vec(), read_file(&mut s, "alias"));
    let report = s.verify().unwrap();
    assert_eq!(0, report.links);
    assert_eq!(1, report.files);
}

#[test]
fn directory_link() {
    let (mut s, _) = volume();
    s.create_directory("d").unwrap();
    s.create_directory("d/sub").unwrap();
    write_file(&mut s, "d/sub/x", b"x");
    s.make_link("d", "dl").unwrap();

    assert_eq!(EntryType::LinkDir, s.examine("dl").unwrap().kind);
    assert_eq!(vec!["x".to_string()], names(&mut s, "dl/sub"));
    assert!(matches!(s.make_link("d", "d/sub/loop"), Err(Error::InvalidMove)));
    assert!(matches!(s.rename("d", "d/sub/d"), Err(Error::InvalidMove)));

    s.delete("dl").unwrap();
    assert_eq!(vec!["x".to_string()], names(&mut s, "d/sub"));
    s.verify().unwrap();
}

#[test]
fn soft_link() {
    let (mut s, _) = volume();
    s.make_softlink("sl", "Test:A/f.txt").unwrap();
    assert_eq!("Test:A/f.txt", s.read_link("sl").unwrap());
    assert_eq!(EntryType::SoftLink, s.examine("sl").unwrap().kind);
    assert!(matches!(s.open("sl", false), Err(Error::IsSoftLink)));
    assert!(matches!(s.list_directory("sl"), Err(Error::IsSoftLink)));
    assert!(matches!(s.make_softlink("sl", "x"), Err(Error::Exists)));
    s.delete("sl").unwrap();
    s.verify().unwrap();
}

#[test]
fn rollover_keeps_last_bytes() {
    let (mut s, geo) = volume();
    s.create_rollover("log", 1024).unwrap();
    s.flush().unwrap();
    let free = s.info().blocks_free;

    let h = s.open("log", true).unwrap();
    s.write(h, &[b'a'; 600]).unwrap();
    s.write(h, &[b'b'; 600]).unwrap();
    assert!(matches!(s.set_file_size(h, 10), Err(Error::WrongType)));
    s.close(h).unwrap();
    s.flush().unwrap();
    assert_eq!(free, s.info().blocks_free);

    let mut s = remount(s, &geo);
    let data = read_file(&mut s, "log");
    assert_eq!(1024, data.len());
    assert!(data[..424].iter().all(|&b| b == b'a'));
    assert!(data[424..].iter().all(|&b| b == b'b'));
    assert_eq!(1024, s.examine("log").unwrap().size);

    let h = s.create_file("log").unwrap();
    s.close(h).unwrap();
    assert_eq!(0, s.examine("log").unwrap().size);
    assert_eq!(EntryType::Rollover, s.examine("log").unwrap().kind);
    s.verify().unwrap();
}

#[test]
fn attributes() {
    let (mut s, geo) = volume();
    write_file(&mut s, "f", b"data");
    let date = DateStamp::new(12000, 600, 25);
    s.set_comment("f", "a note").unwrap();
    s.set_owner("f", 5, 6).unwrap();
    s.set_date("f", date).unwrap();
    s.set_protection("f", protection::WRITE | 0x0100_0000).unwrap();

    let mut s = remount(s, &geo);
    let info = s.examine("f").unwrap();
    assert_eq!("a note", info.comment);
    assert_eq!((5, 6), (info.uid, info.gid));
    assert_eq!(date, info.date);
    assert_eq!(protection::WRITE | 0x0100_0000, info.protection);

    assert!(matches!(s.open("f", true), Err(Error::WriteProtected)));
    assert!(matches!(s.create_file("f"), Err(Error::WriteProtected)));
    assert_eq!(b"data".to_vec(), read_file(&mut s, "f"));

    s.set_protection("f", protection::READ | protection::DELETE).unwrap();
    assert!(matches!(s.open("f", false), Err(Error::ReadProtected)));
    assert!(matches!(s.delete("f"), Err(Error::DeleteProtected)));
    assert_eq!(222, Error::DeleteProtected.dos_code());

    let long = "c".repeat(80);
    assert!(matches!(s.set_comment("f", &long), Err(Error::CommentTooLong)));
    s.set_protection("f", 0).unwrap();
    s.delete("f").unwrap();
}

#[test]
fn policy_errors() {
    let (mut s, _) = volume();
    s.create_directory("d").unwrap();
    write_file(&mut s, "d/f", b"1");

    assert!(matches!(s.create_directory("D"), Err(Error::Exists)));
    assert!(matches!(s.delete("d"), Err(Error::DirectoryNotEmpty)));
    assert!(matches!(s.open("d", false), Err(Error::NotAFile)));
    assert!(matches!(s.list_directory("d/f"), Err(Error::NotADirectory)));
    assert!(matches!(s.create_file("d/f/g"), Err(Error::NotADirectory)));
    assert!(matches!(s.examine("nothing"), Err(Error::NotFound)));
    assert!(matches!(
        s.create_directory(&"n".repeat(40)),
        Err(Error::NameTooLong)
    ));
    assert!(matches!(s.delete(":"), Err(Error::WrongType)));

    let w = s.open("d/f", true).unwrap();
    assert!(matches!(s.open("d/f", true), Err(Error::InUse)));
    assert!(matches!(s.delete("d/f"), Err(Error::InUse)));
    assert!(matches!(s.seek(w, SeekFrom::Start(2)), Err(Error::SeekError)));
    s.close(w).unwrap();
    assert!(matches!(s.close(w), Err(Error::InvalidHandle)));

    s.change_directory("d").unwrap();
    assert!(matches!(s.delete(":d/f").and_then(|()| s.delete(":d")), Err(Error::InUse)));
    s.change_directory("/").unwrap();
    s.delete("d").unwrap();
    assert!(names(&mut s, ":").is_empty());
}

#[test]
fn rename_case_and_relative_paths() {
    let (mut s, _) = volume();
    s.create_directory("a").unwrap();
    s.create_directory("a/b").unwrap();
    write_file(&mut s, "a/b/file", b"z");

    s.rename("a/b/file", "a/b/FILE").unwrap();
    assert_eq!(vec!["FILE".to_string()], names(&mut s, "a/b"));

    s.change_directory("a/b").unwrap();
    s.rename("FILE", "//moved").unwrap();
    assert_eq!(vec!["a".to_string(), "moved".to_string()], names(&mut s, ":"));
    write_file(&mut s, "here", b"h");
    assert!(matches!(s.rename("here", ":moved"), Err(Error::Exists)));
    assert_eq!(b"h".to_vec(), read_file(&mut s, ":a/b/here"));
}

#[test]
fn deldir_resize_and_recycling() {
    let (mut s, geo) = volume();
    let slots = s.info().deldir_slots;
    assert!(slots > 0);

    for i in 0..slots + 3 {
        write_file(&mut s, &format!("t{i}"), &[i as u8; 100]);
        s.delete(&format!("t{i}")).unwrap();
    }
    // 环满后最旧的记录被覆盖
    let deleted = s.deleted_files().unwrap();
    assert_eq!(slots as usize, deleted.len());
    assert!(!deleted.iter().any(|d| d.name == "t0"));
    assert!(names(&mut s, ":").is_empty());
    assert!(names(&mut s, ":.deldir").contains(&format!("t{}", slots + 2)));

    s.set_deldir(0).unwrap();
    assert_eq!(0, s.info().deldir_slots);
    assert!(matches!(s.list_directory(".deldir"), Err(Error::NotFound)));
    s.flush().unwrap();
    let s = remount(s, &geo);
    assert_eq!(0, s.info().deldir_slots);

    let mut s = s;
    s.set_deldir(4).unwrap();
    assert!(s.deleted_files().unwrap().is_empty());
    assert!(matches!(s.open_deleted(0), Err(Error::DeldirSlotInvalid)));
    s.verify().unwrap();
}

#[test]
fn tiny_cache() {
    init_logger();
    let mut geo = Geometry::from_size(4 << 20, 512);
    geo.buffer_count = 4;
    let dev = format(device(4 << 20), &geo, "Tiny", &FormatOptions::default()).unwrap();
    let mut s = Session::mount(dev, &geo).unwrap();

    for d in 0..6 {
        s.create_directory(&format!("dir{d}")).unwrap();
        for f in 0..25 {
            write_file(&mut s, &format!("dir{d}/f{f}"), format!("{d}.{f}").as_bytes());
        }
    }
    for d in 0..6 {
        s.delete(&format!("dir{d}/f{d}")).unwrap();
    }

    let mut s = remount(s, &geo);
    for d in 0..6 {
        assert_eq!(24, names(&mut s, &format!("dir{d}")).len());
        assert_eq!(
            format!("{d}.7").into_bytes(),
            read_file(&mut s, &format!("dir{d}/f7"))
        );
    }
    let report = s.verify().unwrap();
    assert_eq!(6 * 24, report.files);
}

#[test]
fn relabel_and_reject_foreign() {
    let (mut s, geo) = volume();
    s.relabel("Work").unwrap();
    let s = remount(s, &geo);
    assert_eq!("Work", s.info().name);

    let blank = device(1 << 20);
    let geo = Geometry::from_size(1 << 20, 512);
    assert!(matches!(
        Session::mount(blank, &geo),
        Err(Error::NotPfs { .. })
    ));
}
