mod common;

use std::collections::BTreeMap;

use common::*;
use pfs3::{Error, FormatOptions, Geometry, Session, format};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Write { file: u8, len: u16 },
    Truncate { file: u8, len: u16 },
    Delete { file: u8 },
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8, 1u16..6000).prop_map(|(file, len)| Op::Write { file, len }),
        2 => (0u8..8, 0u16..4000).prop_map(|(file, len)| Op::Truncate { file, len }),
        2 => (0u8..8).prop_map(|file| Op::Delete { file }),
        1 => Just(Op::Flush),
    ]
}

/// 名字只用小写字母和数字，彼此不会因大小写而相同
fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,29}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn free_count_matches_bitmap(ops in proptest::collection::vec(op(), 1..40)) {
        let (mut s, geo) = volume();
        let mut sizes = BTreeMap::new();

        for op in ops {
            match op {
                Op::Write { file, len } => {
                    let path = format!("f{file}");
                    let h = match s.open(&path, true) {
                        Ok(h) => h,
                        Err(Error::NotFound) => s.create_file(&path).unwrap(),
                        Err(e) => panic!("{e}"),
                    };
                    let size = sizes.entry(file).or_insert(0u64);
                    s.seek(h, std::io::SeekFrom::End(0)).unwrap();
                    s.write(h, &vec![file; usize::from(len)]).unwrap();
                    *size += u64::from(len);
                    s.close(h).unwrap();
                }
                Op::Truncate { file, len } => {
                    if let Some(size) = sizes.get_mut(&file) {
                        let h = s.open(&format!("f{file}"), true).unwrap();
                        s.set_file_size(h, u64::from(len)).unwrap();
                        *size = u64::from(len);
                        s.close(h).unwrap();
                    }
                }
                Op::Delete { file } => {
                    if sizes.remove(&file).is_some() {
                        s.delete(&format!("f{file}")).unwrap();
                    }
                }
                Op::Flush => s.flush().unwrap(),
            }
            s.verify().unwrap();
        }

        s.flush().unwrap();
        let report = s.verify().unwrap();
        prop_assert_eq!(s.info().blocks_free, report.free_blocks);
        prop_assert_eq!(sizes.len() as u32, report.files);

        let mut s = remount(s, &geo);
        let after = s.verify().unwrap();
        prop_assert_eq!(report, after);
        for (file, size) in sizes {
            prop_assert_eq!(size, s.examine(&format!("f{file}")).unwrap().size);
        }
    }

    #[test]
    fn search_ignores_block_split(
        entries in proptest::collection::btree_map(name(), 0u16..600, 1..80),
        removed in proptest::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        // 同样的目录分别放进1 KiB与4 KiB的保留块
        let mut small = packed(1024);
        let mut large = packed(4096);
        for s in [&mut small, &mut large] {
            s.create_directory("d").unwrap();
            for (name, len) in &entries {
                write_file(s, &format!("d/{name}"), &vec![7u8; usize::from(*len)]);
            }
        }

        let names: Vec<&String> = entries.keys().collect();
        let removed: Vec<&String> = removed.iter().map(|i| *i.get(&names)).collect();
        for s in [&mut small, &mut large] {
            for name in &removed {
                match s.delete(&format!("d/{name}")) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => panic!("{e}"),
                }
            }
        }

        for s in [&mut small, &mut large] {
            for (name, len) in &entries {
                let found = s.examine(&format!("d/{}", name.to_uppercase()));
                if removed.contains(&name) {
                    prop_assert!(matches!(found, Err(Error::NotFound)));
                } else {
                    let info = found.unwrap();
                    prop_assert_eq!(name, &info.name);
                    prop_assert_eq!(u64::from(*len), info.size);
                }
            }
        }
        prop_assert_eq!(names_of(&mut small), names_of(&mut large));
    }
}

fn packed(rbs: u16) -> Session<Mem> {
    init_logger();
    let mut geo = Geometry::from_size(8 << 20, 512);
    geo.reserved_blksize = Some(rbs);
    let options = FormatOptions {
        deldir_blocks: 0,
        ..FormatOptions::default()
    };
    let dev = format(device(8 << 20), &geo, "Pack", &options).unwrap();
    Session::mount(dev, &geo).unwrap()
}

fn names_of(s: &mut Session<Mem>) -> Vec<String> {
    names(s, "d")
}
