mod cli;

use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::path::Path;

use block_dev::BlockFile;
use clap::Parser;
use pfs3::{EntryType, FormatOptions, Geometry, Session};
use typed_bytesize::ByteSizeIec;

pub use self::cli::{Cli, Command};

type Volume = Session<BlockFile<File>>;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    log::info!("image={:?}", cli.image);

    if let Command::Format {
        size,
        name,
        deldir,
        long_names,
    } = &cli.command
    {
        let options = FormatOptions {
            deldir_blocks: *deldir,
            long_filenames: *long_names,
            ..FormatOptions::default()
        };
        return create_image(&cli, ByteSizeIec::mib(*size).0, name, &options);
    }

    let mut volume = mount(&cli)?;
    run(&mut volume, cli.command)?;
    volume.unmount()?;
    Ok(())
}

fn geometry(cli: &Cli, bytes: u64) -> Geometry {
    let mut geo = Geometry::from_size(bytes, cli.block_size);
    geo.buffer_count = cli.buffers;
    geo
}

fn create_image(
    cli: &Cli,
    bytes: u64,
    name: &str,
    options: &FormatOptions,
) -> Result<(), Box<dyn Error>> {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.image)?;
    fd.set_len(bytes)?;

    let dev = BlockFile::new(fd, cli.block_size as usize)?;
    pfs3::format(dev, &geometry(cli, bytes), name, options)?;
    println!("formatted {name:?} ({bytes} bytes)");
    Ok(())
}

fn mount(cli: &Cli) -> Result<Volume, Box<dyn Error>> {
    let fd = OpenOptions::new().read(true).write(true).open(&cli.image)?;
    let bytes = fd.metadata()?.len();
    let dev = BlockFile::new(fd, cli.block_size as usize)?;
    Ok(Session::mount(dev, &geometry(cli, bytes))?)
}

fn run(volume: &mut Volume, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Format { .. } => return Err("cannot format a mounted volume".into()),
        Command::Pack { source } => pack(volume, &source)?,
        Command::Info => {
            let info = volume.info();
            println!("{info:#?}");
        }
        Command::Ls { path } => {
            for entry in volume.list_directory(&path)? {
                let kind = match entry.kind {
                    EntryType::Dir => "dir",
                    EntryType::File => "file",
                    EntryType::SoftLink => "softlink",
                    EntryType::LinkFile | EntryType::LinkDir => "link",
                    EntryType::Rollover => "rollover",
                };
                println!("{kind:>8} {:>10} {}", entry.size, entry.name);
            }
        }
        Command::Put { host, path } => put(volume, &host, &path)?,
        Command::Get { path, host } => {
            let h = volume.open(&path, false)?;
            let mut data = Vec::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = volume.read(h, &mut buf)?;
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            volume.close(h)?;
            fs::write(host, data)?;
        }
        Command::Mkdir { path } => volume.create_directory(&path)?,
        Command::Rm { path } => volume.delete(&path)?,
        Command::Mv { from, to } => volume.rename(&from, &to)?,
        Command::Deldir { blocks } => volume.set_deldir(blocks)?,
        Command::Check => {
            let report = volume.verify()?;
            println!("{report:#?}");
        }
    }
    Ok(())
}

fn put(volume: &mut Volume, host: &Path, path: &str) -> Result<(), Box<dyn Error>> {
    let data = fs::read(host)?;
    let h = volume.create_file(path)?;
    volume.write(h, &data)?;
    volume.close(h)?;
    log::info!("{host:?} -> {path:?} ({} bytes)", data.len());
    Ok(())
}

fn pack(volume: &mut Volume, source: &Path) -> Result<(), Box<dyn Error>> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| format!("file name {name:?} is not UTF-8"))?;
        put(volume, &entry.path(), &format!(":{name}"))?;
    }
    Ok(())
}
