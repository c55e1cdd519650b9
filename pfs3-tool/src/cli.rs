use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
pub struct Cli {
    /// Volume image
    #[arg(long, short)]
    pub image: PathBuf,

    /// Sector size of the image
    #[arg(long, default_value_t = 512)]
    pub block_size: u32,

    /// Number of cache buffers
    #[arg(long, default_value_t = 64)]
    pub buffers: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a new image and format it
    Format {
        /// Image size in MiB
        #[arg(long, default_value_t = 32)]
        size: u64,

        #[arg(long, default_value = "PFS3")]
        name: String,

        /// Deleted-files directory blocks, 0 to disable
        #[arg(long, default_value_t = 2)]
        deldir: u16,

        /// Allow names up to 107 characters
        #[arg(long)]
        long_names: bool,
    },
    /// Copy every file of a host directory into the volume root
    Pack { source: PathBuf },
    /// Show volume information
    Info,
    /// List a directory
    Ls {
        #[arg(default_value = ":")]
        path: String,
    },
    /// Copy a host file into the volume
    Put { host: PathBuf, path: String },
    /// Copy a file out of the volume
    Get { path: String, host: PathBuf },
    Mkdir { path: String },
    Rm { path: String },
    Mv { from: String, to: String },
    /// Resize the deleted-files directory
    Deldir { blocks: u16 },
    /// Check the volume structure
    Check,
}
