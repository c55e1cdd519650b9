//! # PFS3 文件系统引擎
//!
//! 在任意 [`BlockDevice`] 上挂载、格式化并读写 PFS3 卷。
//! 所有操作都通过 [`Session`] 串行进行；元数据修改先留在块缓存中，
//! 由一次原子提交写到新位置，最后改写根块完成切换。

/* pfs3 的整体架构，自上而下 */

// 对象层：文件读写、目录操作、链接、回收站、格式化与检查
mod check;
mod deldir;
mod file;
mod format;
mod link;
mod object;
pub use check::CheckReport;
pub use deldir::DeletedFile;
pub use format::format;
pub use object::{EntryInfo, MAX_COMMENT};

// 目录层：路径解析、目录块中目录项的增删改
mod dir;
mod lock;
mod path;
pub use lock::FileHandle;

// 分配层：anode链、数据块与保留块的分配和延迟释放
mod allocation;
mod anode;

// 会话层：挂载状态、原子提交、块缓存
mod cache;
mod session;
mod update;
pub use session::{Session, VolumeInfo};

// 磁盘数据结构层
mod date;
mod geometry;
mod volume;
pub use date::DateStamp;
pub use geometry::{FormatOptions, Geometry};
pub use volume::{EntryType, protection};

mod error;
pub use error::{Error, ErrorKind, Result};

pub use block_dev::{BlockDevice, BlockFile};
