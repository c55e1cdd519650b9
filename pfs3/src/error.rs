//! 引擎的错误类型
//!
//! 错误分三类：
//! - 致命：底层读写失败、缓存耗尽等，会话随即作废；
//! - 损坏：盘上结构与预期不符，不做修复；
//! - 策略：对象不存在、磁盘已满等，调用者可自行处理。

use std::io;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("block {block} lies outside the partition")]
    OutOfRange { block: u64 },

    /// 所有缓存槽都被锁住
    #[error("out of buffers")]
    OutOfBuffers,

    /// 提交过程中保留区耗尽
    #[error("reserved area exhausted")]
    ReservedExhausted,

    #[error("postponed operation could not be resumed: {0}")]
    Postponed(Box<Error>),

    /// 会话先前遇到致命错误，不再接受操作
    #[error("session aborted by an earlier fatal error")]
    Aborted,

    #[error("corrupt block {block}: {detail}")]
    Corrupt { block: u32, detail: String },

    #[error("not a PFS volume (disktype {disktype:#010x})")]
    NotPfs { disktype: u32 },

    #[error("object not found")]
    NotFound,

    #[error("object exists")]
    Exists,

    #[error("object of wrong type")]
    WrongType,

    #[error("not a directory")]
    NotADirectory,

    #[error("not a file")]
    NotAFile,

    #[error("object is write protected")]
    WriteProtected,

    #[error("object is delete protected")]
    DeleteProtected,

    #[error("object is read protected")]
    ReadProtected,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("disk full")]
    DiskFull,

    #[error("object in use")]
    InUse,

    #[error("object is a soft link")]
    IsSoftLink,

    #[error("name too long")]
    NameTooLong,

    #[error("invalid name")]
    InvalidName,

    /// 把目录移到自己的子孙之下
    #[error("cannot move a directory into itself")]
    InvalidMove,

    #[error("seek error")]
    SeekError,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("file too large")]
    FileTooLarge,

    #[error("comment too long")]
    CommentTooLong,

    /// 回收站槽位已被复用
    #[error("deleted file is no longer recoverable")]
    DeldirSlotInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fatal,
    Corruption,
    Policy,
}

impl Error {
    pub(crate) fn corrupt(block: u32, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            block,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_)
            | Self::OutOfRange { .. }
            | Self::OutOfBuffers
            | Self::ReservedExhausted
            | Self::Postponed(_)
            | Self::Aborted => ErrorKind::Fatal,
            Self::Corrupt { .. } | Self::NotPfs { .. } => ErrorKind::Corruption,
            _ => ErrorKind::Policy,
        }
    }

    /// 致命错误与结构损坏都意味着卷不再可信
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Policy
    }

    /// 对应的AmigaDOS错误号
    pub fn dos_code(&self) -> u32 {
        match self {
            Self::Io(_) => 20,
            Self::OutOfRange { .. } => 20,
            Self::OutOfBuffers => 295,
            Self::ReservedExhausted => 221,
            Self::Postponed(_) => 20,
            Self::Aborted => 20,
            Self::Corrupt { .. } => 225,
            Self::NotPfs { .. } => 225,
            Self::NotFound => 205,
            Self::Exists => 203,
            Self::WrongType => 212,
            Self::NotADirectory => 212,
            Self::NotAFile => 212,
            Self::WriteProtected => 223,
            Self::DeleteProtected => 222,
            Self::ReadProtected => 224,
            Self::DirectoryNotEmpty => 216,
            Self::DiskFull => 221,
            Self::InUse => 202,
            Self::IsSoftLink => 233,
            Self::NameTooLong => 210,
            Self::InvalidName => 210,
            Self::InvalidMove => 215,
            Self::SeekError => 219,
            Self::InvalidHandle => 114,
            Self::FileTooLarge => 221,
            Self::CommentTooLong => 220,
            Self::DeldirSlotInvalid => 205,
        }
    }
}
