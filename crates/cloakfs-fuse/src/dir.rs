//! Directory session state.
//!
//! A [`DirHandle`] exists between `opendir` and `releasedir` and owns the
//! underlying directory stream. Directories are never encrypted; listing is
//! a straight pass-through of the backing tree (scratch shadows included,
//! when a listing races an open session — the deterministic shadow naming
//! makes no attempt to hide them).

use std::io;
use std::path::PathBuf;

use fuse_mt::{DirectoryEntry, FileType};
use tracing::trace;

use crate::oslib::DirStream;

fn file_type_from_dirent(d_type: u8) -> Option<FileType> {
    match d_type {
        libc::DT_REG => Some(FileType::RegularFile),
        libc::DT_DIR => Some(FileType::Directory),
        libc::DT_LNK => Some(FileType::Symlink),
        libc::DT_FIFO => Some(FileType::NamedPipe),
        libc::DT_CHR => Some(FileType::CharDevice),
        libc::DT_BLK => Some(FileType::BlockDevice),
        libc::DT_SOCK => Some(FileType::Socket),
        _ => None,
    }
}

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// A cursor over a backing directory, alive from `opendir` to `releasedir`.
#[derive(Debug)]
pub struct DirHandle {
    stream: DirStream,
    /// Backing path, kept for the `DT_UNKNOWN` lstat fallback.
    backing: PathBuf,
}

impl DirHandle {
    /// Opens the backing directory.
    pub fn open(backing: PathBuf) -> io::Result<Self> {
        let stream = DirStream::open(&backing)?;
        Ok(Self { stream, backing })
    }

    /// Collects the full listing.
    ///
    /// The multiplexer frontend owns offset bookkeeping and re-requests the
    /// listing from the start of each pass, so the stream is rewound first.
    pub fn entries(&mut self) -> io::Result<Vec<DirectoryEntry>> {
        self.stream.rewind();

        let mut entries = Vec::new();
        while let Some(raw) = self.stream.next_entry() {
            let kind = match file_type_from_dirent(raw.d_type) {
                Some(kind) => kind,
                // Filesystems without d_type support fall back to lstat.
                None => {
                    use std::os::unix::fs::MetadataExt;
                    let meta = std::fs::symlink_metadata(self.backing.join(&raw.name))?;
                    file_type_from_mode(meta.mode())
                }
            };
            entries.push(DirectoryEntry {
                name: raw.name,
                kind,
            });
        }
        trace!(dir = %self.backing.display(), count = entries.len(), "listed directory");
        Ok(entries)
    }
}
