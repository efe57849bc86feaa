use std::{fs, io, path::Path, time::SystemTime};

/// what a single stat of the tailed file tells us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaSnap {
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    /// zero where the platform has no inode
    pub inode: u64,
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

pub(crate) fn stat_path(path: &Path) -> io::Result<MetaSnap> {
    let meta = fs::metadata(path)?;
    Ok(MetaSnap {
        len: meta.len(),
        modified: meta.modified().ok(),
        created: meta.created().ok(),
        inode: inode(&meta),
    })
}

pub(crate) fn has_changed(prev: &Option<MetaSnap>, cur: &MetaSnap) -> bool {
    prev.as_ref() != Some(cur)
}

/// the file was truncated or another file now lives at the path
pub(crate) fn is_replaced(prev: &Option<MetaSnap>, cur: &MetaSnap, consumed: u64) -> bool {
    let rotated = prev
        .as_ref()
        .is_some_and(|prev| prev.inode != cur.inode);
    rotated || cur.len < consumed
}
