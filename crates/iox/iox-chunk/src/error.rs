use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("failed to map segment '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("segment is {actual} bytes, expected at least {expected}")]
    TooSmall { expected: usize, actual: usize },

    #[error("bad magic {0:#018x}, not a segment file")]
    BadMagic(u64),

    #[error("segment version {found}, expected {expected}")]
    VersionMismatch { found: u64, expected: u64 },

    #[error("segment {field} is {found}, expected {expected}")]
    LayoutMismatch {
        field: &'static str,
        found: u64,
        expected: u64,
    },

    #[error("all {0} subscriber slots are taken")]
    NoFreeSubscriberSlot(usize),
}
