use std::path::PathBuf;

/// Every way loading or fault resolution can fail.
///
/// Variants raised on the fault path carry only plain integers and static
/// strings, so building and formatting them never touches the allocator.
#[derive(thiserror::Error, Debug)]
pub enum LoaderError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not an ELF image (magic {magic:02x?})")]
    NotAnImage { magic: [u8; 4] },

    #[error("unsupported image: {reason}")]
    UnsupportedImage { reason: String },

    #[error("ELF header truncated: {available} of {required} bytes")]
    TruncatedHeader { available: usize, required: usize },

    #[error("program header table truncated at {offset:#x}: {available} of {required} bytes")]
    TruncatedProgramHeaders {
        offset: u64,
        available: usize,
        required: usize,
    },

    #[error("segment read at file offset {offset:#x} returned {actual} of {expected} bytes")]
    SegmentReadFailed {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("mmap of {len:#x} bytes at {address:#x} failed (errno {errno})")]
    MapFailed { address: u64, len: u64, errno: i32 },

    #[error("mprotect of {len:#x} bytes at {address:#x} failed (errno {errno})")]
    ProtectFailed { address: u64, len: u64, errno: i32 },

    #[error("stack allocation of {size:#x} bytes at {base:#x} failed (errno {errno})")]
    StackAllocationFailed { base: u64, size: u64, errno: i32 },

    #[error("out of memory copying {bytes} bytes of {what}")]
    OutOfMemory { what: &'static str, bytes: usize },

    #[error("segmentation fault at {address:#x}")]
    SegmentationFault { address: u64 },

    #[error("page {page:#x} faulted again after it was resolved")]
    RepeatFault { page: u64 },

    #[error("stack image needs {required:#x} bytes but the region holds {available:#x}")]
    StackOverflow { required: u64, available: u64 },

    #[error("stack image corrupt: {reason}")]
    StackCorrupt { reason: String },

    #[error("installing the fault handler failed (errno {errno})")]
    HandlerInstall { errno: i32 },

    #[error("arithmetic overflow computing {context}")]
    ArithmeticOverflow { context: &'static str },

    #[error("control transfer is not implemented for {arch}")]
    UnsupportedPlatform { arch: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    /// A bad magic number only means "this is not for us"; a caller probing
    /// several files may skip it. Everything else aborts the load.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LoaderError::NotAnImage { .. })
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        LoaderError::UnsupportedImage {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        LoaderError::StackCorrupt {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = LoaderError> = std::result::Result<T, E>;
