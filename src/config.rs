use std::ffi::OsString;
use std::path::PathBuf;

use clap::ValueEnum;
use log::LevelFilter;

use crate::arith::{align_up, checked_mul};
use crate::consts::{DEFAULT_STACK_BASE, DEFAULT_STACK_SIZE_KIB};
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Map and populate every segment before the program starts.
    Eager,
    /// Map each page on its first access.
    Demand,
}

/// How segment permissions are applied to the mappings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ProtectionPolicy {
    /// Map everything read/write/execute.
    #[default]
    Permissive,
    /// Populate read/write, then protect to the declared `p_flags`.
    Strict,
}

impl ProtectionPolicy {
    pub fn is_strict(self) -> bool {
        self == ProtectionPolicy::Strict
    }
}

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub strategy: Strategy,
    pub target: PathBuf,
    /// Forwarded argv, `target` first.
    pub argv: Vec<OsString>,
    pub stack_base: u64,
    pub stack_size_kib: u64,
    pub protection: ProtectionPolicy,
    /// Point the program-header and entry entries of the auxiliary vector at
    /// the target. A static glibc reads `AT_PHDR` to find its TLS segment.
    pub patch_auxv: bool,
    pub debug: bool,
    pub log_level: LevelFilter,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Demand,
            target: PathBuf::new(),
            argv: Vec::new(),
            stack_base: DEFAULT_STACK_BASE,
            stack_size_kib: DEFAULT_STACK_SIZE_KIB,
            protection: ProtectionPolicy::default(),
            patch_auxv: true,
            debug: false,
            log_level: LevelFilter::Warn,
        }
    }
}

impl LoaderConfig {
    /// Stack size in bytes, rounded up to whole pages.
    pub fn stack_size(&self, page_size: u64) -> Result<u64> {
        let bytes = checked_mul(self.stack_size_kib, 1024, "stack size")?;
        align_up(bytes.max(1), page_size, "stack size")
    }
}
