//! Eager and demand-paging loader for statically-linked ELF64 executables.

pub mod arith;
pub mod auxv;
pub mod cli;
pub mod config;
pub mod consts;
pub mod debug;
pub mod demand;
pub mod eager;
pub mod elf;
pub mod error;
pub mod fault;
pub mod loader;
pub mod logger;
pub mod memory;
pub mod model;
pub mod rt;
pub mod source;
pub mod stack;
pub mod transfer;

pub use config::{LoaderConfig, ProtectionPolicy, Strategy};
pub use error::{LoaderError, Result};
