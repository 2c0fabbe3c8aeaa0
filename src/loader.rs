//! Load pipeline: image reader, one of the two mappers, stack builder,
//! validator, control transfer.

use std::ffi::OsString;
use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::auxv::AuxVector;
use crate::config::{LoaderConfig, Strategy};
use crate::demand::DemandPager;
use crate::error::Result;
use crate::memory::ProcessMemory;
use crate::stack::{StackStrings, StackView};
use crate::transfer::Transferred;
use crate::{debug, eager, elf, fault, rt, stack, transfer};

/// `KEY=VALUE` strings for the loader's own environment.
pub fn environment() -> Vec<Vec<u8>> {
    std::env::vars_os()
        .map(|(key, value): (OsString, OsString)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            entry
        })
        .collect()
}

/// Loads `config.target` and runs it in place of the loader.
pub fn run(config: &LoaderConfig) -> Result<Transferred> {
    transfer::ensure_supported()?;
    let page_size = rt::page_size();

    let loaded = elf::open_image(&config.target, page_size)?;
    let entry = loaded.descriptor.entry;
    if config.debug {
        debug::print_image(&mut io::stdout().lock(), &loaded.descriptor, page_size)?;
    }

    let mut auxv = AuxVector::from_process()?;
    if config.patch_auxv {
        auxv.patch_for_image(&loaded.descriptor);
    }
    let args: Vec<&[u8]> = config.argv.iter().map(|a| a.as_bytes()).collect();
    let strings = StackStrings::copy_from(&args, &environment())?;
    let stack_size = config.stack_size(page_size)?;
    stack::ensure_clear_of_image(&loaded.descriptor, config.stack_base, stack_size, page_size)?;

    match config.strategy {
        Strategy::Eager => {
            let mut memory = ProcessMemory::new(page_size);
            let report = eager::map_image(
                &loaded.descriptor,
                &loaded.source,
                &mut memory,
                page_size,
                config.protection,
            )?;
            log::info!(
                "eager: {} segments, {:#x} bytes mapped, {:#x} read",
                report.segments_mapped,
                report.bytes_mapped,
                report.bytes_read
            );
            // The image file is not needed once everything is copied in.
            drop(loaded);
        }
        Strategy::Demand => {
            let pages = loaded.descriptor.total_pages(page_size);
            let pager = DemandPager::new(loaded, ProcessMemory::new(page_size), page_size, config.protection);
            fault::install(pager)?;
            log::info!("demand: {pages} pages left to fault in");
        }
    }

    let mut memory = ProcessMemory::new(page_size);
    let region = stack::allocate(&mut memory, config.stack_base, stack_size)?;
    let initial = stack::build(region, config.stack_base, &strings, &auxv)?;

    let view = StackView::new(config.stack_base, region);
    let summary = stack::validate(&view, initial.stack_pointer, &strings, &auxv)?;
    if config.debug {
        debug::print_stack_image(&mut io::stdout().lock(), &view, &initial, &summary)?;
    }

    io::stdout().flush()?;
    unsafe { transfer::enter(entry, initial.stack_pointer) }
}
