use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use log::LevelFilter;

use crate::config::{LoaderConfig, ProtectionPolicy, Strategy};
use crate::consts::{DEFAULT_STACK_BASE, DEFAULT_STACK_SIZE_KIB};
use crate::logger;

/// Loads a statically-linked ELF64 executable and runs it in this process.
#[derive(Parser, Debug)]
#[command(name = "elfpager", version, about)]
pub struct Cli {
    /// How segments are brought into memory.
    #[arg(long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Size of the new stack in KiB, rounded up to whole pages.
    #[arg(long, value_name = "KIB", default_value_t = DEFAULT_STACK_SIZE_KIB)]
    pub stack_size: u64,

    /// Fixed address of the new stack region.
    #[arg(long, value_name = "ADDR", default_value_t = DEFAULT_STACK_BASE, value_parser = parse_address)]
    pub stack_base: u64,

    /// Map segments with their declared permissions instead of read/write/execute.
    #[arg(long)]
    pub strict_permissions: bool,

    /// Pass the loader's auxiliary vector through unchanged instead of pointing
    /// AT_PHDR, AT_PHENT, AT_PHNUM, AT_ENTRY and AT_BASE at the loaded image.
    #[arg(long)]
    pub verbatim_auxv: bool,

    /// Print the parsed image and the stack image before starting the program.
    #[arg(long)]
    pub debug: bool,

    /// Log level (overrides ELFPAGER_LOG and -v).
    #[arg(long, value_name = "LEVEL", value_parser = parse_level)]
    pub log_level: Option<LevelFilter>,

    /// Raise the log level; repeat for more.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Executable to load, followed by the arguments it receives.
    #[arg(value_name = "EXECUTABLE [ARGS]", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse::<LevelFilter>()
        .map_err(|_| format!("invalid log level {s:?} (off, error, warn, info, debug, trace)"))
}

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

impl Cli {
    /// Parses `args` (program name first). Fixed-strategy front ends do not
    /// accept `--strategy`.
    pub fn try_parse_for<I, T>(fixed: Option<Strategy>, args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut command = Cli::command();
        if let Some(strategy) = fixed {
            let name = match strategy {
                Strategy::Eager => "apager",
                Strategy::Demand => "dpager",
            };
            command = command.name(name).mut_arg("strategy", |arg| arg.hide(true));
        }
        let matches = command.clone().try_get_matches_from(args)?;
        let cli = Cli::from_arg_matches(&matches)?;
        if fixed.is_some() && cli.strategy.is_some() {
            return Err(command.error(
                ErrorKind::ArgumentConflict,
                "this front end always uses its own strategy; --strategy is not accepted",
            ));
        }
        Ok(cli)
    }

    /// The loader configuration, or `None` if no target was given.
    pub fn into_config(self, default_strategy: Strategy, log_level: LevelFilter) -> Option<LoaderConfig> {
        let target = PathBuf::from(self.command.first()?);
        let argv = self.command;
        Some(LoaderConfig {
            strategy: self.strategy.unwrap_or(default_strategy),
            target,
            argv,
            stack_base: self.stack_base,
            stack_size_kib: self.stack_size,
            protection: if self.strict_permissions {
                ProtectionPolicy::Strict
            } else {
                ProtectionPolicy::Permissive
            },
            patch_auxv: !self.verbatim_auxv,
            debug: self.debug,
            log_level,
        })
    }
}

fn program_name(args: &[OsString], fallback: &'static str) -> String {
    args.first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

/// Entry point shared by the binaries. `fixed` pins the strategy for the
/// single-strategy front ends; `elfpager` itself defaults to demand paging.
pub fn main(fixed: Option<Strategy>) -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    let name = program_name(&args, "elfpager");

    let cli = match Cli::try_parse_for(fixed, args.iter().cloned()) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let env_level = std::env::var(logger::LOG_ENV).ok();
    let level = logger::resolve_level(cli.log_level, env_level.as_deref(), cli.verbose);
    logger::init(level);

    let Some(config) = cli.into_config(fixed.unwrap_or(Strategy::Demand), level) else {
        eprintln!("Usage: {name} <executable> [args...]");
        return ExitCode::FAILURE;
    };

    match crate::loader::run(&config) {
        Ok(never) => match never {},
        Err(err) => {
            log::debug!("load of {} failed: {err:?}", config.target.display());
            eprintln!("FATAL: {err}");
            ExitCode::FAILURE
        }
    }
}
