use std::process::ExitCode;

fn main() -> ExitCode {
    elfpager::cli::main(None)
}
