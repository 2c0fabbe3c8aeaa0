use std::process::ExitCode;

use elfpager::Strategy;

fn main() -> ExitCode {
    elfpager::cli::main(Some(Strategy::Demand))
}
