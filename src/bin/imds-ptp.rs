use std::process::ExitCode;

use eni_cni::plugin::ImdsPtp;
use eni_cni::{logging, run_cni};

fn main() -> ExitCode {
    logging::init();
    run_cni(ImdsPtp::from_env)
}
