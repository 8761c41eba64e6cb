use std::process::ExitCode;

use eni_cni::plugin::EgressV4;
use eni_cni::{logging, run_cni};

fn main() -> ExitCode {
    logging::init();
    run_cni(EgressV4::from_env)
}
