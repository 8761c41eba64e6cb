use std::process::ExitCode;

use eni_cni::plugin::ImdsIpam;
use eni_cni::{logging, run_cni};

fn main() -> ExitCode {
    logging::init();
    run_cni(ImdsIpam::from_env)
}
