//! Several device instances in one process.
//!
//! The command line is split on `--` into one argument list per device; each
//! device gets its own worker thread running its own runtime loop. Devices
//! share nothing but the process and the shutdown signal.

use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::{error, info};

use crate::args::NicArgs;
use crate::kernel::Device;
use crate::runner::{install_signal_handlers, Runner};
use crate::{Error, Result};

/// Split `argv` (without the program name) into per-device argument lists.
pub fn split_device_args(argv: &[String]) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    let mut cur = Vec::new();
    for a in argv {
        if a == "--" {
            out.push(std::mem::take(&mut cur));
        } else {
            cur.push(a.clone());
        }
    }
    out.push(cur);
    out
}

/// Run one device per `--`-separated argument list, each on its own thread.
/// Returns once every device loop has finished; the first failure wins.
pub fn run_devices<D, F>(argv: &[String], factory: F) -> Result<()>
where
    D: Device + Send + 'static,
    D::DmaTag: Send + 'static,
    F: Fn() -> D + Send + Sync + 'static,
{
    install_signal_handlers();

    let slices = split_device_args(argv);
    let factory = Arc::new(factory);
    let mut handles = Vec::new();

    for (idx, slice) in slices.into_iter().enumerate() {
        let mut args_with_bin = vec!["nicsim".to_string()];
        args_with_bin.extend(slice);
        let args = NicArgs::try_parse_from(&args_with_bin)
            .map_err(|e| Error::Setup(format!("device {idx}: {e}")))?;

        let factory = Arc::clone(&factory);
        let handle = thread::Builder::new()
            .name(format!("nic-{idx}"))
            .spawn(move || -> Result<()> {
                let mut runner = Runner::new(factory(), &args, idx)?;
                info!(instance = idx, "device running");
                runner.run()
            })
            .map_err(|e| Error::Setup(format!("failed to spawn device thread: {e}")))?;
        handles.push(handle);
    }

    let mut result = Ok(());
    for (idx, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(instance = idx, error = %e, "device failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Err(_) => {
                error!(instance = idx, "device thread panicked");
                if result.is_ok() {
                    result = Err(Error::Setup(format!("device {idx} panicked")));
                }
            }
        }
    }
    result
}
