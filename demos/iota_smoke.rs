// demos/iota_smoke.rs — toolchain smoke test.
//
// Selects a device, stamps N indices on it, checks the result against the
// CPU reference and exits non-zero on any failure.
//
// USAGE
// ─────
//   cargo run --example iota_smoke                 # N = 1024, hardware GPU
//   cargo run --example iota_smoke -- 1000000      # N = 1 000 000
//   IOTA_GPU_SELECTOR=any RUST_LOG=debug cargo run --example iota_smoke
//                                                  # allow software adapters

use std::process::ExitCode;
use std::time::Instant;

use iota_gpu::gpu::device::GpuDevice;
use iota_gpu::gpu::iota::iota_vec;
use iota_gpu::iota::verify_iota;

const DEFAULT_LEN: usize = 1024;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let len = match std::env::args().nth(1) {
        Some(arg) => match arg.parse::<usize>() {
            Ok(n) => n,
            Err(e) => {
                log::error!("invalid element count {arg:?}: {e}");
                return ExitCode::from(2);
            }
        },
        None => DEFAULT_LEN,
    };

    let gpu = match GpuDevice::from_env() {
        Ok(gpu) => gpu,
        Err(e) => {
            log::error!("device initialisation failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("{gpu}");

    let t0 = Instant::now();
    let values = match iota_vec(&gpu, len) {
        Ok(v) => v,
        Err(e) => {
            log::error!("kernel launch failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let elapsed = t0.elapsed();

    match verify_iota(&values) {
        Ok(()) => {
            log::info!(
                "stamped {len} elements in {:.3} ms, all match",
                elapsed.as_secs_f64() * 1e3
            );
            ExitCode::SUCCESS
        }
        Err(mismatch) => {
            log::error!("verification failed: {mismatch}");
            ExitCode::FAILURE
        }
    }
}
