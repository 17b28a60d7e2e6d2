// iota-gpu: index-stamping compute kernel
// A wgpu toolchain smoke test. One kernel writes each element's index into
// a float buffer; the CPU reference in `iota` is what its output is checked
// against.

pub mod iota;
pub mod gpu;

pub use gpu::device::{DeviceConfig, DeviceSelector, GpuDevice, GpuError};
pub use iota::{verify_iota, IotaMismatch};
