// gpu/mod.rs — GPU layer.
//
// wgpu compute kernels mirroring the CPU code in the parent crate. The CPU
// implementation in `iota` remains the authoritative reference; the GPU
// kernel is validated against it element for element.
//
//   device  — adapter selection, limits, workgroup size, error type
//   buffer  — `SharedBuffer`: device storage paired with a host staging copy
//   iota    — the index-stamping kernel and its launch/readback driver

pub mod device;
pub mod buffer;
pub mod iota;
