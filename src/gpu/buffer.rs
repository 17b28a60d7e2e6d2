// gpu/buffer.rs — buffer shared between host and device.
//
// wgpu has no unified shared memory: a storage buffer cannot be mapped by
// the host, and a mappable buffer cannot be bound as storage. A
// `SharedBuffer` pairs the two:
//
//   storage  STORAGE | COPY_SRC | COPY_DST   bound by kernels
//   staging  MAP_READ | COPY_DST             host-visible mirror for reads
//
// Writes go through `queue.write_buffer` (wgpu stages them internally).
// Reads copy storage -> staging, map the staging buffer, copy out, unmap.
//
// The element count is fixed at allocation and is the launch range of any
// kernel run over the buffer, so a kernel cannot be dispatched over more
// elements than the binding holds.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::gpu::device::{GpuDevice, GpuError};

/// `len` elements of `T` resident on the device, readable from the host.
///
/// Dropping the buffer destroys both wgpu allocations and decrements the
/// device's live allocation count.
pub struct SharedBuffer<T: bytemuck::Pod> {
    storage: wgpu::Buffer,
    staging: wgpu::Buffer,
    len: usize,
    allocations: Arc<AtomicUsize>,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> SharedBuffer<T> {
    /// Allocate `len` zeroed elements.
    ///
    /// # Errors
    /// `EmptyBuffer` for `len == 0`, `BufferTooLarge` when the byte size
    /// exceeds what one storage binding can hold on this device.
    pub fn new(gpu: &GpuDevice, len: usize) -> Result<Self, GpuError> {
        let size = byte_size::<T>(len, gpu.max_elements::<T>())?;

        let storage = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SharedBuffer::storage"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SharedBuffer::staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let allocations = gpu.allocation_counter();
        let live = allocations.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("allocated shared buffer: {len} elements, {size} bytes ({live} live)");

        Ok(SharedBuffer {
            storage,
            staging,
            len,
            allocations,
            _marker: PhantomData,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: empty buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.storage.size()
    }

    /// Binding for the device-side buffer.
    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.storage.as_entire_binding()
    }

    /// Upload `data` to the device. Visible to every kernel submitted after
    /// this call.
    pub fn write(&self, gpu: &GpuDevice, data: &[T]) -> Result<(), GpuError> {
        self.check_len(data.len())?;
        gpu.queue.write_buffer(&self.storage, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    /// Copy the device contents into `out`, blocking until all previously
    /// submitted work on the queue has finished.
    ///
    /// This stalls the pipeline. The staging buffer is unmapped again before
    /// returning, so `read_into` may be called repeatedly.
    pub fn read_into(&self, gpu: &GpuDevice, out: &mut [T]) -> Result<(), GpuError> {
        self.check_len(out.len())?;

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("SharedBuffer::read"),
            });
        encoder.copy_buffer_to_buffer(&self.storage, 0, &self.staging, 0, self.size_bytes());
        let index = gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = self.staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        gpu.device.poll(wgpu::Maintain::wait_for(index));
        rx.recv()
            .map_err(|_| GpuError::MapCallbackDropped)?
            .map_err(GpuError::BufferMap)?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice(&mapped[..]));
        }
        self.staging.unmap();
        Ok(())
    }

    /// Owning variant of [`read_into`](Self::read_into).
    pub fn read(&self, gpu: &GpuDevice) -> Result<Vec<T>, GpuError> {
        let mut out = vec![T::zeroed(); self.len];
        self.read_into(gpu, &mut out)?;
        Ok(out)
    }

    /// Release the buffer now. Equivalent to dropping it.
    pub fn free(self) {}

    fn check_len(&self, found: usize) -> Result<(), GpuError> {
        if found != self.len {
            return Err(GpuError::LengthMismatch { expected: self.len, found });
        }
        Ok(())
    }
}

impl<T: bytemuck::Pod> Drop for SharedBuffer<T> {
    fn drop(&mut self) {
        self.storage.destroy();
        self.staging.destroy();
        let live = self.allocations.fetch_sub(1, Ordering::AcqRel) - 1;
        log::trace!("freed shared buffer: {} elements ({live} live)", self.len);
    }
}

/// Byte size of `len` elements of `T`, rejecting empty and oversized
/// buffers. `max_len` is the element capacity of one storage binding.
///
/// Buffer copies and queue writes move whole 4-byte words, so `T` must be a
/// multiple of `wgpu::COPY_BUFFER_ALIGNMENT` in size.
fn byte_size<T>(len: usize, max_len: usize) -> Result<u64, GpuError> {
    let elem = std::mem::size_of::<T>() as u64;
    if elem == 0 || elem % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
        return Err(GpuError::UnalignedElement(elem));
    }
    if len == 0 {
        return Err(GpuError::EmptyBuffer);
    }
    if len > max_len {
        return Err(GpuError::BufferTooLarge {
            bytes: len as u64 * elem,
            max: max_len as u64 * elem,
        });
    }
    Ok(len as u64 * elem)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_f32() {
        assert_eq!(byte_size::<f32>(1024, 1 << 20).unwrap(), 4096);
        assert_eq!(byte_size::<f32>(1, 1).unwrap(), 4);
    }

    #[test]
    fn test_byte_size_rejects_unaligned_elements() {
        assert!(matches!(byte_size::<u8>(16, 1024), Err(GpuError::UnalignedElement(1))));
        assert!(matches!(byte_size::<[u16; 3]>(16, 1024), Err(GpuError::UnalignedElement(6))));
        assert_eq!(byte_size::<[u16; 2]>(16, 1024).unwrap(), 64);
    }

    #[test]
    fn test_byte_size_rejects_empty() {
        assert!(matches!(byte_size::<f32>(0, 1024), Err(GpuError::EmptyBuffer)));
    }

    #[test]
    fn test_byte_size_rejects_oversized() {
        let err = byte_size::<f32>(1025, 1024).unwrap_err();
        assert!(matches!(err, GpuError::BufferTooLarge { bytes: 4100, max: 4096 }));
    }

    // ---- GPU tests (subprocess-isolated, see gpu::device) ------------------

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("subprocess failed for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}"); eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_write_read_round_trip() {
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let buf = SharedBuffer::<f32>::new(&gpu, 300).unwrap();
        assert_eq!(buf.size_bytes(), 1200);
        assert_eq!(buf.read(&gpu).unwrap(), vec![0.0; 300], "new buffers are zeroed");

        let data: Vec<f32> = (0..300).map(|i| (i * 3) as f32 - 7.5).collect();
        buf.write(&gpu, &data).unwrap();
        assert_eq!(buf.read(&gpu).unwrap(), data);
        // Second read goes through the same staging buffer.
        assert_eq!(buf.read(&gpu).unwrap(), data);

        let err = buf.write(&gpu, &data[..10]).unwrap_err();
        assert!(matches!(err, GpuError::LengthMismatch { expected: 300, found: 10 }));
        println!("GPU_TEST_OK");
        drop(buf); drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_allocation_tracking() {
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        assert_eq!(gpu.live_allocations(), 0);
        let a = SharedBuffer::<f32>::new(&gpu, 16).unwrap();
        let b = SharedBuffer::<u32>::new(&gpu, 16).unwrap();
        assert_eq!(gpu.live_allocations(), 2);
        a.free();
        assert_eq!(gpu.live_allocations(), 1);
        drop(b);
        assert_eq!(gpu.live_allocations(), 0);
        assert!(matches!(SharedBuffer::<f32>::new(&gpu, 0), Err(GpuError::EmptyBuffer)));
        assert_eq!(gpu.live_allocations(), 0);
        println!("GPU_TEST_OK");
        drop(gpu);
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_write_read_round_trip() {
        let out = run_gpu_test_in_subprocess("gpu::buffer::tests::inner_write_read_round_trip");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_allocation_tracking() {
        let out = run_gpu_test_in_subprocess("gpu::buffer::tests::inner_allocation_tracking");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
