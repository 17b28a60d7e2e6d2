// benches/gpu_benchmarks.rs — GPU index-stamping benchmarks.
//
//   cargo bench --bench gpu_benchmarks
//
// Device selection follows DeviceConfig::from_env(), e.g.
//   IOTA_GPU_SELECTOR=any cargo bench --bench gpu_benchmarks
//
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// Criterion measures wall time including CPU overhead (buffer creation,
// bind group creation, submit, poll). Shader execution is included in the
// wait. `launch_wait` reuses one buffer and measures the kernel round trip;
// `run` adds allocation, readback and free, which is what `iota` costs.
//
// The first iterations pay pipeline JIT costs on some drivers, so the
// warm-up time is set explicitly.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use iota_gpu::gpu::buffer::SharedBuffer;
use iota_gpu::gpu::device::GpuDevice;
use iota_gpu::gpu::iota::GpuIotaKernel;
use iota_gpu::iota::fill;

const SIZES: [usize; 4] = [1 << 10, 1 << 14, 1 << 18, 1 << 22];

fn bench_iota(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let gpu = GpuDevice::from_env().expect("no usable GPU adapter");
    let kernel = GpuIotaKernel::new(&gpu);
    eprintln!("{gpu}");

    let mut group = c.benchmark_group("iota");
    group.warm_up_time(Duration::from_secs(2));

    for &n in &SIZES {
        group.throughput(Throughput::Elements(n as u64));

        let mut host = vec![0.0f32; n];
        group.bench_with_input(BenchmarkId::new("cpu", n), &n, |b, _| {
            b.iter(|| fill(&mut host))
        });

        let buf = SharedBuffer::<f32>::new(&gpu, n).expect("allocation");
        group.bench_with_input(BenchmarkId::new("gpu_launch_wait", n), &n, |b, _| {
            b.iter(|| kernel.launch(&gpu, &buf).expect("launch").wait(&gpu))
        });
        drop(buf);

        let mut out = vec![0.0f32; n];
        group.bench_with_input(BenchmarkId::new("gpu_run", n), &n, |b, _| {
            b.iter(|| kernel.run(&gpu, &mut out).expect("run"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_iota);
criterion_main!(benches);
