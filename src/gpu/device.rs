// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters on the configured backends and select one
//     according to a `DeviceSelector` (real GPU only, or anything).
//   - Expose a `DeviceConfig` that can be filled from the environment so
//     the demo, tests and benches run unchanged on CI runners that only
//     have a software Vulkan implementation.
//   - Provide `WorkgroupSize` — a 1-D workgroup configuration validated
//     against the device limits and substituted into kernel templates.
//   - Track live `SharedBuffer` allocations so callers can assert that a
//     launch frees everything it allocated.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/lavapipe when a real GPU is also present. We enumerate
// explicitly and rank by device type:
//   DiscreteGpu   — dedicated NVIDIA/AMD card         <- ideal
//   IntegratedGpu — iGPU (AMD APU, Intel)            <- good
//   VirtualGpu    — VM pass-through                   <- acceptable
//   Other         — dzn (D3D12->Vulkan) on WSL2       <- acceptable
//   Cpu           — llvmpipe / lavapipe               <- `Any` only
//
// DEVICE LIMITS:
// `Gpu` requests wgpu's default limits, `Any` the downlevel defaults so
// software adapters are accepted. In both cases the storage-buffer limits
// are raised to whatever the adapter supports: the launch length is bounded
// by how large a single storage binding can be.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Default invocations per workgroup. Fits the downlevel limit of 256, and
/// is a multiple of both 32-wide warps and 64-wide wavefronts.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 256;

/// Which kind of adapter `GpuDevice` may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Hardware (or pass-through) GPUs only. Fails if only CPU/software
    /// adapters are present.
    Gpu,
    /// Prefer a hardware GPU, fall back to a software adapter.
    Any,
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Gpu => write!(f, "gpu"),
            DeviceSelector::Any => write!(f, "any"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown device selector {0:?} (expected \"gpu\" or \"any\")")]
pub struct ParseSelectorError(String);

impl FromStr for DeviceSelector {
    type Err = ParseSelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceSelector::Gpu),
            "any" | "cpu" | "fallback" => Ok(DeviceSelector::Any),
            _ => Err(ParseSelectorError(s.to_string())),
        }
    }
}

/// Device construction options.
///
/// ```no_run
/// use iota_gpu::gpu::device::{DeviceConfig, DeviceSelector, GpuDevice};
///
/// let config = DeviceConfig { selector: DeviceSelector::Any, ..Default::default() };
/// let gpu = GpuDevice::new_with_config(config).unwrap();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub selector: DeviceSelector,
    /// Backends to enumerate. Vulkan only unless overridden.
    pub backends: wgpu::Backends,
    /// Invocations per 1-D workgroup.
    pub workgroup_size: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            selector: DeviceSelector::Gpu,
            backends: wgpu::Backends::VULKAN,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
        }
    }
}

impl DeviceConfig {
    /// Environment variable selecting the adapter kind (`gpu` or `any`).
    pub const SELECTOR_VAR: &'static str = "IOTA_GPU_SELECTOR";
    /// Environment variable overriding the workgroup size.
    pub const WORKGROUP_VAR: &'static str = "IOTA_GPU_WORKGROUP";

    /// Default config with overrides from `IOTA_GPU_SELECTOR`,
    /// `IOTA_GPU_WORKGROUP` and wgpu's own `WGPU_BACKEND`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = DeviceConfig::default().with_overrides(
            std::env::var(Self::SELECTOR_VAR).ok().as_deref(),
            std::env::var(Self::WORKGROUP_VAR).ok().as_deref(),
        );
        if let Some(backends) = wgpu::util::backend_bits_from_env() {
            config.backends = backends;
        }
        config
    }

    fn with_overrides(mut self, selector: Option<&str>, workgroup: Option<&str>) -> Self {
        if let Some(s) = selector {
            match s.parse() {
                Ok(sel) => self.selector = sel,
                Err(e) => log::warn!("{}: {e}; keeping {}", Self::SELECTOR_VAR, self.selector),
            }
        }
        if let Some(w) = workgroup {
            match w.trim().parse::<u32>() {
                Ok(x) => self.workgroup_size = x,
                Err(e) => log::warn!(
                    "{}={w:?}: {e}; keeping {}",
                    Self::WORKGROUP_VAR,
                    self.workgroup_size
                ),
            }
        }
        self
    }
}

/// A 1-D workgroup size.
///
/// Must be a power of two and must not exceed the device's
/// `max_compute_invocations_per_workgroup` or `max_compute_workgroup_size_x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
}

impl WorkgroupSize {
    /// Validate `x` against device limits.
    pub fn new(x: u32, limits: &wgpu::Limits) -> Result<Self, GpuError> {
        if x == 0 || !x.is_power_of_two() {
            return Err(GpuError::InvalidWorkgroupSize(x));
        }
        let max = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x);
        if x > max {
            return Err(GpuError::WorkgroupTooLarge { size: x, max });
        }
        Ok(WorkgroupSize { x })
    }

    /// Values substituted into a WGSL kernel template.
    ///
    /// ```wgsl
    /// @compute @workgroup_size({{WG_X}}, 1, 1)
    /// fn main(...) { ... }
    /// ```
    pub fn substitute(&self, template: &str) -> String {
        template.replace("{{WG_X}}", &self.x.to_string())
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invocations", self.x)
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl From<wgpu::AdapterInfo> for AdapterInfo {
    fn from(raw: wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: raw.name,
            vendor: raw.vendor,
            device: raw.device,
            device_type: raw.device_type,
            backend: raw.backend,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The compute context: device, queue, selected adapter and live
/// allocation count.
///
/// Hold one `GpuDevice` for the lifetime of the application — it is
/// expensive to create (instance + device initialization).
///
/// # Field drop order
/// Fields drop top to bottom. `_instance` is declared last so the
/// `wgpu::Instance` outlives `device` and `queue`; dzn on WSL2 crashes when
/// the Vulkan instance goes away before device-level objects.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub selector: DeviceSelector,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    allocations: Arc<AtomicUsize>,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` on the best hardware adapter, Vulkan only.
    ///
    /// # Errors
    /// Returns `Err` if no hardware adapter is found or the device request
    /// fails.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_config(DeviceConfig::default())
    }

    /// Create a `GpuDevice` from `DeviceConfig::from_env()`.
    pub fn from_env() -> Result<Self, GpuError> {
        Self::new_with_config(DeviceConfig::from_env())
    }

    pub fn new_with_config(config: DeviceConfig) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(config))
    }

    async fn init_async(config: DeviceConfig) -> Result<Self, GpuError> {
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets dzn (WSL2) through; it
        // declares itself non-conformant but runs compute fine.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            flags,
            ..Default::default()
        });

        let mut adapters = instance.enumerate_adapters(config.backends);
        for a in &adapters {
            let info = a.get_info();
            log::info!(
                "adapter: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        let types: Vec<wgpu::DeviceType> =
            adapters.iter().map(|a| a.get_info().device_type).collect();
        let index = select_adapter(&types, config.selector).ok_or(
            GpuError::NoSuitableAdapter {
                selector: config.selector,
                backends: config.backends,
            },
        )?;
        let adapter = adapters.swap_remove(index);

        let adapter_info = AdapterInfo::from(adapter.get_info());
        if adapter_info.device_type == wgpu::DeviceType::Cpu {
            log::warn!("no hardware adapter; falling back to {adapter_info}");
        }
        log::info!("selected adapter: {adapter_info}");

        let limits = limits_for(config.selector, &adapter.limits());
        let workgroup_size = WorkgroupSize::new(config.workgroup_size, &limits)?;

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("iota-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        Ok(GpuDevice {
            device,
            queue,
            selector: config.selector,
            adapter_info,
            workgroup_size,
            allocations: Arc::new(AtomicUsize::new(0)),
            _instance: instance,
        })
    }

    /// Override the workgroup size, validating against the device limits.
    ///
    /// Kernels pick the size up when they are created; existing pipelines
    /// keep the size they were compiled with.
    pub fn set_workgroup_size(&mut self, x: u32) -> Result<(), GpuError> {
        self.workgroup_size = WorkgroupSize::new(x, &self.device.limits())?;
        Ok(())
    }

    /// Workgroup grid covering `len` invocations with the active workgroup
    /// size. See [`dispatch_grid`].
    pub fn dispatch_size(&self, len: u32) -> (u32, u32) {
        dispatch_grid(
            len,
            self.workgroup_size.x,
            self.device.limits().max_compute_workgroups_per_dimension,
        )
    }

    /// Largest element count of `T` that fits one storage binding.
    pub fn max_elements<T>(&self) -> usize {
        let limits = self.device.limits();
        let bytes = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        (bytes / std::mem::size_of::<T>() as u64) as usize
    }

    /// Number of `SharedBuffer`s allocated on this device and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    pub(crate) fn allocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.allocations)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, selector: {}, workgroup: {} }}",
            self.adapter_info, self.selector, self.workgroup_size
        )
    }
}

// ============================================================
// Selection and limits helpers
// ============================================================

/// Preference rank of a device type, lower is better. `None` for types the
/// selector does not accept.
fn rank(device_type: wgpu::DeviceType, selector: DeviceSelector) -> Option<u8> {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => Some(0),
        wgpu::DeviceType::IntegratedGpu => Some(1),
        wgpu::DeviceType::VirtualGpu => Some(2),
        wgpu::DeviceType::Other => Some(3),
        wgpu::DeviceType::Cpu => match selector {
            DeviceSelector::Gpu => None,
            DeviceSelector::Any => Some(4),
        },
    }
}

/// Index of the best adapter for `selector`; the first one wins a tie.
fn select_adapter(types: &[wgpu::DeviceType], selector: DeviceSelector) -> Option<usize> {
    types
        .iter()
        .enumerate()
        .filter_map(|(i, &t)| rank(t, selector).map(|r| (r, i)))
        .min()
        .map(|(_, i)| i)
}

/// Limits to request from an adapter that supports `supported`.
fn limits_for(selector: DeviceSelector, supported: &wgpu::Limits) -> wgpu::Limits {
    let base = match selector {
        DeviceSelector::Gpu => wgpu::Limits::default(),
        DeviceSelector::Any => wgpu::Limits::downlevel_defaults(),
    };
    wgpu::Limits {
        max_storage_buffer_binding_size: supported
            .max_storage_buffer_binding_size
            .max(base.max_storage_buffer_binding_size),
        max_buffer_size: supported.max_buffer_size.max(base.max_buffer_size),
        ..base
    }
}

/// Workgroup grid `(x, y)` covering `len` invocations of `workgroup` each.
///
/// Uses ceiling division, so the last workgroup may be partial and the
/// kernel must guard `index >= len`. When more than `max_per_dim` groups
/// are needed the grid folds into a second dimension; the kernel then
/// computes `index = gid.x + gid.y * (x * workgroup)`.
pub fn dispatch_grid(len: u32, workgroup: u32, max_per_dim: u32) -> (u32, u32) {
    let groups = len.div_ceil(workgroup);
    if groups <= max_per_dim {
        (groups, 1)
    } else {
        (max_per_dim, groups.div_ceil(max_per_dim))
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from device creation, allocation, launch and readback.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter on the configured backends passes the selector.
    /// Check that `vulkaninfo` lists a device, or use `DeviceSelector::Any`.
    #[error("no adapter matches selector {selector} on backends {backends:?}")]
    NoSuitableAdapter {
        selector: DeviceSelector,
        backends: wgpu::Backends,
    },
    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),
    #[error("workgroup size {0} must be a non-zero power of two")]
    InvalidWorkgroupSize(u32),
    #[error("workgroup size {size} exceeds device limit of {max} invocations")]
    WorkgroupTooLarge { size: u32, max: u32 },
    #[error("element size of {0} bytes is not a multiple of 4")]
    UnalignedElement(u64),
    /// Zero-length buffers cannot be bound to a kernel.
    #[error("cannot allocate an empty buffer")]
    EmptyBuffer,
    #[error("buffer of {bytes} bytes exceeds the storage binding limit of {max} bytes")]
    BufferTooLarge { bytes: u64, max: u64 },
    #[error("host slice has {found} elements, shared buffer has {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("mapping the staging buffer failed: {0}")]
    BufferMap(#[source] wgpu::BufferAsyncError),
    /// The map callback was dropped without running, e.g. the device was lost.
    #[error("staging buffer map callback never fired")]
    MapCallbackDropped,
}

// ============================================================
// Tests
// ============================================================
