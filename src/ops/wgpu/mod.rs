//! GPU-accelerated kernels using WGPU.
//!
//! One [`GpuContext`] is opened per runtime, pinned to a single `wgpu`
//! backend class (Vulkan, Metal, DX12 or GL). Output storage is a 2-D storage
//! texture sized by the kernel's [`StoragePlan`]; each program's WGSL body is
//! wrapped by [`shader::generate`] and the resulting pipeline is cached by its
//! source text, up to a fixed number of entries.
//!
//! Arguments are uploaded as read-only storage buffers. A deferred result
//! produced on the same context is bound directly as a texture, so pipelines
//! chain without a host round trip.
//!
//! All futures are driven to completion with `pollster::block_on`; eager
//! readback waits on the device.

pub mod shader;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use self::shader::Binding;
use super::dispatch::{Device, Job, Readback, Storage};
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::kernel::Arg;
use crate::output::{CellFormat, StoragePlan};

/// Bytes per output cell, for both `rgba8uint` and `r32float`.
const CELL_BYTES: u32 = 4;

/// Compiled pipelines kept per device before the oldest are dropped.
const PIPELINE_CACHE_LIMIT: usize = 64;

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    backend: Backend,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    info: wgpu::AdapterInfo,
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("backend", &self.backend)
            .field("adapter", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl GpuContext {
    /// Opens a device on the first adapter of `backend`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedBackend`] if no adapter of that class exists, or
    ///   the chosen one cannot run compute shaders
    /// - [`Error::Gpu`] if the adapter refuses to create a device
    ///
    /// # Internals
    ///
    /// Uses `pollster::block_on` to wait for the async WGPU calls, and asks for
    /// downlevel limits raised to what the adapter supports, so the GL class
    /// works on GLES 3.1 drivers.
    pub fn new(backend: Backend) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: backend.wgpu_backends(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|e| Error::UnsupportedBackend {
            backend,
            reason: e.to_string(),
        })?;
        require_compute(backend, adapter.get_downlevel_capabilities().flags)?;

        let limits = wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits());
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_kernel"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| Error::Gpu(e.to_string()))?;

        device.on_uncaptured_error(Box::new(move |e| {
            tracing::error!(backend = backend.name(), error = %e, "uncaptured device error");
        }));

        let info = adapter.get_info();
        tracing::debug!(backend = backend.name(), adapter = %info.name, "opened device");
        Ok(Self {
            backend,
            device,
            queue,
            limits,
            info,
        })
    }

    /// Runs `f` inside a validation error scope.
    fn validated<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(Error::Gpu(e.to_string())),
            None => Ok(value),
        }
    }
}

/// Fails unless an adapter with `flags` can run compute shaders.
pub(crate) fn require_compute(backend: Backend, flags: wgpu::DownlevelFlags) -> Result<()> {
    if flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        Ok(())
    } else {
        Err(Error::UnsupportedBackend {
            backend,
            reason: "adapter cannot run compute shaders".to_owned(),
        })
    }
}

/// A storage texture owned by one kernel.
pub struct TextureStorage {
    context: Arc<GpuContext>,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    cells: CellFormat,
}

impl std::fmt::Debug for TextureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {:?} texture", self.width, self.height, self.cells)
    }
}

const fn texture_format(cells: CellFormat) -> wgpu::TextureFormat {
    match cells {
        CellFormat::Float32 => wgpu::TextureFormat::R32Float,
        CellFormat::Packed => wgpu::TextureFormat::Rgba8Uint,
    }
}

struct Compiled {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// Resources backing one argument for a single dispatch.
enum Bound {
    Buffer(wgpu::Buffer),
    Texture(wgpu::TextureView),
}

/// Compiled pipelines keyed by generated shader source.
///
/// The source embeds argument extents, so every new input shape compiles a
/// new entry. Past `limit` entries the oldest one is evicted.
struct PipelineCache<V> {
    entries: HashMap<String, Arc<V>>,
    order: VecDeque<String>,
    limit: usize,
}

impl<V> PipelineCache<V> {
    fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn get(&self, source: &str) -> Option<Arc<V>> {
        self.entries.get(source).map(Arc::clone)
    }

    fn insert(&mut self, source: String, value: Arc<V>) {
        if self.entries.insert(source.clone(), value).is_none() {
            self.order.push_back(source);
        }
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// A device for one `wgpu` backend class.
pub struct WgpuDevice {
    context: Arc<GpuContext>,
    pipelines: Mutex<PipelineCache<Compiled>>,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("context", &self.context)
            .field("pipelines", &self.pipelines.lock().len())
            .finish()
    }
}

impl WgpuDevice {
    /// Opens a device for `backend`.
    ///
    /// # Errors
    ///
    /// See [`GpuContext::new`].
    pub fn new(backend: Backend) -> Result<Self> {
        Ok(Self {
            context: Arc::new(GpuContext::new(backend)?),
            pipelines: Mutex::new(PipelineCache::new(PIPELINE_CACHE_LIMIT)),
        })
    }

    /// Decides how each argument is bound, uploading host data as needed.
    fn bind_args(&self, job: &Job<'_>) -> Result<(Vec<Binding>, Vec<Bound>)> {
        let device = &self.context.device;
        let mut bindings = Vec::with_capacity(job.args.len());
        let mut bound = Vec::with_capacity(job.args.len());

        let upload = |label: String, data: &[f32]| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label.as_str()),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE,
            })
        };

        for (i, arg) in job.args.iter().enumerate() {
            let label = format!("{}_arg{i}", job.program.name());
            match arg {
                Arg::Scalar(v) => {
                    bindings.push(Binding::Scalar);
                    bound.push(Bound::Buffer(upload(label, &[*v])));
                }
                Arg::Array(a) => {
                    bindings.push(Binding::Buffer {
                        extents: a.extents(),
                    });
                    bound.push(Bound::Buffer(upload(label, &a.flatten())));
                }
                Arg::Deferred(d) => {
                    let view = d.with_storage(|storage, plan| match storage {
                        Storage::Texture(t) if Arc::ptr_eq(&t.context, &self.context) => {
                            Some((t.view.clone(), Binding::texture(plan)))
                        }
                        _ => None,
                    })?;
                    if let Some((view, binding)) = view {
                        bindings.push(binding);
                        bound.push(Bound::Texture(view));
                    } else {
                        let array = d.materialize()?;
                        bindings.push(Binding::Buffer {
                            extents: array.extents(),
                        });
                        bound.push(Bound::Buffer(upload(label, &array.flatten())));
                    }
                }
            }
        }
        Ok((bindings, bound))
    }

    fn compile(&self, label: &str, source: &str, plan: &StoragePlan, bindings: &[Binding]) -> Result<Arc<Compiled>> {
        if let Some(hit) = self.pipelines.lock().get(source) {
            return Ok(hit);
        }

        let device = &self.context.device;
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: texture_format(plan.cells()),
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        }];
        for (i, binding) in bindings.iter().enumerate() {
            let ty = match binding {
                Binding::Scalar | Binding::Buffer { .. } => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                Binding::Texture { packed, .. } => wgpu::BindingType::Texture {
                    sample_type: if *packed {
                        wgpu::TextureSampleType::Uint
                    } else {
                        wgpu::TextureSampleType::Float { filterable: false }
                    },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
            };
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty,
                count: None,
            });
        }

        let compiled = self.context.validated(|| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{label}_bgl")),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{label}_pipeline_layout")),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&format!("{label}_pipeline")),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
            Compiled { layout, pipeline }
        })?;

        tracing::debug!(kernel = label, "compiled pipeline");
        let compiled = Arc::new(compiled);
        self.pipelines
            .lock()
            .insert(source.to_owned(), Arc::clone(&compiled));
        Ok(compiled)
    }
}

impl Device for WgpuDevice {
    fn backend(&self) -> Backend {
        self.context.backend
    }

    fn fits(&self, plan: &StoragePlan) -> Result<()> {
        let max = self.context.limits.max_texture_dimension_2d as usize;
        let (width, height) = plan.grid();
        if width > max || height > max {
            return Err(Error::shape(
                plan.extents(),
                format!("{width}x{height} grid exceeds the device limit of {max}"),
            ));
        }
        Ok(())
    }

    fn allocate(&self, label: &str, plan: &StoragePlan) -> Result<Storage> {
        self.fits(plan)?;
        let (width, height) = plan.grid();
        let (width, height) = (width as u32, height as u32);
        let texture = self.context.validated(|| {
            self.context.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format(plan.cells()),
                usage: wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        tracing::debug!(kernel = label, width, height, cells = ?plan.cells(), "allocated texture");
        Ok(Storage::Texture(TextureStorage {
            context: Arc::clone(&self.context),
            texture,
            view,
            width,
            height,
            cells: plan.cells(),
        }))
    }

    fn dispatch(&self, job: &Job<'_>, storage: &mut Storage) -> Result<Option<String>> {
        let name = job.program.name();
        let Storage::Texture(target) = storage else {
            return Err(Error::Gpu(format!("{storage:?} cannot be written by {}", self.backend())));
        };

        let (bindings, bound) = self.bind_args(job)?;
        let source = shader::generate(job.program, job.plan, &bindings).ok_or_else(|| {
            Error::UnsupportedBackend {
                backend: self.backend(),
                reason: format!("program `{name}` has no WGSL body"),
            }
        })?;
        let compiled = self.compile(name, &source, job.plan, &bindings)?;

        let device = &self.context.device;
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::TextureView(&target.view),
        }];
        for (i, resource) in bound.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: match resource {
                    Bound::Buffer(buffer) => buffer.as_entire_binding(),
                    Bound::Texture(view) => wgpu::BindingResource::TextureView(view),
                },
            });
        }

        let (x, y, z) = job.plan.xyz();
        self.context.validated(|| {
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{name}_bind_group")),
                layout: &compiled.layout,
                entries: &entries,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{name}_encoder")),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&format!("{name}_pass")),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&compiled.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(
                    (x as u32).div_ceil(shader::WORKGROUP),
                    (y as u32).div_ceil(shader::WORKGROUP),
                    z as u32,
                );
            }
            self.context.queue.submit(Some(encoder.finish()));
        })?;

        tracing::trace!(kernel = name, backend = self.backend().name(), x, y, z, "dispatched");
        Ok(Some(source))
    }

    fn readback(&self, plan: &StoragePlan, storage: &Storage) -> Result<Readback> {
        let Storage::Texture(source) = storage else {
            return Err(Error::ReadbackFailure(format!("{storage:?} is not a texture")));
        };
        let device = &self.context.device;

        let unpadded = source.width * CELL_BYTES;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: u64::from(padded) * u64::from(source.height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(source.height),
                },
            },
            wgpu::Extent3d {
                width: source.width,
                height: source.height,
                depth_or_array_layers: 1,
            },
        );
        self.context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::ReadbackFailure(e.to_string()))?;
        rx.recv()
            .map_err(|e| Error::ReadbackFailure(e.to_string()))?
            .map_err(|e| Error::ReadbackFailure(e.to_string()))?;

        let mut bytes = Vec::with_capacity((unpadded * source.height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(padded as usize) {
                bytes.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        staging.unmap();
        tracing::trace!(bytes = bytes.len(), "read back texture");

        Ok(match plan.cells() {
            CellFormat::Packed => Readback::Texels(bytes),
            CellFormat::Float32 => Readback::Floats(bytemuck::pod_collect_to_vec(&bytes)),
        })
    }

    fn release(&self, storage: Storage) {
        if let Storage::Texture(t) = storage {
            t.texture.destroy();
        }
    }

    fn shutdown(&self) {
        self.pipelines.lock().clear();
        self.context.device.destroy();
        tracing::debug!(backend = self.backend().name(), "device destroyed");
    }
}
