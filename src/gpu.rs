// Headless device acquisition and shader preprocessing.
//
// The surrounding application owns windows, swapchains and frame pacing;
// this crate only needs a device, a queue and the subgroup capability
// bits, so `GpuContext` wraps exactly that.

use std::borrow::Cow;

use tracing::{debug, info};

use crate::error::{Result, WrsError};

/// Device handle plus the capability bits the kernels specialize against.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Subgroup size the kernels are specialized for. wgpu reports a
    /// [min, max] range; kernels use the minimum so shuffle networks never
    /// address lanes that may not exist.
    subgroup_size: u32,
    /// Whether the adapter is assumed to co-schedule all workgroups of a
    /// dispatch. Decoupled-lookback kernels spin on predecessor state and
    /// deadlock on devices that serialize workgroups.
    concurrent_workgroups: bool,
}

impl GpuContext {
    /// Acquire a high-performance adapter and a device with subgroup
    /// operations enabled. Blocks on the async wgpu entry points.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| WrsError::NoDevice(format!("no adapter: {e}")))?;

        let info = adapter.get_info();
        info!("GPU adapter: {} ({:?})", info.name, info.backend);

        if !adapter.features().contains(wgpu::Features::SUBGROUP) {
            return Err(WrsError::feature(format!(
                "adapter {} does not support subgroup operations",
                info.name
            )));
        }

        let limits = adapter.limits();
        // Some backends report 0 when the range is unknown; 32 is the
        // common width across desktop hardware.
        let subgroup_size = match limits.min_subgroup_size {
            0 => 32,
            size => size,
        };
        debug!(
            "subgroup size range [{}, {}], specializing for {}",
            limits.min_subgroup_size, limits.max_subgroup_size, subgroup_size
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("wrs-gpu device"),
            required_features: wgpu::Features::SUBGROUP,
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| WrsError::NoDevice(format!("device creation failed: {e}")))?;

        // Software rasterizers execute workgroups on a thread pool that may
        // be smaller than the dispatch, which breaks the lookback spin loop.
        let concurrent_workgroups = info.device_type != wgpu::DeviceType::Cpu;

        Ok(Self {
            device,
            queue,
            subgroup_size,
            concurrent_workgroups,
        })
    }

    pub fn subgroup_size(&self) -> u32 {
        self.subgroup_size
    }

    /// Whether the decoupled-lookback primitives are safe on this device.
    /// When false, callers should select the block-wise variants.
    pub fn supports_decoupled(&self) -> bool {
        self.concurrent_workgroups
    }

    /// Compile a WGSL kernel after preprocessing the given source fragments
    /// with defines and integer constants. The `subgroups` language
    /// extension is enabled unconditionally; every pipeline in this crate
    /// runs on a device created with `Features::SUBGROUP`.
    pub(crate) fn compile_shader(
        &self,
        label: &str,
        sources: &[&str],
        defines: &[&str],
        consts: &[(&str, u32)],
    ) -> wgpu::ShaderModule {
        let mut code = String::from("enable subgroups;\n");
        for (name, value) in consts {
            code.push_str(&format!("const {name}: u32 = {value}u;\n"));
        }
        for source in sources {
            code.push_str(&preprocess(source, defines, &[]));
        }
        self.device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(code)),
            })
    }
}

/// Minimal WGSL preprocessor: prepends a `const` header for every entry of
/// `consts` and resolves `//#ifdef NAME` / `//#else` / `//#endif` blocks
/// against `defines`. WGSL has no specialization constants, so variant
/// selection happens here, before `naga` ever sees the text.
pub(crate) fn preprocess(source: &str, defines: &[&str], consts: &[(&str, u32)]) -> String {
    let mut header = String::new();
    for (name, value) in consts {
        header.push_str(&format!("const {name}: u32 = {value}u;\n"));
    }

    let mut out = header;
    // Stack of "is this branch emitting" flags, innermost last.
    let mut emit_stack: Vec<bool> = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim_start();
        if let Some(name) = trimmed.strip_prefix("//#ifdef ") {
            let parent = emit_stack.last().copied().unwrap_or(true);
            emit_stack.push(parent && defines.contains(&name.trim()));
        } else if let Some(name) = trimmed.strip_prefix("//#ifndef ") {
            let parent = emit_stack.last().copied().unwrap_or(true);
            emit_stack.push(parent && !defines.contains(&name.trim()));
        } else if trimmed.starts_with("//#else") {
            let top = emit_stack
                .pop()
                .expect("unbalanced //#else in embedded shader");
            let parent = emit_stack.last().copied().unwrap_or(true);
            emit_stack.push(parent && !top);
        } else if trimmed.starts_with("//#endif") {
            emit_stack
                .pop()
                .expect("unbalanced //#endif in embedded shader");
        } else if emit_stack.last().copied().unwrap_or(true) {
            out.push_str(line);
            out.push('\n');
        }
    }
    debug_assert!(emit_stack.is_empty(), "unbalanced //#ifdef in embedded shader");
    out
}

/// Shorthand for the storage-buffer bind group layout entries every kernel
/// in this crate uses.
pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Uniform binding read at a dynamic offset, used by the chunked sampler
/// and RNG dispatches.
pub(crate) fn dynamic_uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: true,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn dispatch_count(n: u32, block_size: u32) -> u32 {
    n.div_ceil(block_size)
}

/// Fold a linear workgroup count into a (x, y) grid below the per-dimension
/// dispatch limit; kernels linearize with `wg.y * num_workgroups.x + wg.x`
/// and guard against the padding groups of the last row.
pub(crate) fn dispatch_2d(blocks: u32) -> (u32, u32) {
    const LIMIT: u32 = 65_535;
    if blocks <= LIMIT {
        (blocks.max(1), 1)
    } else {
        let x = 32_768;
        (x, blocks.div_ceil(x))
    }
}
