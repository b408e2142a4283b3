//! # Device Layer
//!
//! Every backend implements [`dispatch::Device`]: allocate output storage,
//! run a program over it, read it back, release it. Kernels never look past
//! that interface; the closed set of implementations is picked once, when a
//! runtime resolves its backend.
//!
//! ## Submodules
//!
//! - [`dispatch`] — the device interface and the storage/readback types
//! - [`cpu`] — host execution over `rayon` (always available)
//! - [`wgpu`] *(default feature)* — compute shaders writing into 2-D storage textures
//!
//! ## Feature Flags
//!
//! - `wgpu` — enables the Vulkan, Metal, Dx12 and GL backends

// device interface...
pub mod dispatch;

// ... implemented by these backends:
pub mod cpu;

#[cfg(feature = "wgpu")]
pub mod wgpu;
