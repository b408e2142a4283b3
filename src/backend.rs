//! Backend selection module.
//!
//! This module defines the concrete computation backends, the requested
//! [`Mode`], and the resolver that turns one into the other.
//!
//! # Supported Backends
//!
//! - `Vulkan`, `Metal`, `Dx12` — GPU-accelerated through `wgpu`, with native
//!   full-precision (`r32float`) output cells.
//! - `Gl` — GPU-accelerated through `wgpu`'s GL path. Its output cells are
//!   four 8-bit channels, so float results need the codec to survive.
//! - `Cpu` — pure Rust backend using `rayon`, always available.
//!
//! # Resolution
//!
//! [`Mode::Auto`] walks [`PREFERENCE`] and picks the first available backend.
//! Since the CPU is always available, `Auto` never fails. A concrete mode
//! fails with [`Error::UnsupportedBackend`] when its backend is missing.
//!
//! The process-wide default mode is stored in an `AtomicU8`, the same way a
//! global backend switch would be, so it can be changed cheaply at runtime.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::probe::Probe;

/// Environment variable read by [`Mode::from_env`].
pub const MODE_ENV: &str = "BRINY_KERNEL_MODE";

/// A concrete backend a kernel runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host execution over `rayon` (default).
    #[default]
    Cpu = 0,
    /// `wgpu` on Vulkan.
    Vulkan = 1,
    /// `wgpu` on Metal.
    Metal = 2,
    /// `wgpu` on Direct3D 12.
    Dx12 = 3,
    /// `wgpu` on OpenGL / GLES.
    Gl = 4,
}

/// Order in which [`Mode::Auto`] tries backends: most capable first.
pub const PREFERENCE: [Backend; 5] = [
    Backend::Vulkan,
    Backend::Metal,
    Backend::Dx12,
    Backend::Gl,
    Backend::Cpu,
];

impl Backend {
    /// Every backend, in preference order.
    pub const ALL: [Self; 5] = PREFERENCE;

    /// Lower-case name used in configuration and messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Vulkan => "vulkan",
            Self::Metal => "metal",
            Self::Dx12 => "dx12",
            Self::Gl => "gl",
        }
    }

    /// Whether this backend runs on a GPU.
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Whether output cells hold a full 32-bit float without help.
    ///
    /// `false` means results written with `optimize_float_memory` go through
    /// the byte-splitting [`Codec`](crate::codec::Codec).
    #[must_use]
    pub const fn native_float_storage(self) -> bool {
        !matches!(self, Self::Gl)
    }

    #[cfg(feature = "wgpu")]
    pub(crate) const fn wgpu_backends(self) -> wgpu::Backends {
        match self {
            Self::Cpu => wgpu::Backends::empty(),
            Self::Vulkan => wgpu::Backends::VULKAN,
            Self::Metal => wgpu::Backends::METAL,
            Self::Dx12 => wgpu::Backends::DX12,
            Self::Gl => wgpu::Backends::GL,
        }
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Vulkan),
            2 => Ok(Self::Metal),
            3 => Ok(Self::Dx12),
            4 => Ok(Self::Gl),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|b| b.name() == lower)
            .ok_or_else(|| format!("unknown backend `{s}`"))
    }
}

/// The mode a runtime is asked to run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Mode {
    /// Best available backend, CPU last.
    #[default]
    Auto = 0,
    /// Best available GPU-accelerated backend; never the CPU.
    Gpu = 1,
    /// Force the CPU backend.
    Cpu = 2,
    /// Force Vulkan.
    Vulkan = 3,
    /// Force Metal.
    Metal = 4,
    /// Force Direct3D 12.
    Dx12 = 5,
    /// Force OpenGL / GLES.
    Gl = 6,
}

impl Mode {
    /// The concrete backend this mode names, if any.
    #[must_use]
    pub const fn backend(self) -> Option<Backend> {
        match self {
            Self::Auto | Self::Gpu => None,
            Self::Cpu => Some(Backend::Cpu),
            Self::Vulkan => Some(Backend::Vulkan),
            Self::Metal => Some(Backend::Metal),
            Self::Dx12 => Some(Backend::Dx12),
            Self::Gl => Some(Backend::Gl),
        }
    }

    /// Candidates this mode may resolve to, in the order they are tried.
    #[must_use]
    pub fn candidates(self) -> Vec<Backend> {
        match self {
            Self::Auto => PREFERENCE.to_vec(),
            Self::Gpu => PREFERENCE.into_iter().filter(|b| b.is_gpu()).collect(),
            _ => self.backend().into_iter().collect(),
        }
    }

    /// Reads the mode from [`MODE_ENV`], if set and valid.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(MODE_ENV).ok()?;
        match raw.parse() {
            Ok(mode) => Some(mode),
            Err(err) => {
                tracing::warn!("ignoring {MODE_ENV}: {err}");
                None
            }
        }
    }
}

impl From<Backend> for Mode {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Cpu => Self::Cpu,
            Backend::Vulkan => Self::Vulkan,
            Backend::Metal => Self::Metal,
            Backend::Dx12 => Self::Dx12,
            Backend::Gl => Self::Gl,
        }
    }
}

impl TryFrom<u8> for Mode {
    type Error = ();

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Auto),
            1 => Ok(Self::Gpu),
            2 => Ok(Self::Cpu),
            3 => Ok(Self::Vulkan),
            4 => Ok(Self::Metal),
            5 => Ok(Self::Dx12),
            6 => Ok(Self::Gl),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Gpu => f.write_str("gpu"),
            other => match other.backend() {
                Some(b) => f.write_str(b.name()),
                None => Ok(()),
            },
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "gpu" => Ok(Self::Gpu),
            other => other.parse::<Backend>().map(Self::from),
        }
    }
}

/// Process-wide default mode.
///
/// Relaxed ordering is enough: the value changes rarely and is only read
/// when a runtime is constructed.
static GLOBAL_DEFAULT_MODE: AtomicU8 = AtomicU8::new(Mode::Auto as u8);

/// Sets the mode used by [`Runtime::from_default`](crate::Runtime::from_default).
///
/// # Example
///
/// ```
/// use briny_kernel::backend::{default_mode, set_default_mode, Mode};
/// set_default_mode(Mode::Cpu);
/// assert_eq!(default_mode(), Mode::Cpu);
/// ```
pub fn set_default_mode(mode: Mode) {
    GLOBAL_DEFAULT_MODE.store(mode as u8, Ordering::Relaxed);
}

/// Returns the process-wide default mode.
///
/// If the stored value is invalid, defaults to [`Mode::Auto`].
pub fn default_mode() -> Mode {
    Mode::try_from(GLOBAL_DEFAULT_MODE.load(Ordering::Relaxed)).unwrap_or_default()
}

/// Resolves a requested mode to the first available concrete backend.
///
/// # Errors
///
/// [`Error::UnsupportedBackend`] when a concrete mode's backend is missing,
/// or when [`Mode::Gpu`] finds no GPU-accelerated backend at all.
pub fn resolve(mode: Mode, probe: &dyn Probe) -> Result<Backend> {
    let candidates = mode.candidates();
    if let Some(found) = candidates.iter().copied().find(|&b| probe.is_available(b)) {
        tracing::info!(%mode, backend = %found, "resolved backend");
        return Ok(found);
    }

    let backend = mode.backend().unwrap_or(Backend::Vulkan);
    Err(Error::UnsupportedBackend {
        backend,
        reason: match mode {
            Mode::Gpu => "no GPU-accelerated backend is available".into(),
            _ => "no usable adapter was found".into(),
        },
    })
}
