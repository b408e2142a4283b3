//! The owning context for kernels.
//!
//! A [`Runtime`] resolves its [`Mode`] once, opens the device for the chosen
//! backend and hands out [`Kernel`]s bound to it. It keeps a weak reference
//! to every kernel's storage slot so [`Runtime::destroy`] can release all of
//! it, and the device, in one go.
//!
//! # Fallback
//!
//! Under [`Mode::Auto`] and [`Mode::Gpu`] a backend that the probe reported
//! but that then fails to open is skipped with a warning, and the next
//! candidate in preference order is tried. A concrete mode never falls back.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{self, Backend, Mode};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, Slot};
use crate::ops::cpu::CpuDevice;
use crate::ops::dispatch::Device;
use crate::output::{KernelConfig, OutputDescriptor};
use crate::probe::{Probe, SystemProbe};
use crate::program::Program;

/// Opens the device for one concrete backend.
fn open(backend: Backend) -> Result<Arc<dyn Device>> {
    match backend {
        Backend::Cpu => Ok(Arc::new(CpuDevice)),
        #[cfg(feature = "wgpu")]
        gpu => Ok(Arc::new(crate::ops::wgpu::WgpuDevice::new(gpu)?)),
        #[cfg(not(feature = "wgpu"))]
        gpu => Err(Error::UnsupportedBackend {
            backend: gpu,
            reason: "built without the `wgpu` feature".into(),
        }),
    }
}

/// Owns a device and the kernels created on it.
///
/// # Example
///
/// ```
/// use briny_kernel::{KernelConfig, Mode, Program, Runtime};
///
/// let mut runtime = Runtime::new(Mode::Cpu)?;
/// let iota = Program::new("iota", vec![], |t, _| t.x as f32 + 1.0)
///     .with_wgsl("return f32(thread.x) + 1.0;");
/// let mut kernel = runtime.create_kernel(iota, KernelConfig::new([5]))?;
/// let values = kernel.invoke(&[])?.into_array()?;
/// assert_eq!(values.as_1d(), Some(&[1.0, 2.0, 3.0, 4.0, 5.0][..]));
/// runtime.destroy();
/// # Ok::<(), briny_kernel::Error>(())
/// ```
#[derive(Debug)]
pub struct Runtime {
    mode: Mode,
    device: Arc<dyn Device>,
    kernels: Vec<Weak<Mutex<Slot>>>,
    destroyed: bool,
}

impl Runtime {
    /// Creates a runtime using the system capability probe.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedBackend`] if a concrete mode's backend (or, for
    /// [`Mode::Gpu`], every GPU-accelerated backend) is unavailable.
    /// [`Mode::Auto`] never fails: the CPU is always there.
    pub fn new(mode: Mode) -> Result<Self> {
        Self::with_probe(mode, &SystemProbe)
    }

    /// Creates a runtime from [`MODE_ENV`](crate::backend::MODE_ENV), or the
    /// process default mode if the variable is unset or invalid.
    ///
    /// # Errors
    ///
    /// See [`Runtime::new`].
    pub fn from_default() -> Result<Self> {
        Self::new(Mode::from_env().unwrap_or_else(backend::default_mode))
    }

    /// Creates a runtime with a custom probe.
    ///
    /// # Errors
    ///
    /// See [`Runtime::new`].
    pub fn with_probe(mode: Mode, probe: &dyn Probe) -> Result<Self> {
        let first = backend::resolve(mode, probe)?;
        let candidates = mode
            .candidates()
            .into_iter()
            .skip_while(|&b| b != first)
            .filter(|&b| probe.is_available(b));

        let mut failure = None;
        for candidate in candidates {
            match open(candidate) {
                Ok(device) => {
                    return Ok(Self {
                        mode,
                        device,
                        kernels: Vec::new(),
                        destroyed: false,
                    });
                }
                Err(e) if mode.backend().is_none() => {
                    tracing::warn!(backend = %candidate, error = %e, "falling back");
                    failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(failure.unwrap_or_else(|| Error::UnsupportedBackend {
            backend: first,
            reason: "no candidate backend could be opened".into(),
        }))
    }

    /// The mode this runtime was asked for.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// The concrete backend in use.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.device.backend()
    }

    /// Whether [`Runtime::destroy`] has been called.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Number of kernels created here that are still alive.
    #[must_use]
    pub fn live_kernels(&self) -> usize {
        self.kernels.iter().filter(|k| k.strong_count() > 0).count()
    }

    /// Builds a kernel running `program` with output `config`.
    ///
    /// The output descriptor and storage plan are fixed here, once.
    ///
    /// # Errors
    ///
    /// - [`Error::KernelDestroyed`] after [`Runtime::destroy`]
    /// - [`Error::InvalidOutputShape`] for a bad output shape
    /// - [`Error::UnsupportedBackend`] if `program` has no WGSL body and the
    ///   backend is GPU-accelerated
    pub fn create_kernel(&mut self, program: Program, config: KernelConfig) -> Result<Kernel> {
        if self.destroyed {
            return Err(Error::KernelDestroyed(program.name().to_owned()));
        }
        let descriptor = OutputDescriptor::build(&config)?;
        let kernel = Kernel::new(program, descriptor, Arc::clone(&self.device))?;
        self.kernels.retain(|k| k.strong_count() > 0);
        self.kernels.push(Arc::downgrade(kernel.slot()));
        Ok(kernel)
    }

    /// Releases every kernel's storage and the device. Safe to repeat.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for slot in self.kernels.drain(..).filter_map(|k| k.upgrade()) {
            slot.lock().destroy(self.device.as_ref());
        }
        self.device.shutdown();
        self.destroyed = true;
        tracing::debug!(backend = %self.backend(), "runtime destroyed");
    }
}
