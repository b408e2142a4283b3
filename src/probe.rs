//! Capability probe.
//!
//! Answers "can this backend run kernels here?" without holding on to any
//! device. The system answer is computed once per process and cached; it is
//! read-only afterwards, so concurrent readers need no further locking.

use crate::backend::Backend;

/// Availability query used by the mode resolver.
pub trait Probe {
    /// Whether `backend` can run kernels in this environment.
    ///
    /// Implementations must return `true` for [`Backend::Cpu`].
    fn is_available(&self, backend: Backend) -> bool;
}

/// Probe backed by adapter enumeration, cached for the process lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl Probe for SystemProbe {
    fn is_available(&self, backend: Backend) -> bool {
        // cpu never needs the adapter scan
        backend == Backend::Cpu || AVAILABILITY[backend as usize]
    }
}

lazy_static::lazy_static! {
    static ref AVAILABILITY: [bool; 5] = detect();
}

fn detect() -> [bool; 5] {
    let mut found = [false; 5];
    found[Backend::Cpu as usize] = true;

    #[cfg(feature = "wgpu")]
    for backend in Backend::ALL.into_iter().filter(|b| b.is_gpu()) {
        found[backend as usize] = detect_wgpu(backend);
    }

    tracing::debug!(
        backends = ?Backend::ALL
            .into_iter()
            .filter(|b| found[*b as usize])
            .map(Backend::name)
            .collect::<Vec<_>>(),
        "capability probe finished"
    );
    found
}

#[cfg(feature = "wgpu")]
fn detect_wgpu(backend: Backend) -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: backend.wgpu_backends(),
        ..Default::default()
    });
    instance
        .enumerate_adapters(backend.wgpu_backends())
        .iter()
        .any(|adapter| {
            crate::ops::wgpu::require_compute(backend, adapter.get_downlevel_capabilities().flags)
                .is_ok()
        })
}

/// Whether `backend` is usable, according to the cached system probe.
///
/// # Example
///
/// ```
/// use briny_kernel::{is_available, Backend};
/// assert!(is_available(Backend::Cpu));
/// ```
#[must_use]
pub fn is_available(backend: Backend) -> bool {
    SystemProbe.is_available(backend)
}

/// Every usable backend, most capable first. Always ends with the CPU.
#[must_use]
pub fn available_backends() -> Vec<Backend> {
    Backend::ALL.into_iter().filter(|&b| is_available(b)).collect()
}
