//! Device interface.
//!
//! A [`Device`] owns whatever backend context it needs and hands out
//! [`Storage`] sized by a [`StoragePlan`]. The kernel that asked for the
//! storage owns it from then on and gives it back through
//! [`Device::release`].
//!
//! Readback always returns cells in grid order (row-major, `x` fastest), as
//! plain floats or as raw texel bytes, and the kernel decides how to turn that
//! into an [`Array`](crate::Array).

use crate::backend::Backend;
use crate::error::Result;
use crate::kernel::Arg;
use crate::output::StoragePlan;
use crate::program::Program;

/// Backend-native output storage.
pub enum Storage {
    /// Host memory, one `f32` per cell.
    Host(Vec<f32>),
    /// A device texture.
    #[cfg(feature = "wgpu")]
    Texture(super::wgpu::TextureStorage),
    /// Host memory, four channel bytes per cell.
    #[cfg(test)]
    Cells(Vec<u8>),
}

impl core::fmt::Debug for Storage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Host(cells) => write!(f, "Storage::Host({} cells)", cells.len()),
            #[cfg(feature = "wgpu")]
            Self::Texture(t) => write!(f, "Storage::Texture({t:?})"),
            #[cfg(test)]
            Self::Cells(bytes) => write!(f, "Storage::Cells({} bytes)", bytes.len()),
        }
    }
}

/// Cells read back from storage, in grid order.
#[derive(Debug, Clone, PartialEq)]
pub enum Readback {
    /// Native float cells.
    Floats(Vec<f32>),
    /// Packed cells, four bytes each.
    Texels(Vec<u8>),
}

/// One dispatch request.
#[derive(Debug, Clone, Copy)]
pub struct Job<'a> {
    /// The program to run once per output coordinate.
    pub program: &'a Program,
    /// Output storage plan.
    pub plan: &'a StoragePlan,
    /// Arguments, already checked against the program's parameters.
    pub args: &'a [Arg<'a>],
}

/// What each backend must provide.
pub trait Device: Send + Sync + core::fmt::Debug {
    /// The concrete backend this device runs.
    fn backend(&self) -> Backend;

    /// Checks that `plan` fits this device's storage limits.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOutputShape`](crate::Error::InvalidOutputShape) if the
    /// grid is too large.
    fn fits(&self, _plan: &StoragePlan) -> Result<()> {
        Ok(())
    }

    /// Allocates output storage for `plan`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOutputShape`](crate::Error::InvalidOutputShape) if the
    /// grid does not fit the device, or [`Error::Gpu`](crate::Error::Gpu) if
    /// allocation fails.
    fn allocate(&self, label: &str, plan: &StoragePlan) -> Result<Storage>;

    /// Runs `job` over every output coordinate, writing into `storage`.
    ///
    /// Returns the generated backend source, if the backend generates any.
    ///
    /// # Errors
    ///
    /// Any error from binding arguments, building the program, or running it.
    fn dispatch(&self, job: &Job<'_>, storage: &mut Storage) -> Result<Option<String>>;

    /// Copies `storage` back into host memory.
    ///
    /// # Errors
    ///
    /// [`Error::ReadbackFailure`](crate::Error::ReadbackFailure) if the copy
    /// cannot complete.
    fn readback(&self, plan: &StoragePlan, storage: &Storage) -> Result<Readback>;

    /// Frees `storage`.
    fn release(&self, storage: Storage);

    /// Tears down the device context. Storage must not be used afterwards.
    fn shutdown(&self);
}
