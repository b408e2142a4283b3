//! Output configuration, descriptor and storage plan.
//!
//! A [`KernelConfig`] is what the caller writes. It is checked once, at kernel
//! construction, into an immutable [`OutputDescriptor`], and the descriptor
//! plus the resolved backend decide the [`StoragePlan`]: how big the cell grid
//! is, what each cell holds, and whether the float codec is needed.

use crate::backend::Backend;
use crate::codec::Codec;
use crate::error::{Error, Result};

/// Kernel configuration.
///
/// # Example
///
/// ```
/// use briny_kernel::KernelConfig;
///
/// let config = KernelConfig::new([5, 3])
///     .float_output(true)
///     .optimize_float_memory(true);
/// assert_eq!(config.output(), &[5, 3]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    output: Vec<usize>,
    float_output: bool,
    optimize_float_memory: bool,
    pipeline: bool,
}

impl KernelConfig {
    /// Configuration for an output of the given extents, x first.
    pub fn new(output: impl Into<Vec<usize>>) -> Self {
        Self {
            output: output.into(),
            float_output: false,
            optimize_float_memory: false,
            pipeline: false,
        }
    }

    /// Results must keep full 32-bit float precision.
    #[must_use]
    pub const fn float_output(mut self, on: bool) -> Self {
        self.float_output = on;
        self
    }

    /// Pack floats into four 8-bit channels on backends without float cells.
    #[must_use]
    pub const fn optimize_float_memory(mut self, on: bool) -> Self {
        self.optimize_float_memory = on;
        self
    }

    /// Keep results on the device and return a deferred handle.
    #[must_use]
    pub const fn pipeline(mut self, on: bool) -> Self {
        self.pipeline = on;
        self
    }

    /// The configured extents, x first.
    #[must_use]
    pub fn output(&self) -> &[usize] {
        &self.output
    }
}

/// Output rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    /// `[x]`
    One = 1,
    /// `[x, y]`
    Two = 2,
    /// `[x, y, z]`
    Three = 3,
}

impl Rank {
    fn of(len: usize) -> Option<Self> {
        match len {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            _ => None,
        }
    }
}

/// The checked, immutable output description of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    rank: Rank,
    extents: Vec<usize>,
    float_output: bool,
    optimize_float_memory: bool,
    pipeline: bool,
}

impl OutputDescriptor {
    /// Checks a configuration.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOutputShape`] if the extents are not rank 1–3,
    /// contain a zero, or describe more cells than can be addressed.
    pub fn build(config: &KernelConfig) -> Result<Self> {
        let extents = config.output.clone();
        let rank = Rank::of(extents.len())
            .ok_or_else(|| Error::shape(&extents, "rank must be 1, 2 or 3"))?;
        if extents.contains(&0) {
            return Err(Error::shape(&extents, "extents must be positive"));
        }
        addressable_cells(&extents)?;
        Ok(Self {
            rank,
            extents,
            float_output: config.float_output,
            optimize_float_memory: config.optimize_float_memory,
            pipeline: config.pipeline,
        })
    }

    /// Output rank.
    #[must_use]
    pub const fn rank(&self) -> Rank {
        self.rank
    }

    /// Output extents, x first.
    #[must_use]
    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    /// Whether full float precision was requested.
    #[must_use]
    pub const fn float_output(&self) -> bool {
        self.float_output
    }

    /// Whether float memory optimization was requested.
    #[must_use]
    pub const fn optimize_float_memory(&self) -> bool {
        self.optimize_float_memory
    }

    /// Whether results stay on the device.
    #[must_use]
    pub const fn pipeline(&self) -> bool {
        self.pipeline
    }

    /// `(x, y, z)` with missing dimensions set to 1.
    #[must_use]
    pub fn xyz(&self) -> (usize, usize, usize) {
        let at = |i: usize| self.extents.get(i).copied().unwrap_or(1);
        (at(0), at(1), at(2))
    }

    /// Number of output cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.iter().product()
    }

    /// Always `false`: extents are positive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Decides storage for this output on `backend`.
    ///
    /// The codec is only selected when float precision is requested, the
    /// optimization is on, and the backend cannot hold a float per cell. The
    /// CPU always stores plain floats.
    #[must_use]
    pub fn plan(&self, backend: Backend) -> StoragePlan {
        let codec = (self.float_output
            && self.optimize_float_memory
            && !backend.native_float_storage())
        .then(|| Codec::for_rank(self.rank));
        let (width, height) = grid_size(self);
        StoragePlan {
            extents: self.extents.clone(),
            width,
            height,
            cells: if codec.is_some() {
                CellFormat::Packed
            } else {
                CellFormat::Float32
            },
            codec,
        }
    }
}

/// What a single storage cell holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellFormat {
    /// One native 32-bit float.
    Float32,
    /// Four 8-bit channels carrying the bytes of a 32-bit float.
    Packed,
}

/// Where and how a kernel's output lives on its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePlan {
    extents: Vec<usize>,
    width: usize,
    height: usize,
    cells: CellFormat,
    codec: Option<Codec>,
}

impl StoragePlan {
    /// Output extents, x first.
    #[must_use]
    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    /// Grid size in cells, `(width, height)`.
    #[must_use]
    pub const fn grid(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Cell format.
    #[must_use]
    pub const fn cells(&self) -> CellFormat {
        self.cells
    }

    /// The codec, when the plan packs floats into channels.
    #[must_use]
    pub const fn codec(&self) -> Option<Codec> {
        self.codec
    }

    /// `(x, y, z)` with missing dimensions set to 1.
    #[must_use]
    pub fn xyz(&self) -> (usize, usize, usize) {
        let at = |i: usize| self.extents.get(i).copied().unwrap_or(1);
        (at(0), at(1), at(2))
    }

    /// Number of cells in the grid.
    #[must_use]
    pub const fn cell_count(&self) -> usize {
        self.width * self.height
    }
}

/// Cell count of `extents`, refusing grids whose bytes exceed `isize::MAX`.
pub(crate) fn addressable_cells(extents: &[usize]) -> Result<usize> {
    let cells = extents
        .iter()
        .try_fold(1usize, |acc, &e| acc.checked_mul(e))
        .ok_or_else(|| Error::shape(extents, "cell count overflows usize"))?;
    match cells.checked_mul(size_of::<f32>()) {
        Some(bytes) if isize::try_from(bytes).is_ok() => Ok(cells),
        _ => Err(Error::shape(
            extents,
            format!("{cells} cells exceed the addressable size"),
        )),
    }
}

/// Rank 1 is a single row, rank 2 the grid itself, and rank 3 stacks its Z
/// slices along the grid's y axis.
fn grid_size(descriptor: &OutputDescriptor) -> (usize, usize) {
    let (x, y, z) = descriptor.xyz();
    (x, y * z)
}
