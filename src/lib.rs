//! # `briny_kernel`
//!
//! A kernel execution runtime: numeric programs run once per output
//! coordinate, either on a GPU through `wgpu` or on the CPU through `rayon`,
//! and produce the same 1-D, 2-D or 3-D arrays on every backend.
//!
//! ## Features
//!
//! - **Backend selection**: `auto` picks the most capable available backend
//!   (Vulkan, Metal, DX12, GL, then CPU); concrete modes never fall back
//! - **Float memory optimization**: on backends whose output cells are four
//!   8-bit channels, 32-bit float results are split across the channels and
//!   reassembled on readback, bit for bit
//! - **Pipelines**: results can stay on the device as a [`Deferred`] handle,
//!   feed other kernels directly, and be read back only on demand
//!
//! ## Modules
//!
//! - [`backend`] — backends, modes and mode resolution
//! - [`probe`] — cached per-process capability detection
//! - [`output`] — kernel configuration, output descriptor and storage plan
//! - [`codec`] — the float-in-channels encode/decode pairs
//! - [`program`] — compiled programs as the runtime consumes them
//! - [`kernel`] — invocation and result handles
//! - [`runtime`] — the owning context
//!
//! ## Example
//!
//! ```rust
//! use briny_kernel::{Arg, Array, KernelConfig, Mode, Param, Program, Runtime};
//!
//! let mut runtime = Runtime::new(Mode::Auto)?;
//! let add = Program::new("add", vec![Param::array(1), Param::Scalar], |t, a| {
//!     a[0].at1(t.x) + a[1].value()
//! })
//! .with_wgsl("return arg0(thread.x) + arg1();");
//!
//! let config = KernelConfig::new([5])
//!     .float_output(true)
//!     .optimize_float_memory(true);
//! let mut kernel = runtime.create_kernel(add, config)?;
//! let input = Array::from(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
//! let out = kernel.invoke(&[Arg::Array(&input), Arg::Scalar(0.5)])?.into_array()?;
//! assert_eq!(out, Array::from(vec![1.5, 2.5, 3.5, 4.5, 5.5]));
//! # Ok::<(), briny_kernel::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `wgpu` *(default)* — GPU-accelerated backends; without it only the CPU
//!   exists

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::many_single_char_names,
    clippy::similar_names,
    clippy::module_name_repetitions
)]
#![deny(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

pub mod array;
pub mod backend;
pub mod codec;
pub mod error;
pub mod kernel;
pub mod output;
pub mod probe;
pub mod program;
pub mod runtime;

// device layer, not part of the public API
pub(crate) mod ops;

pub use array::Array;
pub use backend::{Backend, Mode};
pub use codec::Codec;
pub use error::{Error, Result};
pub use kernel::{Arg, Deferred, Kernel, KernelStats, Output};
pub use output::{CellFormat, KernelConfig, OutputDescriptor, StoragePlan};
pub use probe::{available_backends, is_available};
pub use program::{Input, Param, Program, Thread};
pub use runtime::Runtime;
