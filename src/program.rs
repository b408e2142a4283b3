//! Compiled kernel programs.
//!
//! Turning user source into something a backend can run is not this crate's
//! job. A [`Program`] is the finished artifact: a host body for the CPU, an
//! optional WGSL body for GPU backends, and the parameters both expect.
//!
//! # WGSL bodies
//!
//! The WGSL body becomes the inside of
//!
//! ```text
//! fn kernel_body(thread: vec3<u32>) -> f32 { <body> }
//! ```
//!
//! and reads its inputs through generated accessors, outermost coordinate
//! first: `arg0(x)` for rank 1, `arg0(y, x)` for rank 2, `arg0(z, y, x)` for
//! rank 3 and `arg0()` for scalars.

use std::fmt;
use std::sync::Arc;

use crate::array::Array;

/// Coordinates of one logical invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Thread {
    /// Innermost coordinate.
    pub x: usize,
    /// Row.
    pub y: usize,
    /// Slice.
    pub z: usize,
}

/// A host-side view of one argument, as seen by a program's host body.
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    /// A scalar argument.
    Scalar(f32),
    /// An array argument.
    Array(&'a Array),
}

impl Input<'_> {
    /// The scalar value; arrays yield their first element.
    #[must_use]
    pub fn value(&self) -> f32 {
        match self {
            Self::Scalar(v) => *v,
            Self::Array(a) => a.get(0, 0, 0).unwrap_or(0.0),
        }
    }

    /// `input[x]`; out of range reads yield `0.0`, like an unbound texel.
    #[must_use]
    pub fn at1(&self, x: usize) -> f32 {
        self.at3(0, 0, x)
    }

    /// `input[y][x]`.
    #[must_use]
    pub fn at2(&self, y: usize, x: usize) -> f32 {
        self.at3(0, y, x)
    }

    /// `input[z][y][x]`.
    #[must_use]
    pub fn at3(&self, z: usize, y: usize, x: usize) -> f32 {
        match self {
            Self::Scalar(v) => *v,
            Self::Array(a) => a.get(x, y, z).unwrap_or(0.0),
        }
    }
}

/// Host body signature.
pub type HostFn = dyn Fn(Thread, &[Input<'_>]) -> f32 + Send + Sync;

/// A declared program parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// A single `f32`.
    Scalar,
    /// An array of the given rank, optionally with fixed extents (x first).
    Array {
        /// Expected rank.
        rank: usize,
        /// Expected extents, if the program depends on them.
        extents: Option<Vec<usize>>,
    },
}

impl Param {
    /// An array parameter of any extents.
    #[must_use]
    pub const fn array(rank: usize) -> Self {
        Self::Array {
            rank,
            extents: None,
        }
    }

    /// An array parameter with fixed extents.
    pub fn shaped(extents: impl Into<Vec<usize>>) -> Self {
        let extents = extents.into();
        Self::Array {
            rank: extents.len(),
            extents: Some(extents),
        }
    }
}

/// A compiled kernel program.
///
/// # Example
///
/// ```
/// use briny_kernel::{Param, Program};
///
/// let identity = Program::new("identity", vec![Param::array(1)], |t, args| args[0].at1(t.x))
///     .with_wgsl("return arg0(thread.x);");
/// assert_eq!(identity.name(), "identity");
/// ```
#[derive(Clone)]
pub struct Program {
    name: String,
    params: Vec<Param>,
    host: Arc<HostFn>,
    wgsl: Option<String>,
}

impl Program {
    /// A program with a host body only.
    pub fn new<F>(name: impl Into<String>, params: Vec<Param>, host: F) -> Self
    where
        F: Fn(Thread, &[Input<'_>]) -> f32 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params,
            host: Arc::new(host),
            wgsl: None,
        }
    }

    /// Attaches the WGSL body used by GPU backends.
    #[must_use]
    pub fn with_wgsl(mut self, body: impl Into<String>) -> Self {
        self.wgsl = Some(body.into());
        self
    }

    /// Program name, used in labels and messages.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameters.
    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// The WGSL body, if the program was compiled for GPU backends.
    #[must_use]
    pub fn wgsl(&self) -> Option<&str> {
        self.wgsl.as_deref()
    }

    /// Runs the host body for one thread.
    #[inline]
    pub fn call_host(&self, thread: Thread, inputs: &[Input<'_>]) -> f32 {
        (self.host)(thread, inputs)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("wgsl", &self.wgsl.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_body_reads_inputs() {
        let p = Program::new("sum", vec![Param::array(2), Param::Scalar], |t, args| {
            args[0].at2(t.y, t.x) + args[1].value()
        });
        let m = Array::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let inputs = [Input::Array(&m), Input::Scalar(10.0)];
        assert_eq!(p.call_host(Thread { x: 1, y: 1, z: 0 }, &inputs), 14.0);
        assert!(p.wgsl().is_none());
    }

    #[test]
    fn out_of_range_reads_are_zero() {
        let a = Array::from(vec![1.0]);
        assert_eq!(Input::Array(&a).at1(3), 0.0);
    }

    #[test]
    fn shaped_params_record_rank() {
        assert_eq!(
            Param::shaped([5, 3]),
            Param::Array {
                rank: 2,
                extents: Some(vec![5, 3])
            }
        );
    }
}
