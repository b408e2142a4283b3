//! Parallel CPU backend.
//!
//! # CPU Backend
//!
//! Runs a program's host body once per output coordinate, in parallel over
//! grid rows with [`rayon`](https://docs.rs/rayon). Storage is a plain
//! `Vec<f32>` in grid order, so the CPU never needs the float codec and its
//! readback is a copy.
//!
//! ## Deferred inputs
//!
//! A deferred argument is materialized before the dispatch starts. Host
//! bodies only ever see [`Input`]s.
//!
//! ## Design Goals
//!
//! - Results identical to every GPU backend for the same program
//! - Deterministic: one write per cell, no reductions across threads

use rayon::prelude::*;

use super::dispatch::{Device, Job, Readback, Storage};
use crate::array::Array;
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::kernel::Arg;
use crate::output::StoragePlan;
use crate::program::{Input, Program, Thread};

/// Host execution device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDevice;

/// An argument with deferred results pulled into host memory.
enum Resolved<'a> {
    Scalar(f32),
    Borrowed(&'a Array),
    Owned(Array),
}

impl Resolved<'_> {
    fn input(&self) -> Input<'_> {
        match self {
            Self::Scalar(v) => Input::Scalar(*v),
            Self::Borrowed(a) => Input::Array(a),
            Self::Owned(a) => Input::Array(a),
        }
    }
}

fn resolve<'a>(args: &'a [Arg<'a>]) -> Result<Vec<Resolved<'a>>> {
    args.iter()
        .map(|arg| {
            Ok(match arg {
                Arg::Scalar(v) => Resolved::Scalar(*v),
                Arg::Array(a) => Resolved::Borrowed(a),
                Arg::Deferred(d) => Resolved::Owned(d.materialize()?),
            })
        })
        .collect()
}

/// Zeroed host cells for `plan`, or an error if the host cannot hold them.
fn host_cells(plan: &StoragePlan) -> Result<Vec<f32>> {
    let mut cells = Vec::new();
    cells.try_reserve_exact(plan.cell_count()).map_err(|e| {
        Error::shape(plan.extents(), format!("cannot allocate host storage: {e}"))
    })?;
    cells.resize(plan.cell_count(), 0.0);
    Ok(cells)
}

/// Runs `program` over every cell of `plan` and returns the cells in grid
/// order.
///
/// # Errors
///
/// - [`Error::InvalidOutputShape`] if the grid does not fit in host memory
/// - any error from materializing a deferred argument
pub fn evaluate(program: &Program, plan: &StoragePlan, args: &[Arg<'_>]) -> Result<Vec<f32>> {
    let resolved = resolve(args)?;
    let inputs: Vec<Input<'_>> = resolved.iter().map(Resolved::input).collect();
    let (width, rows, _) = plan.xyz();

    let mut cells = host_cells(plan)?;
    cells
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, out)| {
            let (y, z) = (row % rows, row / rows);
            for (x, cell) in out.iter_mut().enumerate() {
                *cell = program.call_host(Thread { x, y, z }, &inputs);
            }
        });
    Ok(cells)
}

impl Device for CpuDevice {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn allocate(&self, label: &str, plan: &StoragePlan) -> Result<Storage> {
        tracing::debug!(kernel = label, cells = plan.cell_count(), "allocating host storage");
        host_cells(plan).map(Storage::Host)
    }

    #[allow(irrefutable_let_patterns)]
    fn dispatch(&self, job: &Job<'_>, storage: &mut Storage) -> Result<Option<String>> {
        let Storage::Host(cells) = storage else {
            return Err(Error::Gpu(format!("{storage:?} cannot be written by the CPU")));
        };
        tracing::trace!(kernel = job.program.name(), "cpu dispatch");
        *cells = evaluate(job.program, job.plan, job.args)?;
        Ok(None)
    }

    fn readback(&self, _plan: &StoragePlan, storage: &Storage) -> Result<Readback> {
        match storage {
            Storage::Host(cells) => Ok(Readback::Floats(cells.clone())),
            #[allow(unreachable_patterns)]
            other => Err(Error::ReadbackFailure(format!("{other:?} is not host storage"))),
        }
    }

    fn release(&self, storage: Storage) {
        drop(storage);
    }

    fn shutdown(&self) {}
}
