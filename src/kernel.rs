//! Kernels, invocation and result handles.
//!
//! A [`Kernel`] pairs a [`Program`] with a checked [`OutputDescriptor`] and
//! the [`StoragePlan`] for the backend its runtime resolved. It owns its
//! output storage, allocating it on first invocation and reusing it after.
//!
//! # Result handles
//!
//! [`Kernel::invoke`] returns an [`Output`]:
//!
//! - `pipeline == false`: the storage is read back and decoded before
//!   returning, giving [`Output::Materialized`]
//! - `pipeline == true`: [`Output::Deferred`], a handle that reads back only
//!   when [`Deferred::materialize`] is called, and that can be passed straight
//!   into another kernel's invocation
//!
//! Storage is single-buffered. A [`Deferred`] borrows its kernel, so the
//! kernel cannot be invoked again or destroyed while a handle is alive:
//!
//! ```compile_fail
//! # use briny_kernel::{KernelConfig, Mode, Program, Runtime};
//! let mut runtime = Runtime::new(Mode::Cpu).unwrap();
//! let program = Program::new("one", vec![], |_, _| 1.0);
//! let mut kernel = runtime.create_kernel(program, KernelConfig::new([2]).pipeline(true)).unwrap();
//! let first = kernel.invoke(&[]).unwrap();
//! let second = kernel.invoke(&[]).unwrap(); // `kernel` is still borrowed by `first`
//! drop(first);
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::array::Array;
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::ops::dispatch::{Device, Job, Readback, Storage};
use crate::output::{OutputDescriptor, StoragePlan};
use crate::program::{Param, Program};

/// One invocation argument.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    /// A scalar.
    Scalar(f32),
    /// A host array.
    Array(&'a Array),
    /// Another kernel's deferred result.
    Deferred(&'a Deferred<'a>),
}

impl From<f32> for Arg<'_> {
    fn from(v: f32) -> Self {
        Self::Scalar(v)
    }
}

impl<'a> From<&'a Array> for Arg<'a> {
    fn from(a: &'a Array) -> Self {
        Self::Array(a)
    }
}

impl<'a> From<&'a Deferred<'a>> for Arg<'a> {
    fn from(d: &'a Deferred<'a>) -> Self {
        Self::Deferred(d)
    }
}

/// Diagnostic counters for one kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Successful invocations.
    pub invocations: u64,
    /// Storage readbacks into host memory.
    pub readbacks: u64,
    /// Codec decodes of packed readbacks.
    pub decodes: u64,
}

/// State shared between a kernel and the runtime that created it.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    storage: Option<Storage>,
    destroyed: bool,
    source: Option<String>,
    stats: KernelStats,
}

impl Slot {
    /// Frees storage and marks the slot dead. Safe to repeat.
    pub(crate) fn destroy(&mut self, device: &dyn Device) {
        if let Some(storage) = self.storage.take() {
            device.release(storage);
        }
        self.destroyed = true;
    }
}

/// A program bound to an output shape on one backend.
#[derive(Debug)]
pub struct Kernel {
    program: Program,
    descriptor: OutputDescriptor,
    plan: StoragePlan,
    device: Arc<dyn Device>,
    slot: Arc<Mutex<Slot>>,
}

impl Kernel {
    /// Builds a kernel. The output descriptor is checked by the caller.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedBackend`] if the program cannot run on the
    ///   device's backend
    /// - [`Error::InvalidOutputShape`] if the storage grid does not fit
    pub(crate) fn new(
        program: Program,
        descriptor: OutputDescriptor,
        device: Arc<dyn Device>,
    ) -> Result<Self> {
        let backend = device.backend();
        if backend.is_gpu() && program.wgsl().is_none() {
            return Err(Error::UnsupportedBackend {
                backend,
                reason: format!("program `{}` has no WGSL body", program.name()),
            });
        }
        let plan = descriptor.plan(backend);
        device.fits(&plan)?;
        tracing::debug!(
            kernel = program.name(),
            backend = backend.name(),
            extents = ?plan.extents(),
            codec = ?plan.codec(),
            pipeline = descriptor.pipeline(),
            "created kernel"
        );
        Ok(Self {
            program,
            descriptor,
            plan,
            device,
            slot: Arc::new(Mutex::new(Slot::default())),
        })
    }

    pub(crate) fn slot(&self) -> &Arc<Mutex<Slot>> {
        &self.slot
    }

    /// The program this kernel runs.
    #[must_use]
    pub const fn program(&self) -> &Program {
        &self.program
    }

    /// The backend the kernel runs on.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.device.backend()
    }

    /// The checked output description.
    #[must_use]
    pub const fn descriptor(&self) -> &OutputDescriptor {
        &self.descriptor
    }

    /// How the output is stored on the backend.
    #[must_use]
    pub const fn plan(&self) -> &StoragePlan {
        &self.plan
    }

    /// The backend program generated by the last invocation.
    ///
    /// `None` before the first invocation and on the CPU, which runs the
    /// host body directly.
    #[must_use]
    pub fn source(&self) -> Option<String> {
        self.slot.lock().source.clone()
    }

    /// Diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> KernelStats {
        self.slot.lock().stats
    }

    /// Whether the kernel or its runtime has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.slot.lock().destroyed
    }

    /// Runs the program over every output coordinate.
    ///
    /// Invocations on one kernel are strictly ordered; the returned handle
    /// keeps the kernel borrowed until it is dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::KernelDestroyed`] after [`Kernel::destroy`] or
    ///   [`Runtime::destroy`](crate::Runtime::destroy)
    /// - [`Error::ArgumentMismatch`] if `args` do not match the program
    /// - any device or readback error; storage allocated by a failed call is
    ///   released before returning
    ///
    /// # Example
    ///
    /// ```
    /// use briny_kernel::{Arg, Array, KernelConfig, Mode, Param, Program, Runtime};
    ///
    /// let mut runtime = Runtime::new(Mode::Cpu)?;
    /// let double = Program::new("double", vec![Param::array(1)], |t, a| 2.0 * a[0].at1(t.x));
    /// let mut kernel = runtime.create_kernel(double, KernelConfig::new([3]))?;
    /// let input = Array::from(vec![1.0, 2.0, 3.0]);
    /// let out = kernel.invoke(&[Arg::Array(&input)])?.into_array()?;
    /// assert_eq!(out, Array::from(vec![2.0, 4.0, 6.0]));
    /// # Ok::<(), briny_kernel::Error>(())
    /// ```
    pub fn invoke(&mut self, args: &[Arg<'_>]) -> Result<Output<'_>> {
        let name = self.program.name();
        let (mut storage, fresh) = {
            let mut slot = self.slot.lock();
            if slot.destroyed {
                return Err(Error::KernelDestroyed(name.to_owned()));
            }
            self.check_args(args)?;
            match slot.storage.take() {
                Some(storage) => (storage, false),
                None => (self.device.allocate(name, &self.plan)?, true),
            }
        };

        let job = Job {
            program: &self.program,
            plan: &self.plan,
            args,
        };
        let generated = match self.device.dispatch(&job, &mut storage) {
            Ok(generated) => generated,
            Err(e) => {
                let mut slot = self.slot.lock();
                if fresh || slot.destroyed {
                    self.device.release(storage);
                } else {
                    slot.storage = Some(storage);
                }
                tracing::debug!(kernel = name, error = %e, "invocation failed");
                return Err(e);
            }
        };

        let mut slot = self.slot.lock();
        if slot.destroyed {
            self.device.release(storage);
            return Err(Error::KernelDestroyed(name.to_owned()));
        }
        slot.storage = Some(storage);
        if generated.is_some() {
            slot.source = generated;
        }
        slot.stats.invocations += 1;

        if self.descriptor.pipeline() {
            drop(slot);
            return Ok(Output::Deferred(Deferred { kernel: self }));
        }
        let values = self.read(&mut slot)?;
        Ok(Output::Materialized(values))
    }

    /// Releases the kernel's storage. Later calls fail with
    /// [`Error::KernelDestroyed`]; destroying twice is harmless.
    pub fn destroy(&mut self) {
        let mut slot = self.slot.lock();
        if !slot.destroyed {
            tracing::debug!(kernel = self.program.name(), "destroying kernel");
        }
        slot.destroy(self.device.as_ref());
    }

    /// Reads back and decodes the current storage.
    fn read(&self, slot: &mut Slot) -> Result<Array> {
        let name = self.program.name();
        if slot.destroyed {
            return Err(Error::KernelDestroyed(name.to_owned()));
        }
        let storage = slot.storage.as_ref().ok_or_else(|| {
            Error::ReadbackFailure(format!("kernel `{name}` has not been invoked"))
        })?;

        let readback = self.device.readback(&self.plan, storage)?;
        slot.stats.readbacks += 1;
        let extents = self.plan.extents();
        match (readback, self.plan.codec()) {
            (Readback::Floats(cells), None) => Array::from_flat(extents, cells),
            (Readback::Texels(texels), Some(codec)) => {
                slot.stats.decodes += 1;
                codec.decode(&texels, extents)
            }
            (Readback::Floats(_), Some(_)) => Err(Error::ReadbackFailure(
                "expected packed texels, got floats".to_owned(),
            )),
            (Readback::Texels(_), None) => Err(Error::ReadbackFailure(
                "got packed texels without a codec".to_owned(),
            )),
        }
    }

    fn check_args(&self, args: &[Arg<'_>]) -> Result<()> {
        let name = self.program.name();
        let params = self.program.params();
        if args.len() != params.len() {
            return Err(Error::mismatch(
                name,
                format!("expected {} arguments, got {}", params.len(), args.len()),
            ));
        }
        for (i, (arg, param)) in args.iter().zip(params).enumerate() {
            let extents = match (arg, param) {
                (Arg::Scalar(_), Param::Scalar) => continue,
                (Arg::Scalar(_), Param::Array { .. }) => {
                    return Err(Error::mismatch(name, format!("argument {i} must be an array")));
                }
                (_, Param::Scalar) => {
                    return Err(Error::mismatch(name, format!("argument {i} must be a scalar")));
                }
                (Arg::Array(a), Param::Array { .. }) => {
                    a.validate()
                        .map_err(|reason| Error::mismatch(name, format!("argument {i}: {reason}")))?;
                    a.extents()
                }
                (Arg::Deferred(d), Param::Array { .. }) => d.extents().to_vec(),
            };
            let Param::Array { rank, extents: fixed } = param else {
                continue;
            };
            if extents.len() != *rank {
                return Err(Error::mismatch(
                    name,
                    format!("argument {i} has rank {}, expected {rank}", extents.len()),
                ));
            }
            if let Some(fixed) = fixed {
                if *fixed != extents {
                    return Err(Error::mismatch(
                        name,
                        format!("argument {i} has extents {extents:?}, expected {fixed:?}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A result left in the producing kernel's storage.
///
/// Borrows the kernel, which therefore cannot be invoked again or destroyed
/// while the handle is alive. Destroying the runtime still invalidates it.
#[derive(Debug, Clone, Copy)]
pub struct Deferred<'k> {
    kernel: &'k Kernel,
}

impl<'k> Deferred<'k> {
    /// Reads the result back into host memory.
    ///
    /// Every call performs one readback and, for packed storage, exactly one
    /// decode, and returns the same values.
    ///
    /// # Errors
    ///
    /// [`Error::KernelDestroyed`] if the runtime was destroyed, or any
    /// readback error.
    pub fn materialize(&self) -> Result<Array> {
        let mut slot = self.kernel.slot.lock();
        self.kernel.read(&mut slot)
    }

    /// The kernel that produced this result.
    #[must_use]
    pub const fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    /// Output extents, x first.
    #[must_use]
    pub fn extents(&self) -> &'k [usize] {
        self.kernel.plan.extents()
    }

    /// The producing kernel's generated backend program.
    #[must_use]
    pub fn source(&self) -> Option<String> {
        self.kernel.source()
    }

    /// Runs `f` on the producer's live storage.
    pub(crate) fn with_storage<R>(&self, f: impl FnOnce(&Storage, &StoragePlan) -> R) -> Result<R> {
        let slot = self.kernel.slot.lock();
        match (&slot.storage, slot.destroyed) {
            (Some(storage), false) => Ok(f(storage, &self.kernel.plan)),
            _ => Err(Error::KernelDestroyed(self.kernel.program.name().to_owned())),
        }
    }
}

/// What an invocation returns.
#[derive(Debug)]
pub enum Output<'k> {
    /// Values already in host memory.
    Materialized(Array),
    /// Values still in the kernel's storage.
    Deferred(Deferred<'k>),
}

impl<'k> Output<'k> {
    /// The host values, reading back if needed.
    ///
    /// # Errors
    ///
    /// See [`Deferred::materialize`].
    pub fn materialize(&self) -> Result<Array> {
        match self {
            Self::Materialized(a) => Ok(a.clone()),
            Self::Deferred(d) => d.materialize(),
        }
    }

    /// Consumes the handle, reading back if needed.
    ///
    /// # Errors
    ///
    /// See [`Deferred::materialize`].
    pub fn into_array(self) -> Result<Array> {
        match self {
            Self::Materialized(a) => Ok(a),
            Self::Deferred(d) => d.materialize(),
        }
    }

    /// The deferred handle, if this output was not read back.
    #[must_use]
    pub const fn as_deferred(&self) -> Option<&Deferred<'k>> {
        match self {
            Self::Deferred(d) => Some(d),
            Self::Materialized(_) => None,
        }
    }

    /// Whether the values are already in host memory.
    #[must_use]
    pub const fn is_materialized(&self) -> bool {
        matches!(self, Self::Materialized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::cpu::{self, CpuDevice};
    use crate::output::{CellFormat, KernelConfig};

    /// A channel-limited backend emulated on the host: packed cells are
    /// encoded with the codec on dispatch, like the shader does on a device.
    #[derive(Debug, Default)]
    struct Emulated {
        fail_dispatch: bool,
        released: Mutex<usize>,
    }

    impl Device for Emulated {
        fn backend(&self) -> Backend {
            Backend::Gl
        }

        fn allocate(&self, _label: &str, plan: &StoragePlan) -> Result<Storage> {
            Ok(match plan.cells() {
                CellFormat::Packed => Storage::Cells(vec![0; plan.cell_count() * 4]),
                CellFormat::Float32 => Storage::Host(vec![0.0; plan.cell_count()]),
            })
        }

        fn dispatch(&self, job: &Job<'_>, storage: &mut Storage) -> Result<Option<String>> {
            if self.fail_dispatch {
                return Err(Error::Gpu("lost device".to_owned()));
            }
            let cells = cpu::evaluate(job.program, job.plan, job.args)?;
            match (storage, job.plan.codec()) {
                (Storage::Cells(bytes), Some(codec)) => {
                    let values = Array::from_flat(job.plan.extents(), cells)?;
                    *bytes = codec.encode(&values)?;
                }
                (Storage::Host(host), None) => *host = cells,
                _ => return Err(Error::Gpu("storage does not match plan".to_owned())),
            }
            Ok(Some(format!("// {}", job.program.name())))
        }

        fn readback(&self, _plan: &StoragePlan, storage: &Storage) -> Result<Readback> {
            match storage {
                Storage::Cells(bytes) => Ok(Readback::Texels(bytes.clone())),
                Storage::Host(cells) => Ok(Readback::Floats(cells.clone())),
                #[allow(unreachable_patterns)]
                other => Err(Error::ReadbackFailure(format!("{other:?}"))),
            }
        }

        fn release(&self, _storage: Storage) {
            *self.released.lock() += 1;
        }

        fn shutdown(&self) {}
    }

    fn coords() -> Program {
        Program::new("coords", vec![], |t, _| {
            (t.x + 10 * t.y + 100 * t.z) as f32 + 0.25
        })
        .with_wgsl("    return f32(thread.x + 10u * thread.y + 100u * thread.z) + 0.25;")
    }

    fn kernel(device: Arc<dyn Device>, program: Program, config: &KernelConfig) -> Kernel {
        Kernel::new(program, OutputDescriptor::build(config).unwrap(), device).unwrap()
    }

    fn packed(extents: &[usize]) -> KernelConfig {
        KernelConfig::new(extents)
            .float_output(true)
            .optimize_float_memory(true)
    }

    #[test]
    fn eager_rank1_decodes_exactly_once() {
        let mut k = kernel(Arc::new(Emulated::default()), coords(), &packed(&[5]));
        let out = k.invoke(&[]).unwrap();
        assert!(out.is_materialized());
        assert_eq!(
            out.into_array().unwrap(),
            Array::from(vec![0.25, 1.25, 2.25, 3.25, 4.25])
        );
        let stats = k.stats();
        assert_eq!((stats.invocations, stats.readbacks, stats.decodes), (1, 1, 1));

        k.invoke(&[]).unwrap();
        assert_eq!(k.stats().decodes, 2);
    }

    #[test]
    fn bypass_skips_the_codec() {
        let device: Arc<dyn Device> = Arc::new(Emulated::default());
        let mut with = kernel(Arc::clone(&device), coords(), &packed(&[5, 3]));
        let mut without = kernel(device, coords(), &packed(&[5, 3]).optimize_float_memory(false));
        let a = with.invoke(&[]).unwrap().into_array().unwrap();
        let b = without.invoke(&[]).unwrap().into_array().unwrap();
        assert_eq!(a, b);
        assert_eq!(with.stats().decodes, 1);
        assert_eq!(without.stats().decodes, 0);
    }

    #[test]
    fn rank3_tiling_is_inverted() {
        let mut k = kernel(Arc::new(Emulated::default()), coords(), &packed(&[5, 3, 2]));
        let out = k.invoke(&[]).unwrap().into_array().unwrap();
        assert_eq!(out.extents(), vec![5, 3, 2]);
        assert_eq!(out.get(4, 2, 1), Some(124.25));
        assert_eq!(out.as_3d().unwrap()[1][0][3], 103.25);
        let stats = k.stats();
        assert_eq!((stats.readbacks, stats.decodes), (1, 1));
    }

    #[test]
    fn deferred_matrix_materializes_rows() {
        let mut k = kernel(Arc::new(Emulated::default()), coords(), &packed(&[5, 3]).pipeline(true));
        let out = k.invoke(&[]).unwrap();
        let deferred = out.as_deferred().unwrap();
        assert_eq!(deferred.kernel().stats().decodes, 0);
        let rows = deferred.materialize().unwrap();
        assert_eq!(rows.extents(), vec![5, 3]);
        assert_eq!(rows.as_2d().unwrap()[2], vec![20.25, 21.25, 22.25, 23.25, 24.25]);
        let stats = deferred.kernel().stats();
        assert_eq!((stats.readbacks, stats.decodes), (1, 1));
    }

    #[test]
    fn deferred_reads_back_on_demand() {
        let mut k = kernel(Arc::new(Emulated::default()), coords(), &packed(&[5]).pipeline(true));
        let out = k.invoke(&[]).unwrap();
        let deferred = out.as_deferred().unwrap();
        assert_eq!(deferred.kernel().stats().readbacks, 0);
        let first = deferred.materialize().unwrap();
        let second = deferred.materialize().unwrap();
        assert_eq!(first, second);
        assert_eq!(deferred.kernel().stats().decodes, 2);
        assert_eq!(deferred.source().as_deref(), Some("// coords"));
        assert_eq!(deferred.extents(), &[5]);
    }

    #[test]
    fn deferred_feeds_another_kernel() {
        let device: Arc<dyn Device> = Arc::new(Emulated::default());
        let mut producer = kernel(Arc::clone(&device), coords(), &packed(&[5]).pipeline(true));
        let double = Program::new("double", vec![Param::array(1)], |t, a| 2.0 * a[0].at1(t.x))
            .with_wgsl("    return 2.0 * arg0(thread.x);");
        let mut consumer = kernel(device, double, &packed(&[5]));

        let handle = producer.invoke(&[]).unwrap();
        let deferred = handle.as_deferred().unwrap();
        let out = consumer.invoke(&[Arg::Deferred(deferred)]).unwrap();
        assert_eq!(
            out.into_array().unwrap(),
            Array::from(vec![0.5, 2.5, 4.5, 6.5, 8.5])
        );
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut k = kernel(Arc::new(CpuDevice), coords(), &KernelConfig::new([2]));
        k.invoke(&[]).unwrap();
        k.destroy();
        k.destroy();
        assert!(k.is_destroyed());
        assert!(matches!(k.invoke(&[]), Err(Error::KernelDestroyed(name)) if name == "coords"));
    }

    #[test]
    fn failed_first_invocation_releases_storage() {
        let device = Arc::new(Emulated {
            fail_dispatch: true,
            ..Emulated::default()
        });
        let mut k = kernel(device.clone(), coords(), &packed(&[4]));
        assert!(matches!(k.invoke(&[]), Err(Error::Gpu(_))));
        assert_eq!(*device.released.lock(), 1);
        assert!(k.slot.lock().storage.is_none());
        k.destroy();
    }

    #[test]
    fn arguments_are_checked() {
        let program = Program::new("sum", vec![Param::shaped([2]), Param::Scalar], |t, a| {
            a[0].at1(t.x) + a[1].value()
        });
        let mut k = kernel(Arc::new(CpuDevice), program, &KernelConfig::new([2]));
        let good = Array::from(vec![1.0, 2.0]);
        let long = Array::from(vec![1.0, 2.0, 3.0]);
        let flat = Array::from(vec![vec![1.0, 2.0]]);
        let ragged = Array::from(vec![vec![1.0, 2.0], vec![3.0]]);

        for args in [
            vec![Arg::Array(&good)],
            vec![Arg::Scalar(1.0), Arg::Scalar(1.0)],
            vec![Arg::Array(&good), Arg::Array(&good)],
            vec![Arg::Array(&long), Arg::Scalar(1.0)],
            vec![Arg::Array(&flat), Arg::Scalar(1.0)],
            vec![Arg::Array(&ragged), Arg::Scalar(1.0)],
        ] {
            assert!(matches!(k.invoke(&args), Err(Error::ArgumentMismatch { .. })));
        }
        let out = k.invoke(&[Arg::Array(&good), Arg::Scalar(0.5)]).unwrap();
        assert_eq!(out.into_array().unwrap(), Array::from(vec![1.5, 2.5]));
    }

    #[test]
    fn gpu_backends_need_wgsl() {
        let host_only = Program::new("host", vec![], |_, _| 0.0);
        let descriptor = OutputDescriptor::build(&KernelConfig::new([1])).unwrap();
        let err = Kernel::new(host_only, descriptor, Arc::new(Emulated::default())).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBackend { backend: Backend::Gl, .. }));
    }

    #[test]
    fn cpu_has_no_generated_source() {
        let mut k = kernel(Arc::new(CpuDevice), coords(), &KernelConfig::new([2]));
        k.invoke(&[]).unwrap();
        assert!(k.source().is_none());
        assert_eq!(k.backend(), Backend::Cpu);
    }
}
