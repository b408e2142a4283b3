use briny_kernel::*;

/// A runtime per usable backend; GPU backends that fail to open are skipped.
fn runtimes() -> Vec<Runtime> {
    available_backends()
        .into_iter()
        .filter_map(|backend| match Runtime::new(Mode::from(backend)) {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                eprintln!("skipping {backend}: {err}");
                None
            }
        })
        .collect()
}

fn packed(extents: &[usize]) -> KernelConfig {
    KernelConfig::new(extents)
        .float_output(true)
        .optimize_float_memory(true)
}

fn copy1() -> Program {
    Program::new("copy1", vec![Param::array(1)], |t, a| a[0].at1(t.x))
        .with_wgsl("return arg0(thread.x);")
}

fn copy2() -> Program {
    Program::new("copy2", vec![Param::array(2)], |t, a| a[0].at2(t.y, t.x))
        .with_wgsl("return arg0(thread.y, thread.x);")
}

fn copy3() -> Program {
    Program::new("copy3", vec![Param::array(3)], |t, a| a[0].at3(t.z, t.y, t.x))
        .with_wgsl("return arg0(thread.z, thread.y, thread.x);")
}

fn consecutive(extents: &[usize]) -> Array {
    let len = extents.iter().product::<usize>();
    Array::from_flat(extents, (1..=len).map(|v| v as f32).collect()).unwrap()
}

#[test]
fn test_copy_vector_on_every_backend() {
    let input = Array::from(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    for mut runtime in runtimes() {
        let mut kernel = runtime.create_kernel(copy1(), packed(&[5])).unwrap();
        let out = kernel.invoke(&[Arg::Array(&input)]).unwrap().into_array().unwrap();
        assert_eq!(out, input, "backend {}", runtime.backend());
        runtime.destroy();
    }
}

#[test]
fn test_copy_matrix_on_every_backend() {
    let input = consecutive(&[5, 3]);
    assert_eq!(input.as_2d().unwrap()[2], vec![11.0, 12.0, 13.0, 14.0, 15.0]);
    for mut runtime in runtimes() {
        let mut kernel = runtime.create_kernel(copy2(), packed(&[5, 3])).unwrap();
        let out = kernel.invoke(&[Arg::Array(&input)]).unwrap().into_array().unwrap();
        let rows = out.as_2d().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.len() == 5));
        assert_eq!(out, input, "backend {}", runtime.backend());
        runtime.destroy();
    }
}

#[test]
fn test_copy_cube_on_every_backend() {
    let input = consecutive(&[5, 3, 2]);
    for mut runtime in runtimes() {
        let mut kernel = runtime.create_kernel(copy3(), packed(&[5, 3, 2])).unwrap();
        let out = kernel.invoke(&[Arg::Array(&input)]).unwrap().into_array().unwrap();
        let slices = out.as_3d().unwrap();
        assert_eq!(slices.len(), 2);
        assert!(slices.iter().all(|s| s.len() == 3 && s.iter().all(|r| r.len() == 5)));
        assert_eq!(slices[1][2][4], 30.0);
        assert_eq!(out, input, "backend {}", runtime.backend());
        runtime.destroy();
    }
}

#[test]
fn test_bypass_equivalence() {
    let input = consecutive(&[5, 3, 2]);
    let scale = Program::new("scale", vec![Param::array(3), Param::Scalar], |t, a| {
        a[0].at3(t.z, t.y, t.x) / a[1].value()
    })
    .with_wgsl("return arg0(thread.z, thread.y, thread.x) / arg1();");
    for mut runtime in runtimes() {
        let mut on = runtime.create_kernel(scale.clone(), packed(&[5, 3, 2])).unwrap();
        let mut off = runtime
            .create_kernel(scale.clone(), packed(&[5, 3, 2]).optimize_float_memory(false))
            .unwrap();
        let args = [Arg::Array(&input), Arg::Scalar(7.0)];
        let a = on.invoke(&args).unwrap().into_array().unwrap();
        let b = off.invoke(&args).unwrap().into_array().unwrap();
        assert_eq!(a, b, "backend {}", runtime.backend());
        runtime.destroy();
    }
}

#[test]
fn test_codec_only_on_channel_limited_backends() {
    for mut runtime in runtimes() {
        let mut kernel = runtime.create_kernel(copy1(), packed(&[5])).unwrap();
        let input = Array::from([1.0, 2.0, 3.0, 4.0, 5.0]);
        kernel.invoke(&[Arg::Array(&input)]).unwrap();
        let expected = u64::from(!runtime.backend().native_float_storage());
        assert_eq!(kernel.stats().decodes, expected, "backend {}", runtime.backend());
        assert_eq!(kernel.stats().readbacks, 1);
        runtime.destroy();
    }
}

#[test]
fn test_cpu_parity() {
    let input = consecutive(&[4, 4]);
    let square = Program::new("square", vec![Param::array(2)], |t, a| {
        let v = a[0].at2(t.y, t.x);
        v * v - 0.5
    })
    .with_wgsl("let v = arg0(thread.y, thread.x);\nreturn v * v - 0.5;");

    let mut cpu = Runtime::new(Mode::Cpu).unwrap();
    let mut expected = Vec::new();
    for (float_output, optimize) in [(false, false), (true, false), (false, true), (true, true)] {
        let config = KernelConfig::new([4, 4])
            .float_output(float_output)
            .optimize_float_memory(optimize);
        let mut kernel = cpu.create_kernel(square.clone(), config).unwrap();
        expected.push(kernel.invoke(&[Arg::Array(&input)]).unwrap().into_array().unwrap());
    }
    assert!(expected.windows(2).all(|w| w[0] == w[1]));

    for mut runtime in runtimes() {
        let mut kernel = runtime.create_kernel(square.clone(), packed(&[4, 4])).unwrap();
        let out = kernel.invoke(&[Arg::Array(&input)]).unwrap().into_array().unwrap();
        assert_eq!(out, expected[0], "backend {}", runtime.backend());
        runtime.destroy();
    }
}

#[test]
fn test_invalid_output_shapes() {
    let mut runtime = Runtime::new(Mode::Cpu).unwrap();
    for bad in [vec![], vec![1, 1, 1, 1], vec![3, 0]] {
        let err = runtime.create_kernel(copy1(), KernelConfig::new(bad)).unwrap_err();
        assert!(matches!(err, Error::InvalidOutputShape { .. }));
    }
}

#[test]
fn test_huge_outputs_are_errors() {
    let mut runtime = Runtime::new(Mode::Cpu).unwrap();
    let overflow = runtime.create_kernel(copy1(), KernelConfig::new([1, usize::MAX / 2, 4]));
    assert!(matches!(overflow, Err(Error::InvalidOutputShape { .. })));
    let too_big = runtime.create_kernel(copy1(), KernelConfig::new([1 << 31, 1 << 31]));
    assert!(matches!(too_big, Err(Error::InvalidOutputShape { .. })));

    let zero = Program::new("zero", vec![], |_, _| 0.0);
    let mut kernel = runtime
        .create_kernel(zero, KernelConfig::new([1 << 30, 1 << 30]))
        .unwrap();
    assert!(matches!(kernel.invoke(&[]), Err(Error::InvalidOutputShape { .. })));
}

#[test]
fn test_argument_mismatch() {
    let mut runtime = Runtime::new(Mode::Cpu).unwrap();
    let mut kernel = runtime.create_kernel(copy2(), KernelConfig::new([2, 2])).unwrap();
    let vector = Array::from(vec![1.0, 2.0]);
    assert!(matches!(
        kernel.invoke(&[Arg::Array(&vector)]),
        Err(Error::ArgumentMismatch { .. })
    ));
    assert!(matches!(kernel.invoke(&[]), Err(Error::ArgumentMismatch { .. })));
    assert!(matches!(
        kernel.invoke(&[Arg::Scalar(1.0)]),
        Err(Error::ArgumentMismatch { .. })
    ));
}

#[test]
fn test_host_only_program_on_gpu() {
    let host_only = Program::new("host", vec![], |_, _| 1.0);
    for mut runtime in runtimes() {
        let result = runtime.create_kernel(host_only.clone(), KernelConfig::new([1]));
        if runtime.backend().is_gpu() {
            assert!(matches!(result, Err(Error::UnsupportedBackend { .. })));
        } else {
            assert!(result.is_ok());
        }
        runtime.destroy();
    }
}
