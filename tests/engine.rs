//! End-to-end scenarios through the engine: fusion, caches, contraction,
//! reductions, scans, index ops, generators and extension dispatch.
//!
//! Everything that runs a compiled kernel probes for a C compiler first and
//! returns early when none is available.

use smelt::{
    BaseId, BhIr, Constant, DType, Engine, EngineOptions, Instruction, Opcode, SmeltError, View,
};

fn have_cc() -> bool {
    std::process::Command::new("cc")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn add(out: View, a: View, b: View) -> Instruction {
    Instruction::new(Opcode::Add, vec![out, a, b])
}

fn v44(base: BaseId) -> View {
    View::contiguous(base, DType::F32, &[4, 4])
}

#[test]
fn fusion_smoke_and_cache_hits() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("fusion-smoke"))?;
    let a = eng.create_base(DType::F32, 16);
    let b = eng.create_base(DType::F32, 16);
    let t = eng.create_base(DType::F32, 16);
    let c = eng.create_base(DType::F32, 16);
    let av: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let bv: Vec<f32> = (0..16).map(|i| (i * 3) as f32).collect();
    eng.write_base(a, &av)?;
    eng.write_base(b, &bv)?;

    let batch = || {
        BhIr::new(vec![
            add(v44(t), v44(a), v44(b)),
            Instruction::new(
                Opcode::Multiply,
                vec![v44(c), v44(t), View::scalar(Constant::F32(2.0))],
            ),
        ])
    };

    let mut bhir = batch();
    eng.execute(&mut bhir)?;
    assert_eq!(bhir.kernels.len(), 1, "both elementwise ops in one kernel");
    assert_eq!(eng.compile_count(), 1, "one compiled object");
    let cv: Vec<f32> = eng.read_base(c)?;
    for i in 0..16 {
        assert_eq!(cv[i], (av[i] + bv[i]) * 2.0);
    }

    // Resubmission must hit both the fusion cache and the object cache.
    let mut again = batch();
    eng.execute(&mut again)?;
    assert_eq!(eng.fuse_cache_hits(), 1);
    assert_eq!(eng.compile_count(), 1, "zero new compiles");
    let cv: Vec<f32> = eng.read_base(c)?;
    assert_eq!(cv[5], (av[5] + bv[5]) * 2.0);
    Ok(())
}

#[test]
fn reduction_moves_inward_and_stays_correct() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("reduce"))?;
    let a = eng.create_base(DType::F32, 64);
    let b = eng.create_base(DType::F32, 64);
    let t = eng.create_base(DType::F32, 64);
    let s = eng.create_base(DType::F32, 8);
    let av: Vec<f32> = (0..64).map(|i| i as f32).collect();
    let bv: Vec<f32> = vec![1.0; 64];
    eng.write_base(a, &av)?;
    eng.write_base(b, &bv)?;
    let m = |base| View::contiguous(base, DType::F32, &[8, 8]);
    let mut bhir = BhIr::new(vec![
        add(m(t), m(a), m(b)),
        Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(s, DType::F32, &[8]),
                m(t),
                View::scalar(Constant::I64(0)),
            ],
        ),
        Instruction::new(Opcode::Free, vec![View::whole(t, DType::F32, 64)]),
    ]);
    eng.execute(&mut bhir)?;
    let sv: Vec<f32> = eng.read_base(s)?;
    for j in 0..8usize {
        let expect: f32 = (0..8).map(|i| av[i * 8 + j] + 1.0).sum();
        assert_eq!(sv[j], expect, "column {j}");
    }
    Ok(())
}

#[test]
fn contraction_skips_the_temp_allocation() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("contraction"))?;
    let a = eng.create_base(DType::F32, 16);
    let b = eng.create_base(DType::F32, 16);
    let t = eng.create_base(DType::F32, 16);
    let c = eng.create_base(DType::F32, 16);
    let av: Vec<f32> = (0..16).map(|i| (i + 1) as f32).collect();
    eng.write_base(a, &av)?;
    eng.write_base(b, &av)?;
    let mut bhir = BhIr::new(vec![
        add(v44(t), v44(a), v44(b)),
        Instruction::new(
            Opcode::Multiply,
            vec![v44(c), v44(t), View::scalar(Constant::F32(2.0))],
        ),
        Instruction::new(Opcode::Free, vec![View::whole(t, DType::F32, 16)]),
    ]);
    eng.execute(&mut bhir)?;
    // a, b (bridge writes) and c (output): the temp was never malloc'd,
    // and freeing it returned nothing to the victim cache.
    assert_eq!(eng.vcache_stats(), (3, 0));
    assert!(!eng.base_exists(t));
    let cv: Vec<f32> = eng.read_base(c)?;
    for i in 0..16 {
        assert_eq!(cv[i], av[i] * 4.0);
    }
    Ok(())
}

#[test]
fn freed_storage_is_reused_by_the_victim_cache() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("vcache"))?;
    let one = View::scalar(Constant::F32(1.0));
    let run = |eng: &mut Engine| -> Result<(), SmeltError> {
        let x = eng.create_base(DType::F32, 1024);
        let mut bhir = BhIr::new(vec![
            Instruction::new(
                Opcode::Add,
                vec![
                    View::contiguous(x, DType::F32, &[1024]),
                    View::contiguous(x, DType::F32, &[1024]),
                    one.clone(),
                ],
            ),
            Instruction::new(Opcode::Free, vec![View::whole(x, DType::F32, 1024)]),
        ]);
        eng.execute(&mut bhir)
    };
    run(&mut eng)?;
    run(&mut eng)?;
    let (allocs, frees) = eng.vcache_stats();
    assert_eq!(allocs, 2);
    assert_eq!(frees, 2);
    Ok(())
}

#[test]
fn sij_handles_strided_views() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("strided"))?;
    let x = eng.create_base(DType::F32, 10);
    let y = eng.create_base(DType::F32, 5);
    let xv: Vec<f32> = (0..10).map(|i| i as f32).collect();
    eng.write_base(x, &xv)?;
    // y = x[0::2] + x[1::2]
    let even = View::strided(x, DType::F32, 0, &[5], &[2]);
    let odd = View::strided(x, DType::F32, 1, &[5], &[2]);
    let mut bhir = BhIr::new(vec![add(View::contiguous(y, DType::F32, &[5]), even, odd)]);
    eng.execute(&mut bhir)?;
    let yv: Vec<f32> = eng.read_base(y)?;
    for i in 0..5 {
        assert_eq!(yv[i], xv[2 * i] + xv[2 * i + 1]);
    }
    Ok(())
}

#[test]
fn scan_produces_inclusive_prefix() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("scan"))?;
    let x = eng.create_base(DType::I64, 6);
    let y = eng.create_base(DType::I64, 6);
    eng.write_base(x, &[1i64, 2, 3, 4, 5, 6])?;
    let mut bhir = BhIr::new(vec![Instruction::new(
        Opcode::AddAccumulate,
        vec![
            View::contiguous(y, DType::I64, &[6]),
            View::contiguous(x, DType::I64, &[6]),
            View::scalar(Constant::I64(0)),
        ],
    )]);
    eng.execute(&mut bhir)?;
    assert_eq!(eng.read_base::<i64>(y)?, [1, 3, 6, 10, 15, 21]);
    Ok(())
}

#[test]
fn gather_and_scatter_roundtrip() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("gather"))?;
    let data = eng.create_base(DType::F64, 8);
    let idx = eng.create_base(DType::I64, 4);
    let out = eng.create_base(DType::F64, 4);
    let scattered = eng.create_base(DType::F64, 8);
    eng.write_base(data, &[10.0f64, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0, 17.0])?;
    eng.write_base(idx, &[7i64, 0, 3, 5])?;
    let mut bhir = BhIr::new(vec![
        Instruction::new(
            Opcode::Gather,
            vec![
                View::contiguous(out, DType::F64, &[4]),
                View::whole(data, DType::F64, 8),
                View::contiguous(idx, DType::I64, &[4]),
            ],
        ),
        Instruction::new(
            Opcode::Scatter,
            vec![
                View::whole(scattered, DType::F64, 8),
                View::contiguous(out, DType::F64, &[4]),
                View::contiguous(idx, DType::I64, &[4]),
            ],
        ),
    ]);
    eng.execute(&mut bhir)?;
    assert_eq!(eng.read_base::<f64>(out)?, [17.0, 10.0, 13.0, 15.0]);
    let sv: Vec<f64> = eng.read_base(scattered)?;
    assert_eq!(sv[7], 17.0);
    assert_eq!(sv[0], 10.0);
    assert_eq!(sv[3], 13.0);
    assert_eq!(sv[5], 15.0);
    assert_eq!(sv[1], 0.0);
    Ok(())
}

#[test]
fn generators_are_deterministic() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("generate"))?;
    let r1 = eng.create_base(DType::U64, 16);
    let r2 = eng.create_base(DType::U64, 16);
    let range = eng.create_base(DType::I32, 16);
    let seed = View::scalar(Constant::R123 { start: 99, key: 7 });
    let mut bhir = BhIr::new(vec![
        Instruction::new(
            Opcode::Random,
            vec![View::contiguous(r1, DType::U64, &[16]), seed.clone()],
        ),
        Instruction::new(Opcode::Random, vec![View::contiguous(r2, DType::U64, &[16]), seed]),
        Instruction::new(Opcode::Range, vec![View::contiguous(range, DType::I32, &[16])]),
    ]);
    eng.execute(&mut bhir)?;
    let a: Vec<u64> = eng.read_base(r1)?;
    let b: Vec<u64> = eng.read_base(r2)?;
    assert_eq!(a, b, "same counter and key give the same stream");
    assert!(a.windows(2).any(|w| w[0] != w[1]), "stream is not constant");
    let rv: Vec<i32> = eng.read_base(range)?;
    assert_eq!(rv, (0..16).collect::<Vec<i32>>());
    Ok(())
}

#[test]
fn neutral_elements_hold() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("neutral"))?;
    let cases: [(Opcode, f32, f32); 4] = [
        (Opcode::AddReduce, 0.0, 5.5),
        (Opcode::MultiplyReduce, 1.0, 5.5),
        (Opcode::MinimumReduce, f32::MAX, 5.5),
        (Opcode::MaximumReduce, -f32::MAX, -5.5),
    ];
    for (opcode, neutral, x) in cases {
        // reduce(op, [neutral]) == neutral
        let a = eng.create_base(DType::F32, 1);
        let r = eng.create_base(DType::F32, 1);
        eng.write_base(a, &[neutral])?;
        let mut bhir = BhIr::new(vec![Instruction::new(
            opcode,
            vec![
                View::contiguous(r, DType::F32, &[1]),
                View::contiguous(a, DType::F32, &[1]),
                View::scalar(Constant::I64(0)),
            ],
        )]);
        eng.execute(&mut bhir)?;
        assert_eq!(eng.read_base::<f32>(r)?, [neutral], "{opcode:?}");
        // reduce(op, [x, neutral]) == x
        let a = eng.create_base(DType::F32, 2);
        let r = eng.create_base(DType::F32, 1);
        eng.write_base(a, &[x, neutral])?;
        let mut bhir = BhIr::new(vec![Instruction::new(
            opcode,
            vec![
                View::contiguous(r, DType::F32, &[1]),
                View::contiguous(a, DType::F32, &[2]),
                View::scalar(Constant::I64(0)),
            ],
        )]);
        eng.execute(&mut bhir)?;
        assert_eq!(eng.read_base::<f32>(r)?, [x], "{opcode:?}");
    }
    Ok(())
}

fn tag_writer(eng: &mut Engine, instr: &Instruction) -> Result<(), SmeltError> {
    let base = instr.operands[0].base.unwrap();
    eng.write_base(base, &[0xC0FFEEu64; 4])
}

#[test]
fn extension_dispatch_bypasses_codegen() -> Result<(), SmeltError> {
    // No compiler involved: extensions dispatch through the registered
    // function pointer.
    let mut eng = Engine::new(EngineOptions::sandboxed("ext"))?;
    eng.provide_extension("tag_writer", tag_writer);
    eng.register_extension("tag_writer", 0x8001)?;
    let out = eng.create_base(DType::U64, 4);
    let mut bhir = BhIr::new(vec![Instruction::new(
        Opcode::Ext(0x8001),
        vec![View::contiguous(out, DType::U64, &[4])],
    )]);
    eng.execute(&mut bhir)?;
    assert_eq!(eng.compile_count(), 0);
    assert_eq!(eng.read_base::<u64>(out)?, [0xC0FFEE; 4]);

    // Unregistered extension opcodes are rejected.
    let mut bad = BhIr::new(vec![Instruction::new(
        Opcode::Ext(0x9999),
        vec![View::contiguous(out, DType::U64, &[4])],
    )]);
    assert!(matches!(eng.execute(&mut bad), Err(SmeltError::ExtmethodNotSupported(_))));
    // Registering an unknown implementation name is an error too.
    assert!(matches!(
        eng.register_extension("missing", 0x8002),
        Err(SmeltError::ExtmethodNotSupported(_))
    ));
    Ok(())
}

#[test]
fn failing_batch_keeps_earlier_effects() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut eng = Engine::new(EngineOptions::sandboxed("abort"))?;
    let x = eng.create_base(DType::F32, 4);
    eng.write_base(x, &[1.0f32, 2.0, 3.0, 4.0])?;
    let one = View::scalar(Constant::F32(1.0));
    let mut bhir = BhIr::new(vec![
        Instruction::new(
            Opcode::Add,
            vec![
                View::contiguous(x, DType::F32, &[4]),
                View::contiguous(x, DType::F32, &[4]),
                one,
            ],
        ),
        // Lands in its own kernel and fails: nothing is registered.
        Instruction::new(Opcode::Ext(0x7777), vec![View::contiguous(x, DType::F32, &[4])]),
    ]);
    let err = eng.execute(&mut bhir).unwrap_err();
    assert!(matches!(err, SmeltError::ExtmethodNotSupported(_)));
    // The first kernel's writes are still visible.
    assert_eq!(eng.read_base::<f32>(x)?, [2.0, 3.0, 4.0, 5.0]);
    Ok(())
}

#[test]
fn singleton_model_disables_fusion() -> Result<(), SmeltError> {
    if !have_cc() {
        return Ok(());
    }
    let mut opts = EngineOptions::sandboxed("singleton");
    opts.fuse_model = "singleton".to_string();
    let mut eng = Engine::new(opts)?;
    let a = eng.create_base(DType::F32, 16);
    let t = eng.create_base(DType::F32, 16);
    let c = eng.create_base(DType::F32, 16);
    eng.write_base(a, &vec![1.0f32; 16])?;
    let mut bhir = BhIr::new(vec![
        add(v44(t), v44(a), v44(a)),
        Instruction::new(
            Opcode::Multiply,
            vec![v44(c), v44(t), View::scalar(Constant::F32(3.0))],
        ),
    ]);
    eng.execute(&mut bhir)?;
    assert_eq!(bhir.kernels.len(), 2);
    assert_eq!(eng.read_base::<f32>(c)?, vec![6.0f32; 16]);
    Ok(())
}
