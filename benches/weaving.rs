//! Benchmarks for weaving passes.
//!
//! - A pass where no registered advice matches (the scan-only path)
//! - A pass splicing instruction-level advices into every method
//! - A pass restructuring every method for boundary advices

extern crate dotweave;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use dotweave::prelude::*;
use std::{hint::black_box, sync::Arc};

const METHODS: usize = 200;

/// Emits `ldc.i4 marker; pop`.
struct Marker(i32);

impl Advice for Marker {
    fn priority(&self) -> i32 {
        self.0
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()> {
        let mut writer = ctx.writer(block)?;
        writer.emit_i4(self.0)?;
        writer.emit(OpCode::Pop)
    }
}

/// A module of `METHODS` static methods, each calling `Helper` and `Other`
/// in a short loop.
fn build_module() -> (Module, Token, Token) {
    let mut model = MetadataModel::new();
    let object = model.add_type("System", "Object", None, TypeFlags::empty());
    model.add_type("System", "Exception", Some(object), TypeFlags::empty());
    let ty = model.add_type("Bench", "Worker", Some(object), TypeFlags::empty());
    let void = || MethodSignature::new_static(vec![], TypeSig::Void);
    let helper = model
        .add_method(ty, "Helper", void(), MethodFlags::STATIC)
        .unwrap();
    let other = model
        .add_method(ty, "Other", void(), MethodFlags::STATIC)
        .unwrap();

    let mut methods = Vec::with_capacity(METHODS);
    for i in 0..METHODS {
        methods.push(
            model
                .add_method(ty, &format!("Work{i}"), void(), MethodFlags::STATIC)
                .unwrap(),
        );
    }

    let mut module = Module::new(model);
    for method in methods {
        let mut body = MethodBody::new();
        let counter = body.define_local(TypeSig::I4).unwrap();
        let root = body.root();
        let check = body.new_sequence();
        let head = body.add_sequence(root).unwrap();
        {
            let mut w = body.attach_writer(head).unwrap();
            w.emit_i4(0).unwrap();
            w.emit_local(OpCode::Stloc, counter).unwrap();
            w.emit_branch(OpCode::Br, check).unwrap();
        }
        let looped = body.add_sequence(root).unwrap();
        {
            let mut w = body.attach_writer(looped).unwrap();
            w.emit_method(OpCode::Call, helper).unwrap();
            w.emit_method(OpCode::Call, other).unwrap();
            w.emit_local(OpCode::Ldloc, counter).unwrap();
            w.emit_i4(1).unwrap();
            w.emit(OpCode::Add).unwrap();
            w.emit_local(OpCode::Stloc, counter).unwrap();
        }
        body.append_sequence(root, check).unwrap();
        {
            let mut w = body.attach_writer(check).unwrap();
            w.emit_local(OpCode::Ldloc, counter).unwrap();
            w.emit_i4(10).unwrap();
            w.emit_branch(OpCode::Blt, looped).unwrap();
            w.emit(OpCode::Ret).unwrap();
        }
        module.set_body(method, body).unwrap();
    }
    (module, helper, other)
}

fn run(c: &mut Criterion, name: &str, weaver: &Weaver, module: &Module) {
    c.bench_function(name, |b| {
        b.iter_batched(
            || module.clone(),
            |mut module| {
                let outcome = weaver.weave(black_box(&mut module)).unwrap();
                black_box(outcome)
            },
            BatchSize::LargeInput,
        );
    });
}

/// Benchmark a pass whose advices match no join point.
fn bench_weave_no_match(c: &mut Criterion) {
    let (module, _, _) = build_module();
    let mut weaver = Weaver::new(WeaverConfig::default());
    weaver
        .register_advice(
            Arc::new(Marker(1)),
            MethodTargets::All,
            JoinPointKinds::BEFORE_GET_FIELD | JoinPointKinds::BEFORE_THROW,
            OperandTargets::All,
        )
        .unwrap();
    run(c, "weave_no_match", &weaver, &module);
}

/// Benchmark splicing before/after advices around one call per method.
fn bench_weave_calls(c: &mut Criterion) {
    let (module, helper, _) = build_module();
    let mut weaver = Weaver::new(WeaverConfig::default());
    for priority in 0..4 {
        weaver
            .register_advice(
                Arc::new(Marker(priority)),
                MethodTargets::All,
                JoinPointKinds::BEFORE_CALL | JoinPointKinds::AFTER_CALL,
                OperandTargets::Tokens(vec![helper]),
            )
            .unwrap();
    }
    run(c, "weave_calls", &weaver, &module);
}

/// Benchmark the same splice pass without the rayon pool.
fn bench_weave_calls_sequential(c: &mut Criterion) {
    let (module, helper, other) = build_module();
    let mut weaver = Weaver::new(WeaverConfig::default().with_parallel(false));
    weaver
        .register_advice(
            Arc::new(Marker(0)),
            MethodTargets::All,
            JoinPointKinds::INSTEAD_OF_CALL,
            OperandTargets::Tokens(vec![helper, other]),
        )
        .unwrap();
    run(c, "weave_calls_sequential", &weaver, &module);
}

/// Benchmark restructuring every method for boundary advices.
fn bench_weave_boundary(c: &mut Criterion) {
    let (module, _, _) = build_module();
    let mut weaver = Weaver::new(WeaverConfig::default());
    for priority in [10, 5] {
        weaver
            .register_advice(
                Arc::new(Marker(priority)),
                MethodTargets::All,
                JoinPointKinds::METHOD_BOUNDARY,
                OperandTargets::All,
            )
            .unwrap();
    }
    run(c, "weave_boundary", &weaver, &module);
}

criterion_group!(
    benches,
    bench_weave_no_match,
    bench_weave_calls,
    bench_weave_calls_sequential,
    bench_weave_boundary
);
criterion_main!(benches);
