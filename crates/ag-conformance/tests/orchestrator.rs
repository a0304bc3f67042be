#![forbid(unsafe_code)]

//! Compile-once behavior of the orchestrator: concurrency, failure retry,
//! cache keying and cache sharing.

use ag_api::{AotConfig, ApiError, CompiledVariant, FnJoint, TraceError, aot_function};
use ag_backend_cpu::InterpreterCompiler;
use ag_cache::{CacheLookup, CompileCache, HasherKind};
use ag_core::fixtures::JointSpec;
use ag_core::{AbstractValue, Arg, DType, Graph, InputRole, JointGraph, Op, Value};
use ag_ledger::CompileOutcome;
use ag_partition::PartitionerKind;
use ag_runtime::{BackendCompiler, BackendError, Executable};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Delegates to the interpreter and counts compiles. Optionally fails the
/// first one.
#[derive(Default)]
struct CountingCompiler {
    compiles: AtomicUsize,
    fail_next: AtomicBool,
}

impl CountingCompiler {
    fn failing_once() -> Self {
        Self {
            compiles: AtomicUsize::new(0),
            fail_next: AtomicBool::new(true),
        }
    }

    fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl BackendCompiler for CountingCompiler {
    fn name(&self) -> &str {
        "counting"
    }

    fn compile(
        &self,
        graph: &Graph,
        example_inputs: &[Value],
    ) -> Result<Arc<dyn Executable>, BackendError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::CompileFailed {
                backend: self.name().to_owned(),
                detail: "injected failure".to_owned(),
            });
        }
        InterpreterCompiler.compile(graph, example_inputs)
    }
}

fn vector(values: &[f64]) -> Value {
    Value::tensor_f64(&[values.len() as u32], values.to_vec()).expect("vector")
}

/// `y = sin(x).sum()` with the gradient expanded to `sym_size(x)`. The
/// primal carries no declared shape so any vector length traces.
fn sin_sum(_: &[Value]) -> Result<JointGraph, TraceError> {
    let mut graph = Graph::new();
    let x = graph.add_placeholder("primals_1", InputRole::Primal, None)?;
    let t = graph.add_placeholder(
        "tangents_1",
        InputRole::Tangent,
        Some(AbstractValue::new(DType::F64, &[])),
    )?;
    let sin = graph.add_operation(Op::Sin, [Arg::Node(x)])?;
    let sum = graph.add_operation(Op::Sum, [Arg::Node(sin)])?;
    let size = graph.add_operation(Op::SymSize, [Arg::Node(x)])?;
    let expand = graph.add_operation(Op::Expand, [Arg::Node(t), Arg::Node(size)])?;
    let cos = graph.add_operation(Op::Cos, [Arg::Node(x)])?;
    let grad = graph.add_operation(Op::Mul, [Arg::Node(expand), Arg::Node(cos)])?;
    graph.set_output(vec![sum, grad])?;
    Ok(JointGraph::new(graph, 1)?)
}

#[test]
fn concurrent_first_calls_compile_once() {
    ag_test_utils::init_test_tracing();
    let compiler = Arc::new(CountingCompiler::default());
    let compiled = Arc::new(aot_function(
        Arc::new(JointSpec::MatMulRelu),
        compiler.clone(),
        compiler.clone(),
        AotConfig::default().with_partitioner(PartitionerKind::MinCut),
    ));
    let primals = JointSpec::MatMulRelu.example_primals().expect("primals");

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let compiled = Arc::clone(&compiled);
            let barrier = Arc::clone(&barrier);
            let primals = primals.clone();
            thread::spawn(move || {
                barrier.wait();
                compiled.call(&primals).expect("forward").lookup
            })
        })
        .collect();
    let lookups: Vec<CacheLookup> = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread"))
        .collect();

    // One forward and one backward compile in total.
    assert_eq!(compiler.compiles(), 2);
    assert_eq!(compiled.num_compiled_variants(), 1);
    assert_eq!(
        lookups.iter().filter(|&&lookup| lookup == CacheLookup::Compiled).count(),
        1
    );
    assert_eq!(compiled.ledger().len(), 1);
}

#[test]
fn failed_compile_is_retried_on_the_next_call() {
    let compiler = Arc::new(CountingCompiler::failing_once());
    let compiled = aot_function(
        Arc::new(JointSpec::Chain),
        compiler.clone(),
        compiler.clone(),
        AotConfig::default(),
    );
    let primals = JointSpec::Chain.example_primals().expect("primals");

    let err = compiled.call(&primals).expect_err("injected failure");
    assert!(matches!(
        err,
        ApiError::Backend(BackendError::CompileFailed { .. })
    ));
    assert_eq!(compiled.num_compiled_variants(), 0);

    let forward = compiled.call(&primals).expect("retry");
    assert_eq!(forward.lookup, CacheLookup::Compiled);
    assert_eq!(compiled.num_compiled_variants(), 1);

    let ledger = compiled.ledger();
    assert_eq!(ledger.count(CompileOutcome::Failed), 1);
    assert_eq!(ledger.count(CompileOutcome::Compiled), 1);
    assert_eq!(
        ledger.records()[0].key_digest,
        ledger.records()[1].key_digest
    );
}

#[test]
fn static_hasher_compiles_per_shape() {
    let compiled = aot_function(
        Arc::new(FnJoint::new("sin_sum", sin_sum)),
        Arc::new(InterpreterCompiler),
        Arc::new(InterpreterCompiler),
        AotConfig::default().with_hasher(HasherKind::StaticShape),
    );
    let short = vector(&[0.1, 0.2, 0.3]);
    let long = vector(&[0.1, 0.2, 0.3, 0.4]);
    compiled.call(&[short.clone()]).expect("short");
    let forward = compiled.call(&[long.clone()]).expect("long");
    assert_eq!(compiled.num_compiled_variants(), 2);

    let grads = forward
        .pending
        .backward(&[Value::tensor_f64(&[], vec![1.0]).expect("tangent")])
        .expect("backward");
    let grad = grads[0].as_tensor().expect("tensor");
    assert_eq!(grad.shape.dims, vec![4]);
    for (g, x) in grad.data.iter().zip([0.1_f64, 0.2, 0.3, 0.4]) {
        assert!((g - x.cos()).abs() < 1e-12);
    }
    assert_eq!(
        compiled.call(&[short]).expect("short again").lookup,
        CacheLookup::Hit
    );
}

#[test]
fn dynamic_hasher_shares_a_variant_across_lengths() {
    let compiled = aot_function(
        Arc::new(FnJoint::new("sin_sum", sin_sum)),
        Arc::new(InterpreterCompiler),
        Arc::new(InterpreterCompiler),
        AotConfig::default().with_hasher(HasherKind::DynamicShape),
    );
    let short = vector(&[0.1, 0.2, 0.3]);
    let long = vector(&[0.1, 0.2, 0.3, 0.4]);
    assert_eq!(compiled.cache_key(&[short.clone()]), compiled.cache_key(&[long.clone()]));

    assert_eq!(compiled.call(&[short]).expect("short").lookup, CacheLookup::Compiled);
    let forward = compiled.call(&[long]).expect("long");
    assert_eq!(forward.lookup, CacheLookup::Hit);
    assert_eq!(compiled.num_compiled_variants(), 1);

    let expected: f64 = [0.1_f64, 0.2, 0.3, 0.4].iter().map(|x| x.sin()).sum();
    let actual = forward.outputs[0].as_f64_scalar().expect("scalar");
    assert!((actual - expected).abs() < 1e-12);

    // The shared variant was traced at length 3 and still runs backward at 4.
    let grads = forward
        .pending
        .backward(&[Value::tensor_f64(&[], vec![1.0]).expect("tangent")])
        .expect("backward");
    let grad = grads[0].as_tensor().expect("tensor");
    assert_eq!(grad.shape.dims, vec![4]);
    for (g, x) in grad.data.iter().zip([0.1_f64, 0.2, 0.3, 0.4]) {
        assert!((g - x.cos()).abs() < 1e-12);
    }
}

#[test]
fn functions_sharing_a_cache_keep_separate_keys() {
    let cache: Arc<CompileCache<CompiledVariant>> = Arc::new(CompileCache::new());
    let build = |spec: JointSpec| {
        aot_function(
            Arc::new(spec),
            Arc::new(InterpreterCompiler),
            Arc::new(InterpreterCompiler),
            AotConfig::default(),
        )
        .with_cache(Arc::clone(&cache))
    };
    let chain = build(JointSpec::Chain);
    let constant = build(JointSpec::ConstantScale);

    // Identical argument signatures, different functions.
    let primals = JointSpec::Chain.example_primals().expect("primals");
    assert_ne!(chain.cache_key(&primals), constant.cache_key(&primals));
    chain.call(&primals).expect("chain");
    constant.call(&primals).expect("constant");
    assert_eq!(cache.len(), 2);
    assert_eq!(chain.num_compiled_variants(), 2);

    chain.clear_compile_cache();
    assert!(cache.is_empty());
    assert_eq!(
        constant.call(&primals).expect("recompile").lookup,
        CacheLookup::Compiled
    );
}
