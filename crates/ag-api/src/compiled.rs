//! The compiled-function orchestrator.
//!
//! Per cache key: trace the joint graph, partition it, compile both halves
//! and keep them. Every call then runs the forward executable, stashes the
//! saved values and hands them to the backward executable when gradients
//! arrive.

use ag_cache::{CacheKey, CacheLookup, CompileCache, build_cache_key};
use ag_core::{JointGraph, NodeKind, TensorValue, Value};
use ag_interpreters::{ShapePropagation, SizeOracle};
use ag_ledger::{CompileLedger, CompileRecord};
use ag_partition::{Partition, Partitioner};
use ag_runtime::{BackendCompiler, BackendError, BackendRegistry, Executable, execute_checked};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::AotConfig;
use crate::errors::ApiError;
use crate::function::JointFunction;

/// Both halves of one compiled variant plus the calling convention between
/// them.
pub struct CompiledVariant {
    forward: Arc<dyn Executable>,
    backward: Arc<dyn Executable>,
    num_forward_outputs: usize,
    num_tangents: usize,
    saved_names: Vec<String>,
}

impl CompiledVariant {
    #[must_use]
    pub fn num_forward_outputs(&self) -> usize {
        self.num_forward_outputs
    }

    #[must_use]
    pub fn num_saved(&self) -> usize {
        self.saved_names.len()
    }

    /// Saved values in the order the backward executable expects them.
    #[must_use]
    pub fn saved_names(&self) -> &[String] {
        &self.saved_names
    }
}

impl std::fmt::Debug for CompiledVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledVariant")
            .field("num_forward_outputs", &self.num_forward_outputs)
            .field("num_tangents", &self.num_tangents)
            .field("saved_names", &self.saved_names)
            .finish_non_exhaustive()
    }
}

/// Result of a forward call.
#[derive(Debug)]
pub struct ForwardResult {
    pub outputs: Vec<Value>,
    pub pending: PendingBackward,
    pub lookup: CacheLookup,
}

/// Saved values of one forward call, waiting for upstream gradients.
#[derive(Debug)]
pub struct PendingBackward {
    variant: Arc<CompiledVariant>,
    saved: Vec<Value>,
}

impl PendingBackward {
    #[must_use]
    pub fn saved(&self) -> &[Value] {
        &self.saved
    }

    /// Gradients of the primals, given one gradient per forward output.
    pub fn backward(&self, grads: &[Value]) -> Result<Vec<Value>, ApiError> {
        if grads.len() != self.variant.num_tangents {
            return Err(ApiError::GradientArity {
                expected: self.variant.num_tangents,
                actual: grads.len(),
            });
        }
        let mut args = Vec::with_capacity(self.saved.len() + grads.len());
        args.extend(self.saved.iter().cloned());
        args.extend(grads.iter().cloned());
        Ok(execute_checked(self.variant.backward.as_ref(), &args)?)
    }
}

/// Compiles a joint function with separate forward and backward compilers.
pub fn aot_function(
    function: Arc<dyn JointFunction>,
    fw_compiler: Arc<dyn BackendCompiler>,
    bw_compiler: Arc<dyn BackendCompiler>,
    config: AotConfig,
) -> AotFunction {
    let partitioner = config.partitioner.build(config.min_cut);
    AotFunction {
        function,
        fw_compiler,
        bw_compiler,
        partitioner,
        oracle: Arc::new(ShapePropagation),
        cache: Arc::new(CompileCache::new()),
        ledger: Arc::new(Mutex::new(CompileLedger::new())),
        config,
    }
}

/// Like [`aot_function`] with both halves compiled by `config.backend`.
pub fn aot_function_on(
    function: Arc<dyn JointFunction>,
    registry: &BackendRegistry,
    config: AotConfig,
) -> Result<AotFunction, ApiError> {
    let compiler = registry.get(&config.backend)?;
    Ok(aot_function(function, Arc::clone(&compiler), compiler, config))
}

/// Registry with the interpreter backend registered as `cpu`.
#[must_use]
pub fn default_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(ag_backend_cpu::InterpreterCompiler));
    registry
}

pub struct AotFunction {
    function: Arc<dyn JointFunction>,
    fw_compiler: Arc<dyn BackendCompiler>,
    bw_compiler: Arc<dyn BackendCompiler>,
    partitioner: Box<dyn Partitioner>,
    oracle: Arc<dyn SizeOracle>,
    cache: Arc<CompileCache<CompiledVariant>>,
    ledger: Arc<Mutex<CompileLedger>>,
    config: AotConfig,
}

impl std::fmt::Debug for AotFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotFunction")
            .field("function", &self.function.id())
            .field("partitioner", &self.partitioner.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AotFunction {
    /// Shares `cache` with other functions instead of a private one.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CompileCache<CompiledVariant>>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn SizeOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<Mutex<CompileLedger>>) -> Self {
        self.ledger = ledger;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AotConfig {
        &self.config
    }

    #[must_use]
    pub fn cache_key(&self, args: &[Value]) -> CacheKey {
        build_cache_key(self.function.id(), self.config.hasher, args)
    }

    /// Runs the forward pass, compiling a new variant on the first call with
    /// this argument signature.
    pub fn call(&self, args: &[Value]) -> Result<ForwardResult, ApiError> {
        let key = self.cache_key(args);
        let (variant, lookup) = self
            .cache
            .get_or_try_compile(&key, || self.compile_recorded(&key, args))?;

        let outputs = execute_checked(variant.forward.as_ref(), args)?;
        let (outputs, saved) = split_saved(outputs, variant.num_forward_outputs)?;
        Ok(ForwardResult {
            outputs,
            pending: PendingBackward { variant, saved },
            lookup,
        })
    }

    /// Distinct variants in the cache this function compiles into.
    #[must_use]
    pub fn num_compiled_variants(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_compile_cache(&self) {
        self.cache.clear();
    }

    /// Snapshot of every compile attempt so far.
    #[must_use]
    pub fn ledger(&self) -> CompileLedger {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, record: CompileRecord) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(record);
    }

    fn compile_recorded(&self, key: &CacheKey, args: &[Value]) -> Result<CompiledVariant, ApiError> {
        let digest = key.digest_hex();
        match self.compile(args) {
            Ok((variant, partition)) => {
                let saved_names = variant.saved_names.clone();
                self.record(
                    CompileRecord::compiled(digest, self.partitioner.name())
                        .with_saved(saved_names, partition.saved_bytes(), partition.cut_value)
                        .with_graph_sizes(partition.forward.len(), partition.backward.len()),
                );
                Ok(variant)
            }
            Err(err) => {
                warn!(key = %digest, error = %err, "compile failed");
                self.record(CompileRecord::failed(
                    digest,
                    self.partitioner.name(),
                    err.to_string(),
                ));
                Err(err)
            }
        }
    }

    fn compile(&self, primals: &[Value]) -> Result<(CompiledVariant, Partition), ApiError> {
        let mut joint = self.function.trace_joint(primals)?;
        let tangents = zero_tangents(&joint)?;
        let mut joint_args = primals.to_vec();
        joint_args.extend(tangents.iter().cloned());
        self.oracle.annotate(&mut joint.graph, &joint_args)?;

        let partition = self.partitioner.partition(&joint)?;
        debug!(
            partitioner = self.partitioner.name(),
            saved = ?partition.saved.iter().map(|saved| saved.name.as_str()).collect::<Vec<_>>(),
            "partitioned joint graph"
        );

        let forward = self.fw_compiler.compile(&partition.forward, primals)?;
        let forward_outputs = execute_checked(forward.as_ref(), primals)?;
        let (_, example_saved) = split_saved(forward_outputs, partition.num_forward_outputs)?;
        let saved_bytes: u64 = example_saved.iter().map(Value::nbytes).sum();
        info!(
            function = %self.function.id(),
            num_saved = example_saved.len(),
            saved_bytes,
            "saved activations"
        );

        let mut backward_examples = example_saved;
        backward_examples.extend(tangents);
        let backward = self
            .bw_compiler
            .compile(&partition.backward, &backward_examples)?;

        let variant = CompiledVariant {
            forward,
            backward,
            num_forward_outputs: partition.num_forward_outputs,
            num_tangents: partition.num_tangents,
            saved_names: partition.saved.iter().map(|saved| saved.name.clone()).collect(),
        };
        Ok((variant, partition))
    }
}

/// Splits forward results into user-visible outputs and saved values.
fn split_saved(
    mut outputs: Vec<Value>,
    num_forward_outputs: usize,
) -> Result<(Vec<Value>, Vec<Value>), ApiError> {
    if outputs.len() < num_forward_outputs {
        return Err(BackendError::OutputArity {
            expected: num_forward_outputs,
            actual: outputs.len(),
        }
        .into());
    }
    let saved = outputs.split_off(num_forward_outputs);
    Ok((outputs, saved))
}

/// Zero-filled example tangents from the declared tangent shapes.
fn zero_tangents(joint: &JointGraph) -> Result<Vec<Value>, ApiError> {
    joint
        .tangents()
        .into_iter()
        .map(|id| {
            let node = joint.graph.node(id);
            let aval = match node.map(|node| &node.kind) {
                Some(NodeKind::Placeholder {
                    aval: Some(aval), ..
                }) => aval,
                _ => {
                    return Err(ApiError::TangentShape {
                        name: node.map_or_else(|| id.to_string(), |node| node.name.clone()),
                    });
                }
            };
            Ok(Value::Tensor(TensorValue::full(aval, 0.0)?))
        })
        .collect()
}
