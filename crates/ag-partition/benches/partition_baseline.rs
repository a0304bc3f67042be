use ag_core::JointGraph;
use ag_core::fixtures::{JointSpec, build_joint};
use ag_interpreters::{ShapePropagation, SizeOracle};
use ag_partition::{DefaultPartitioner, MinCutPartitioner, Partitioner, extract_subgraph};
use criterion::{Criterion, criterion_group, criterion_main};

fn annotated(spec: JointSpec) -> JointGraph {
    let mut joint = build_joint(spec).expect("fixture should build");
    let args = spec
        .example_joint_args()
        .expect("fixture example args should build");
    ShapePropagation
        .annotate(&mut joint.graph, &args)
        .expect("shape propagation should succeed on fixtures");
    joint
}

fn benchmark_partitioners(c: &mut Criterion) {
    for spec in [JointSpec::Chain, JointSpec::MatMulRelu] {
        let joint = annotated(spec);

        c.bench_function(&format!("partition/default/{}", spec.as_str()), |b| {
            b.iter(|| {
                DefaultPartitioner
                    .partition(&joint)
                    .expect("default partition should succeed")
            });
        });

        let min_cut = MinCutPartitioner::new();
        c.bench_function(&format!("partition/min_cut/{}", spec.as_str()), |b| {
            b.iter(|| {
                min_cut
                    .partition(&joint)
                    .expect("min-cut partition should succeed")
            });
        });
    }
}

fn benchmark_extraction(c: &mut Criterion) {
    let joint = annotated(JointSpec::MatMulRelu);
    let inputs = joint.graph.placeholders();
    c.bench_function("extract/full_joint", |b| {
        b.iter(|| {
            extract_subgraph(&joint.graph, &inputs, joint.graph.outputs())
                .expect("full extraction should succeed")
        });
    });
}

criterion_group!(partition_benches, benchmark_partitioners, benchmark_extraction);
criterion_main!(partition_benches);
