#![forbid(unsafe_code)]

//! Fixture-level conformance for both partitioners: recomposition, saved
//! byte ordering, pruning, extraction idempotence and the calling convention
//! between the two halves.

use ag_conformance::{
    DEFAULT_TOLERANCE, all_close, annotate, check_fixture, run_fixture_suite, run_joint,
    run_partitioned,
};
use ag_core::fixtures::{JointSpec, build_joint};
use ag_core::{InputRole, JointGraph};
use ag_partition::{
    DefaultPartitioner, MinCutPartitioner, Partition, Partitioner, PartitionerKind,
    extract_subgraph,
};
use ag_test_utils::{CaseLog, Verdict, case_name, fixture_digest, init_test_tracing};
use tracing::info;

fn annotated(spec: JointSpec) -> JointGraph {
    let mut joint = build_joint(spec).expect("fixture should build");
    let args = spec.example_joint_args().expect("example args");
    annotate(&mut joint, &args).expect("annotation");
    joint
}

fn saved_names(partition: &Partition) -> Vec<&str> {
    partition.saved.iter().map(|saved| saved.name.as_str()).collect()
}

fn log_case(name: &str, spec: JointSpec, partitioner: &str, partition: &Partition) {
    let joint = build_joint(spec).expect("fixture should build");
    let log = CaseLog::new(
        case_name(module_path!(), name),
        fixture_digest(&joint).expect("fixture digest"),
        partitioner,
        Verdict::Pass,
    )
    .with_saved(partition.num_saved(), partition.saved_bytes());
    info!(case = %log.to_json_line().expect("case log"), "conformance case");
}

#[test]
fn every_fixture_recomposes_under_every_partitioner() {
    init_test_tracing();
    let reports = run_fixture_suite().expect("suite should run");
    assert_eq!(reports.len(), JointSpec::ALL.len() * 2);
    for report in &reports {
        assert!(
            report.recomposes,
            "{} under {} does not recompose",
            report.fixture, report.partitioner
        );
    }
}

#[test]
fn min_cut_never_saves_more_bytes_than_default() {
    init_test_tracing();
    for spec in JointSpec::ALL {
        let joint = annotated(spec);
        let default = DefaultPartitioner.partition(&joint).expect("default");
        let min_cut = MinCutPartitioner::new().partition(&joint).expect("min-cut");
        log_case("min_cut_never_saves_more_bytes_than_default", spec, "min_cut", &min_cut);
        let min_cut_bytes = min_cut.saved_bytes().expect("annotated");
        let default_bytes = default.saved_bytes().expect("annotated");
        assert!(
            min_cut_bytes <= default_bytes,
            "{}: min-cut {min_cut_bytes} > default {default_bytes}",
            spec.as_str()
        );
    }
}

#[test]
fn every_saved_placeholder_is_read_by_the_backward_graph() {
    for spec in JointSpec::ALL {
        let joint = annotated(spec);
        for partitioner in [
            Box::new(DefaultPartitioner) as Box<dyn Partitioner>,
            Box::new(MinCutPartitioner::new()),
        ] {
            let partition = partitioner.partition(&joint).expect("partition");
            let placeholders = partition.backward.placeholders();
            for &id in &placeholders[..partition.num_saved()] {
                assert!(
                    !partition.backward.users_of(id).is_empty(),
                    "{}/{}: saved placeholder {id} is unused",
                    spec.as_str(),
                    partitioner.name()
                );
            }
        }
    }
}

#[test]
fn backward_inputs_are_saved_values_then_tangents() {
    for spec in JointSpec::ALL {
        let joint = annotated(spec);
        let partition = MinCutPartitioner::new().partition(&joint).expect("partition");
        let placeholders = partition.backward.placeholders();
        assert_eq!(placeholders.len(), partition.num_saved() + partition.num_tangents);

        let names: Vec<&str> = placeholders
            .iter()
            .map(|&id| partition.backward.node(id).expect("placeholder").name.as_str())
            .collect();
        assert_eq!(&names[..partition.num_saved()], saved_names(&partition).as_slice());
        for &id in &placeholders[partition.num_saved()..] {
            let node = partition.backward.node(id).expect("placeholder");
            assert_eq!(node.role(), Some(InputRole::Tangent));
        }

        // Forward returns the user outputs first, then the saved values.
        assert_eq!(
            partition.forward.outputs().len(),
            partition.num_forward_outputs + partition.num_saved()
        );
    }
}

#[test]
fn re_extracting_a_half_is_isomorphic() {
    for spec in JointSpec::ALL {
        let joint = annotated(spec);
        let partition = MinCutPartitioner::new().partition(&joint).expect("partition");
        for half in [&partition.forward, &partition.backward] {
            let again = extract_subgraph(half, &half.placeholders(), half.outputs())
                .expect("re-extraction");
            assert!(again.graph.is_isomorphic(half), "{}", spec.as_str());
            assert_eq!(again.graph.len(), half.len());
        }
    }
}

#[test]
fn halves_carry_no_dead_code() {
    for spec in JointSpec::ALL {
        let joint = annotated(spec);
        let partition = DefaultPartitioner.partition(&joint).expect("partition");
        for half in [&partition.forward, &partition.backward] {
            let mut copy = half.clone();
            assert_eq!(copy.eliminate_dead_code(), 0, "{}", spec.as_str());
        }
    }
}

#[test]
fn mul_sum_saves_the_small_operand() {
    let joint = annotated(JointSpec::MulSum);
    let default = DefaultPartitioner.partition(&joint).expect("default");
    let min_cut = MinCutPartitioner::new().partition(&joint).expect("min-cut");
    assert_eq!(saved_names(&default), vec!["primals_2"]);
    assert_eq!(saved_names(&min_cut), vec!["primals_2"]);
    // 12 elements of f64 instead of the 48-element product.
    assert_eq!(min_cut.saved_bytes(), Some(96));

    let args = JointSpec::MulSum.example_joint_args().expect("args");
    let expected = run_joint(&joint, &args).expect("joint");
    assert!(all_close(
        &run_partitioned(&min_cut, &args).expect("partitioned"),
        &expected,
        DEFAULT_TOLERANCE
    ));
}

#[test]
fn shape_values_never_cross_a_min_cut() {
    let joint = annotated(JointSpec::ShapeDriven);
    let partition = MinCutPartitioner::new().partition(&joint).expect("partition");
    assert!(!saved_names(&partition).contains(&"sym_size"));
    assert!(partition.saved.iter().all(|saved| {
        saved.meta.as_ref().is_some_and(|meta| meta.is_tensor())
    }));
}

#[test]
fn random_mask_is_saved_not_redrawn() {
    let report = check_fixture(JointSpec::RandomMask, PartitionerKind::MinCut).expect("report");
    assert!(report.recomposes);
    assert!(report.saved.iter().any(|name| name == "rand_like"));
}
