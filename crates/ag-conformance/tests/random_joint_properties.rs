#![forbid(unsafe_code)]

use ag_conformance::{DEFAULT_TOLERANCE, all_close, annotate, run_joint, run_partitioned};
use ag_core::JointGraph;
use ag_partition::{
    DefaultPartitioner, MinCutPartitioner, Partition, Partitioner,
    extract_subgraph,
};
use ag_test_utils::proptest_strategies::{JointRecipe, arb_joint_recipe};
use ag_test_utils::property_test_case_count;
use proptest::prelude::*;

fn annotated(recipe: &JointRecipe) -> (JointGraph, Vec<ag_core::Value>) {
    let mut joint = recipe.build().expect("recipe should build");
    let args = recipe.example_args().expect("example args");
    annotate(&mut joint, &args).expect("annotation");
    (joint, args)
}

fn saved_placeholders_are_read(partition: &Partition) -> bool {
    partition
        .backward
        .placeholders()
        .iter()
        .take(partition.num_saved())
        .all(|&id| !partition.backward.users_of(id).is_empty())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(property_test_case_count()))]

    #[test]
    fn both_partitioners_recompose(recipe in arb_joint_recipe()) {
        let (joint, args) = annotated(&recipe);
        let expected = run_joint(&joint, &args).expect("joint");
        let partitioners: [Box<dyn Partitioner>; 2] =
            [Box::new(DefaultPartitioner), Box::new(MinCutPartitioner::new())];
        for partitioner in partitioners {
            // Every recipe value is a tensor, so no cut is unbounded.
            let partition = partitioner.partition(&joint).expect("partition");
            let actual = run_partitioned(&partition, &args).expect("partitioned");
            prop_assert!(
                all_close(&actual, &expected, DEFAULT_TOLERANCE),
                "{} does not recompose",
                partitioner.name()
            );
            prop_assert!(saved_placeholders_are_read(&partition));
        }
    }

    #[test]
    fn min_cut_saves_no_more_than_default(recipe in arb_joint_recipe()) {
        let (joint, _) = annotated(&recipe);
        let default = DefaultPartitioner.partition(&joint).expect("default");
        let min_cut = MinCutPartitioner::new().partition(&joint).expect("min-cut");
        let default_bytes = default.saved_bytes().expect("annotated");
        let min_cut_bytes = min_cut.saved_bytes().expect("annotated");
        prop_assert!(min_cut_bytes <= default_bytes);
        prop_assert!(min_cut.cut_value.is_some_and(|cut| min_cut_bytes <= cut));
    }

    #[test]
    fn extracted_halves_are_fixpoints(recipe in arb_joint_recipe()) {
        let (joint, _) = annotated(&recipe);
        let partition = MinCutPartitioner::new().partition(&joint).expect("min-cut");
        for half in [&partition.forward, &partition.backward] {
            let again = extract_subgraph(half, &half.placeholders(), half.outputs())
                .expect("re-extraction");
            prop_assert!(again.graph.is_isomorphic(half));
            let mut copy = half.clone();
            prop_assert_eq!(copy.eliminate_dead_code(), 0);
        }
    }
}
