use l2l_core::{
    EmptyOptimizer, ExecutionContext, MetaError, MetaOptimizer, OptimizerStateStore, Regime,
    ShardPlan,
};

#[test]
fn borders_partition_exercises_without_gaps() {
    for exercises in 1..40 {
        for shards in 1..=exercises.min(8) {
            let plan = ShardPlan::new(exercises, shards).unwrap();
            let counts = plan.num_exercises_on_shards();
            assert_eq!(counts.iter().sum::<usize>(), exercises);

            let base = exercises / shards;
            assert!(counts[..shards - 1].iter().all(|&c| c == base));
            assert_eq!(counts[shards - 1], base + exercises % shards);

            let mut next = 0;
            for (first, last) in plan.borders() {
                assert_eq!(first, next);
                next = last + 1;
            }
            assert_eq!(next, exercises);

            for (exercise, &shard) in plan.exercise_shard_map().iter().enumerate() {
                assert!(plan.exercise_range(shard).unwrap().contains(&exercise));
            }
        }
    }
}

#[test]
fn seventeen_exercises_over_four_shards() {
    let plan = ShardPlan::new(17, 4).unwrap();
    assert_eq!(plan.num_exercises_on_shards(), &[4, 4, 4, 5]);
    assert_eq!(plan.context(3), Some(ExecutionContext::Gpu(3)));
    assert_eq!(plan.base_context(), ExecutionContext::Cpu);
    assert_eq!(plan.base_context().to_string(), "cpu:0");
}

#[test]
fn per_shard_state_follows_the_plan() {
    let plan = ShardPlan::new(10, 3).unwrap();
    let mut store = OptimizerStateStore::new();
    for shard in plan.shards() {
        store.create("train", shard, plan.num_exercises_on_shards()[shard], 16);
    }
    assert_eq!(store.get("train", 2).unwrap().h.dim(), (4, 16));
    assert_eq!(store.get("train", 0).unwrap().c.dim(), (3, 16));
    assert!(matches!(
        store.get("inference", 0),
        Err(MetaError::StateNotFound { .. })
    ));
}

#[test]
fn empty_core_keeps_degenerate_state_per_shard() {
    let mut core = EmptyOptimizer::new(Regime::Inference).unwrap();
    core.create_states("inference", 0, 1).unwrap();
    core.reset_states("inference").unwrap();
    let state = core.states().get("inference", 0).unwrap();
    assert_eq!(state.h.dim(), (1, 0));
    assert!(core.reset_states("train").is_err());
}
