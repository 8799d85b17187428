//! End-to-end training on a tiny two-behavior dataset.
//!
//! 4 users, 3 items, behaviors `view` and `buy` (target), one layer, d = 2.

use behavior_graph_core::{
    AugmentConfig, AugmentKind, Behaviors, InteractionData, InteractionMap, ModelConfig, RunConfig,
    TrainingConfig,
};
use behavior_graph_train::Trainer;
use candle_core::Device;

fn map(rows: Vec<(u32, Vec<u32>)>) -> InteractionMap {
    rows.into_iter().collect()
}

fn dataset() -> InteractionData {
    let behaviors = Behaviors::parse("view,buy").unwrap();
    let view = map(vec![(0, vec![0, 1]), (1, vec![1, 2]), (2, vec![0]), (3, vec![2])]);
    let buy = map(vec![(0, vec![0]), (1, vec![1]), (2, vec![0, 2]), (3, vec![2])]);
    let test = map(vec![(0, vec![2]), (1, vec![0])]);
    InteractionData::from_maps(behaviors, vec![view, buy], test).unwrap()
}

fn config() -> RunConfig {
    RunConfig {
        model: ModelConfig {
            embed_dim: 2,
            layer_sizes: vec![2],
            att_dim: 2,
            mess_dropout: 0.1,
        },
        augment: AugmentConfig {
            kind: AugmentKind::EdgeDropout,
            ratio: 0.25,
        },
        training: TrainingConfig {
            batch_size: 3,
            epochs: 3,
            test_every: 1,
            patience: 5,
            seed: 11,
            ks: vec![1, 2],
            eval_batch_size: 1,
            eval_threads: 1,
            device: "cpu".to_string(),
        },
        ..RunConfig::default()
    }
}

#[test]
fn test_single_step_is_finite_and_keeps_padding_zero() {
    let data = dataset();
    let mut trainer = Trainer::new(&data, config(), &Device::Cpu).unwrap();
    let views = trainer.sample_views().unwrap();
    let batch = trainer.instances().batch(0, 4);
    assert_eq!(batch.len(), 4);

    let step = trainer.compute_gradients(&batch, &views).unwrap();
    assert!(step.losses.total.is_finite(), "{:?}", step.losses);
    assert!(step.losses.rec.is_finite());
    assert!(step.losses.ssl.is_finite());
    assert!(step.losses.ssl2.is_finite());
    assert!(step.grads.is_finite().unwrap());
    // user, item, relation, W_gc_0, W_rel_0: only the last relation map is
    // out of the intra-view loss's reach
    assert_eq!(trainer.probe(), Some(Some(4)));
    assert_eq!(trainer.history().probe_parameter.as_deref(), Some("W_rel_0"));

    let losses = trainer.train_step(&batch, &views).unwrap();
    assert!(!losses.is_nan());
    assert_eq!(trainer.history().total_steps, 1);

    let out = trainer.encoder().forward_main().unwrap();
    assert_eq!(out.item.dims(), &[4, 2, 2]);
    let padding: Vec<f32> = out.item.narrow(0, 3, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert!(padding.iter().all(|&v| v == 0.0));
    let all: Vec<f32> = out.user.flatten_all().unwrap().to_vec1().unwrap();
    assert!(all.iter().all(|v| v.is_finite()));

    for attn in &out.layer_attention {
        let sums: Vec<Vec<f32>> = attn.sum(2).unwrap().to_vec2().unwrap();
        for s in sums.iter().flatten() {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }
}

#[test]
fn test_fit_records_history() {
    let data = dataset();
    let mut trainer = Trainer::new(&data, config(), &Device::Cpu).unwrap();
    let history = trainer.fit().unwrap().clone();

    assert_eq!(history.epochs.len(), 3);
    // 4 users, batch size 3: last partial batch kept
    assert!(history.epochs.iter().all(|e| e.num_batches == 2));
    assert_eq!(history.total_steps, 6);
    assert!(history.epochs.iter().all(|e| e.metrics.is_some()));
    let best = history.best_metrics.as_ref().unwrap();
    assert_eq!(best.users, 2);
    assert_eq!(best.ks, vec![1, 2]);
    assert!(best.recall.iter().all(|r| (0.0..=1.0).contains(r)));
    assert!(!history.early_stopped);

    // reported best is the first epoch reaching the best recall
    let best_epoch = history.best_epoch.unwrap();
    let best_recall = best.primary_recall();
    for record in &history.epochs {
        let recall = record.metrics.as_ref().unwrap().primary_recall();
        if record.epoch < best_epoch {
            assert!(recall < best_recall, "epoch {} ties the best", record.epoch);
        } else {
            assert!(recall <= best_recall);
        }
    }

    let json = serde_json::to_string(&history).unwrap();
    assert!(json.contains("best_epoch"));
}

#[test]
fn test_two_layers_leave_last_relation_map_unshared() {
    let data = dataset();
    let mut config = config();
    config.model.layer_sizes = vec![2, 2];
    let mut trainer = Trainer::new(&data, config, &Device::Cpu).unwrap();
    let views = trainer.sample_views().unwrap();
    let batch = trainer.instances().batch(0, 4);
    trainer.train_step(&batch, &views).unwrap();

    assert_eq!(trainer.probe(), Some(Some(6)));
    assert_eq!(trainer.history().probe_parameter.as_deref(), Some("W_rel_1"));

    // discovered once, unchanged by later steps
    trainer.train_step(&batch, &views).unwrap();
    assert_eq!(trainer.history().probe_parameter.as_deref(), Some("W_rel_1"));
}

#[test]
fn test_same_seed_same_losses() {
    let data = dataset();
    let run = || {
        let mut trainer = Trainer::new(&data, config(), &Device::Cpu).unwrap();
        trainer.train_epoch(0).unwrap().0
    };
    let (a, b) = (run(), run());
    assert!((a.total - b.total).abs() < 1e-9);
}

#[test]
fn test_target_as_aux_behavior_rejected() {
    let data = dataset();
    let mut config = config();
    config.loss.aux_behaviors = vec![1];
    let err = Trainer::new(&data, config, &Device::Cpu).err().unwrap();
    assert!(err.is_config(), "{}", err);
}

#[test]
fn test_wrong_vector_length_rejected() {
    let data = dataset();
    let mut config = config();
    config.loss.coefficient = vec![0.5, 0.3, 0.2];
    let err = Trainer::new(&data, config, &Device::Cpu).err().unwrap();
    assert!(err.is_config());
}
