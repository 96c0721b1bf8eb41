use candle_core::{DType, Device, Tensor};
use candle_nn::optim::{AdamW, ParamsAdamW};
use candle_nn::{Optimizer, VarBuilder, VarMap};

use dialect_nmt::config::{ModelConfig, RunConfig};
use dialect_nmt::data::{Example, NmtDataset};
use dialect_nmt::logger::RecordLogger;
use dialect_nmt::loss::CrossEntropyLoss;
use dialect_nmt::model::Transformer;
use dialect_nmt::train;
use rand::{rngs::StdRng, SeedableRng};

fn tiny_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        hidden_dim: 8,
        enc_layers: 1,
        dec_layers: 1,
        enc_heads: 2,
        dec_heads: 2,
        pf_dim: 16,
        dropout: 0.0,
        max_len: 16,
        pad_id: 0,
    }
}

fn tiny_run(save_path: &str) -> RunConfig {
    RunConfig {
        data_dir: String::new(),
        save_path: save_path.to_string(),
        batch_size: 2,
        epochs: 1,
        learning_rate: 5e-4,
        weight_decay: 1e-4,
        log_every: 100,
        seed: 17,
        use_loc: false,
    }
}

fn toy_dataset() -> NmtDataset {
    let examples = vec![
        Example {
            source: vec![5, 12, 7],
            target: vec![1, 3, 9, 2],
            location: 0,
        },
        Example {
            source: vec![4, 9],
            target: vec![1, 8, 2],
            location: 0,
        },
        Example {
            source: vec![6, 11, 13, 3],
            target: vec![1, 4, 7, 10, 2],
            location: 0,
        },
    ];
    NmtDataset::from_examples(examples, 0)
}

fn build_model(config: &ModelConfig) -> (Transformer, VarMap) {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Transformer::new(config, vb).unwrap();
    (model, varmap)
}

#[test]
fn shifted_targets_align_predictions_one_step_ahead() {
    // Source [5, 12, 7, pad, pad], target [bos, 3, 9, eos, pad]: the decoder
    // input drops the final token and the loss labels drop the first one,
    // with the pad position excluded from the contributing set.
    let config = tiny_config();
    let (model, _varmap) = build_model(&config);
    let device = Device::Cpu;

    let src = Tensor::from_vec(vec![5u32, 12, 7, 0, 0], (1, 5), &device).unwrap();
    let tgt = Tensor::from_vec(vec![1u32, 3, 9, 2, 0], (1, 5), &device).unwrap();

    let tgt_input = tgt.narrow(1, 0, 4).unwrap();
    let (logits, _) = model.forward(&src, &tgt_input, false).unwrap();
    assert_eq!(logits.dims(), &[1, 4, 16]);

    let labels = tgt
        .narrow(1, 1, 4)
        .unwrap()
        .contiguous()
        .unwrap()
        .reshape((4,))
        .unwrap();
    assert_eq!(labels.to_vec1::<u32>().unwrap(), vec![3, 9, 2, 0]);

    let criterion = CrossEntropyLoss::new(0);
    let flat = logits.reshape((4, 16)).unwrap();
    let out = criterion.compute(&flat, &labels).unwrap();
    assert_eq!(out.valid_tokens, 3);

    // Dropping the pad row entirely must give the same average.
    let trimmed_logits = flat.narrow(0, 0, 3).unwrap();
    let trimmed_labels = Tensor::from_vec(vec![3u32, 9, 2], (3,), &device).unwrap();
    let trimmed = criterion.compute(&trimmed_logits, &trimmed_labels).unwrap();

    let full = out.loss.to_vec0::<f32>().unwrap();
    let manual = trimmed.loss.to_vec0::<f32>().unwrap();
    assert!((full - manual).abs() < 1e-6);
}

#[test]
fn train_epoch_logs_summary_and_reports_finite_loss() {
    let config = tiny_config();
    let (model, varmap) = build_model(&config);
    let device = Device::Cpu;

    let dir = tempfile::tempdir().unwrap();
    let run = tiny_run(dir.path().to_str().unwrap());
    let dataset = toy_dataset();

    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: run.learning_rate,
            weight_decay: run.weight_decay,
            ..Default::default()
        },
    )
    .unwrap();
    let criterion = CrossEntropyLoss::new(0);
    let log_path = dir.path().join("train.log");
    let mut logger = RecordLogger::create(&log_path).unwrap();
    let mut rng = StdRng::seed_from_u64(run.seed);

    let avg = train::train_one_epoch(
        &model,
        &dataset,
        &mut optimizer,
        &criterion,
        &mut logger,
        0,
        &run,
        &mut rng,
        &device,
    )
    .unwrap();

    assert!(avg.is_finite() && avg > 0.0);
    let contents = std::fs::read_to_string(&log_path).unwrap();
    let fields: Vec<&str> = contents.lines().next().unwrap().split(' ').collect();
    assert_eq!(fields.len(), 4); // epoch, loss, iter time, data time
    assert!(fields[0].starts_with("0.0"));
}

#[test]
fn validation_epoch_is_deterministic_and_updates_nothing() {
    let config = tiny_config();
    let (model, varmap) = build_model(&config);
    let device = Device::Cpu;

    let dir = tempfile::tempdir().unwrap();
    let run = tiny_run(dir.path().to_str().unwrap());
    let dataset = toy_dataset();
    let criterion = CrossEntropyLoss::new(0);

    let before: Vec<Vec<f32>> = varmap
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
        .collect();

    let mut logger_a = RecordLogger::create(dir.path().join("val_a.log")).unwrap();
    let mut logger_b = RecordLogger::create(dir.path().join("val_b.log")).unwrap();
    let loss_a =
        train::validate_one_epoch(&model, &dataset, &criterion, &mut logger_a, 0, &run, &device)
            .unwrap();
    let loss_b =
        train::validate_one_epoch(&model, &dataset, &criterion, &mut logger_b, 0, &run, &device)
            .unwrap();

    // Dropout is disabled and no optimizer runs, so two passes agree exactly
    // and the parameters are untouched.
    assert_eq!(loss_a, loss_b);
    let after: Vec<Vec<f32>> = varmap
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn full_run_saves_final_weights() {
    let config = tiny_config();
    let (model, varmap) = build_model(&config);
    let device = Device::Cpu;

    let dir = tempfile::tempdir().unwrap();
    let run = tiny_run(dir.path().to_str().unwrap());
    let dataset = toy_dataset();

    let mut train_logger = RecordLogger::create(dir.path().join("train.log")).unwrap();
    let mut val_logger = RecordLogger::create(dir.path().join("val.log")).unwrap();

    train::run(
        &model,
        &varmap,
        &dataset,
        &dataset,
        &run,
        &mut train_logger,
        &mut val_logger,
        &device,
    )
    .unwrap();

    assert!(dir.path().join("last_model.safetensors").exists());
    let train_log = std::fs::read_to_string(dir.path().join("train.log")).unwrap();
    assert_eq!(train_log.lines().count(), run.epochs);
    let val_log = std::fs::read_to_string(dir.path().join("val.log")).unwrap();
    assert_eq!(val_log.lines().count(), run.epochs);
}
