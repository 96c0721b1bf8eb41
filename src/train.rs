//! Epoch-level training and validation loops.

use std::time::Instant;

use candle_core::Device;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::VarMap;
use rand::{rngs::StdRng, SeedableRng};

use crate::checkpoint::{self, WEIGHTS_FILENAME};
use crate::config::{NmtError, RunConfig};
use crate::data::NmtDataset;
use crate::logger::RecordLogger;
use crate::loss::CrossEntropyLoss;
use crate::metrics::AverageMeter;
use crate::model::Transformer;

pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum()
}

/// One training epoch. Per batch: move tensors onto the compute device, run
/// the forward pass on `target[:, :-1]`, flatten logits against
/// `target[:, 1:]` for one-step-ahead prediction, backpropagate, and apply a
/// single optimizer step. Returns the batch-size-weighted average loss.
#[allow(clippy::too_many_arguments)]
pub fn train_one_epoch(
    model: &Transformer,
    dataset: &NmtDataset,
    optimizer: &mut AdamW,
    criterion: &CrossEntropyLoss,
    logger: &mut RecordLogger,
    epoch: usize,
    run: &RunConfig,
    rng: &mut StdRng,
    device: &Device,
) -> Result<f64, NmtError> {
    let mut epoch_loss = AverageMeter::new();
    let mut iter_time = AverageMeter::new();
    let mut data_time = AverageMeter::new();

    let num_batches = dataset.num_batches(run.batch_size);
    let cpu = Device::Cpu;
    let mut end = Instant::now();

    for (i, batch) in dataset
        .batches(run.batch_size, Some(rng), model.pad_id(), &cpu)
        .enumerate()
    {
        let batch = batch?.to_device(device)?;
        data_time.update(end.elapsed().as_secs_f64(), 1);

        let tgt_len = batch.target.dim(1)?;
        if tgt_len < 2 {
            return Err(NmtError::runtime(
                "target batch too short for one-step-ahead prediction",
            ));
        }

        // Predictions cover every target position except the last one.
        let tgt_input = batch.target.narrow(1, 0, tgt_len - 1)?;
        let (logits, _) = model.forward(&batch.source, &tgt_input, true)?;

        let (b, t, vocab) = logits.dims3()?;
        let logits = logits.reshape((b * t, vocab))?;
        let labels = batch
            .target
            .narrow(1, 1, tgt_len - 1)?
            .contiguous()?
            .reshape((b * t,))?;

        let output = criterion.compute(&logits, &labels)?;
        optimizer.backward_step(&output.loss)?;

        let loss_value = output.loss.to_vec0::<f32>()? as f64;
        epoch_loss.update(loss_value, batch.size);
        iter_time.update(end.elapsed().as_secs_f64(), 1);
        end = Instant::now();

        if i % run.log_every == 0 {
            println!(
                "[{}/{}][{}/{}] train loss: {:.4} iter time: {:.4} data time: {:.4}",
                i + 1,
                num_batches,
                epoch + 1,
                run.epochs,
                epoch_loss.average(),
                iter_time.average(),
                data_time.average()
            );
        }
    }

    logger.write(&[
        epoch as f64,
        epoch_loss.average(),
        iter_time.average(),
        data_time.average(),
    ])?;

    Ok(epoch_loss.average())
}

/// One validation epoch: identical forward and loss computation with dropout
/// disabled and no optimizer step. The loss tensor is never backpropagated,
/// so no gradients are materialized.
pub fn validate_one_epoch(
    model: &Transformer,
    dataset: &NmtDataset,
    criterion: &CrossEntropyLoss,
    logger: &mut RecordLogger,
    epoch: usize,
    run: &RunConfig,
    device: &Device,
) -> Result<f64, NmtError> {
    let mut val_loss = AverageMeter::new();
    let cpu = Device::Cpu;

    for batch in dataset.batches(run.batch_size, None, model.pad_id(), &cpu) {
        let batch = batch?.to_device(device)?;

        let tgt_len = batch.target.dim(1)?;
        if tgt_len < 2 {
            return Err(NmtError::runtime(
                "target batch too short for one-step-ahead prediction",
            ));
        }

        let tgt_input = batch.target.narrow(1, 0, tgt_len - 1)?;
        let (logits, _) = model.forward(&batch.source, &tgt_input, false)?;

        let (b, t, vocab) = logits.dims3()?;
        let logits = logits.reshape((b * t, vocab))?;
        let labels = batch
            .target
            .narrow(1, 1, tgt_len - 1)?
            .contiguous()?
            .reshape((b * t,))?;

        let output = criterion.compute(&logits, &labels)?;
        val_loss.update(output.loss.to_vec0::<f32>()? as f64, batch.size);
    }

    println!(
        "\nepoch [{}/{}] validation loss: {:.4}\n",
        epoch + 1,
        run.epochs,
        val_loss.average()
    );
    logger.write(&[epoch as f64, val_loss.average()])?;

    Ok(val_loss.average())
}

/// Full run: all epochs of train + validate, then a single weight dump.
#[allow(clippy::too_many_arguments)]
pub fn run(
    model: &Transformer,
    varmap: &VarMap,
    train_dataset: &NmtDataset,
    val_dataset: &NmtDataset,
    run_config: &RunConfig,
    train_logger: &mut RecordLogger,
    val_logger: &mut RecordLogger,
    device: &Device,
) -> Result<(), NmtError> {
    let criterion = CrossEntropyLoss::new(model.pad_id());
    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: run_config.learning_rate,
            weight_decay: run_config.weight_decay,
            ..Default::default()
        },
    )?;

    let mut rng = StdRng::seed_from_u64(run_config.seed);

    for epoch in 0..run_config.epochs {
        train_one_epoch(
            model,
            train_dataset,
            &mut optimizer,
            &criterion,
            train_logger,
            epoch,
            run_config,
            &mut rng,
            device,
        )?;
        validate_one_epoch(
            model,
            val_dataset,
            &criterion,
            val_logger,
            epoch,
            run_config,
            device,
        )?;
    }

    let weights_path = std::path::Path::new(&run_config.save_path).join(WEIGHTS_FILENAME);
    checkpoint::save_weights(varmap, &weights_path)?;
    println!("saved final weights to {}", weights_path.display());

    Ok(())
}
