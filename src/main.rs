use std::fs;
use std::path::Path;

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;

use dialect_nmt::{
    config::{ModelConfig, RunConfig},
    data::NmtDataset,
    logger::RecordLogger,
    model::Transformer,
    setup_device, train,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Transformer dialect machine translation", long_about = None)]
struct Args {
    #[arg(long, default_value = "dataset", help = "Path to dataset directory")]
    data_dir: String,

    #[arg(long, default_value = "./result", help = "Save path")]
    save_path: String,

    #[arg(long, default_value_t = 128, help = "Batch size")]
    batch_size: usize,

    #[arg(long, default_value_t = 30, help = "Number of training epochs")]
    epoch: usize,

    #[arg(long, default_value_t = 4000, help = "Tokenizer vocabulary size")]
    vocab_size: usize,

    #[arg(long, default_value_t = 256, help = "Token embedding dimension")]
    hidden_dim: usize,

    #[arg(long, default_value_t = 6, help = "Number of encoder blocks")]
    enc_layer: usize,

    #[arg(long, default_value_t = 6, help = "Number of decoder blocks")]
    dec_layer: usize,

    #[arg(long, default_value_t = 8, help = "Attention heads per encoder layer")]
    enc_head: usize,

    #[arg(long, default_value_t = 8, help = "Attention heads per decoder layer")]
    dec_head: usize,

    #[arg(long, default_value_t = 512, help = "Feed-forward inner dimension")]
    pf_dim: usize,

    #[arg(long, default_value_t = 0.1, help = "Dropout ratio")]
    dropout: f32,

    #[arg(long, default_value_t = 128, help = "Maximum sequence length")]
    max_len: usize,

    #[arg(long, default_value_t = 0, help = "Padding token id")]
    pad_id: u32,

    #[arg(long, default_value_t = 5e-4, help = "Learning rate")]
    lr: f64,

    #[arg(long, default_value_t = 1e-4, help = "Weight decay")]
    weight_decay: f64,

    #[arg(long, default_value_t = 100, help = "Progress print interval (iterations)")]
    log_every: usize,

    #[arg(long, default_value_t = 17, help = "Shuffle seed")]
    seed: u64,

    #[arg(long, help = "Condition on location labels")]
    use_loc: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("{:?}", args);

    let save_path = Path::new(&args.save_path);
    fs::create_dir_all(save_path)?;

    let run_config = RunConfig {
        data_dir: args.data_dir.clone(),
        save_path: args.save_path.clone(),
        batch_size: args.batch_size,
        epochs: args.epoch,
        learning_rate: args.lr,
        weight_decay: args.weight_decay,
        log_every: args.log_every,
        seed: args.seed,
        use_loc: args.use_loc,
    };
    run_config.validate()?;

    let train_dataset = NmtDataset::load(
        &args.data_dir,
        "train",
        args.use_loc,
        args.vocab_size,
        args.max_len,
    )?;
    let val_dataset = NmtDataset::load(
        &args.data_dir,
        "val",
        args.use_loc,
        args.vocab_size,
        args.max_len,
    )?;

    // Location tokens extend the vocabulary past the tokenizer's ids.
    let num_locations = train_dataset
        .num_locations()
        .max(val_dataset.num_locations());
    let vocab_size = if args.use_loc {
        args.vocab_size + num_locations
    } else {
        args.vocab_size
    };

    let model_config = ModelConfig {
        vocab_size,
        hidden_dim: args.hidden_dim,
        enc_layers: args.enc_layer,
        dec_layers: args.dec_layer,
        enc_heads: args.enc_head,
        dec_heads: args.dec_head,
        pf_dim: args.pf_dim,
        dropout: args.dropout,
        max_len: args.max_len,
        pad_id: args.pad_id,
    };
    model_config.validate()?;
    run_config.save_with_model(&model_config, save_path.join("configuration.json"))?;

    let device = setup_device()?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Transformer::new(&model_config, vb)?;
    println!(
        "model parameters: {} ({} train / {} val examples)",
        train::count_parameters(&varmap),
        train_dataset.len(),
        val_dataset.len()
    );

    let mut train_logger = RecordLogger::create(save_path.join("train.log"))?;
    let mut val_logger = RecordLogger::create(save_path.join("val.log"))?;

    train::run(
        &model,
        &varmap,
        &train_dataset,
        &val_dataset,
        &run_config,
        &mut train_logger,
        &mut val_logger,
        &device,
    )?;

    Ok(())
}
