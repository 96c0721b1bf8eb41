pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logger;
pub mod loss;
pub mod mask;
pub mod metrics;
pub mod model;
pub mod train;

pub use config::{ModelConfig, NmtError, RunConfig};
pub use data::{Batch, NmtDataset};
pub use logger::RecordLogger;
pub use loss::CrossEntropyLoss;
pub use metrics::AverageMeter;
pub use model::{Decoder, Encoder, Transformer};

use candle_core::Device;

/// Pick the compute device: CANDLE_FORCE_CPU wins, then CUDA if available,
/// otherwise CPU.
pub fn setup_device() -> Result<Device, NmtError> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        println!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            println!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        Ok(_) | Err(_) => {
            println!("Using CPU backend");
            Ok(Device::Cpu)
        }
    }
}
