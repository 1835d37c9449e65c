pub mod array;
pub mod background;
pub mod buffer_sync;
pub mod coincidence;
pub mod config;
pub mod detector;
pub mod error;
pub mod recorder;
pub mod registry;
pub mod source;
pub mod timing;
pub mod types;
pub mod wait;

pub use array::{ArrayReport, LocalArray, WorkerSpec};
pub use background::{BackgroundMonitor, BackgroundSample, BackgroundSummary};
pub use buffer_sync::{AcquisitionState, BufferSync, ChunkRead, SwapReport};
pub use config::TriggerConfig;
pub use detector::{Detection, SpikeDetector};
pub use error::{Result, TriggerError};
pub use registry::{ChannelRegistry, DetectorTable};
pub use types::*;
pub use wait::HaltSignal;
