use clap::{Args, Parser, Subcommand};
use std::path::Path;

#[derive(Parser)]
#[command(
    name = "trigger",
    version,
    about = "Double-buffered acquisition and coincidence trigger for radio detector arrays",
    long_about = "Capture sample buffers, detect transients per channel and keep only the\n\
                  events that coincide across enough antennas. Set $TRIGGER_CONFIG or use --config."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an in-process array, one worker per replay file or DMA region
    Run(RunArgs),
    /// Record periodic raw snapshots and noise figures from one antenna
    Background(BackgroundArgs),
    /// Scan one buffer of a recording for candidate transients
    Detect(DetectArgs),
    /// Validate a configuration file and detector table
    Validate(ValidateArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Glob matching one input per antenna: replay files or DMA regions (e.g. "data/a1*.bin")
    #[arg(long, visible_alias = "replay")]
    pub input: String,

    /// Sample source for every input (default: acquisition.source, else replay)
    #[arg(long, value_parser = ["replay", "mapped"])]
    pub source: Option<String>,

    /// JSON configuration file
    #[arg(long, env = "TRIGGER_CONFIG")]
    pub config: Option<String>,

    /// Detector table: delays followed by the antenna distance matrix
    #[arg(long)]
    pub detconfig: Option<String>,

    /// Stop after this many rounds (default: until Ctrl-C)
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Run number used in the output layout
    #[arg(long)]
    pub run_id: Option<u32>,

    /// Root directory for recorded events
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Trigger threshold in standard deviations
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Minimum distinct antennas per coincidence
    #[arg(long)]
    pub multiplicity: Option<usize>,

    /// Coincidence window in samples when no detector table is given
    #[arg(long)]
    pub window: Option<i64>,

    /// Replay swap period in milliseconds
    #[arg(long)]
    pub swap_interval_ms: Option<u64>,

    /// Report file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct BackgroundArgs {
    /// Replay file or DMA region of the antenna (e.g. "data/a183.bin")
    #[arg(long)]
    pub input: String,

    /// Sample source for the input (default: acquisition.source, else replay)
    #[arg(long, value_parser = ["replay", "mapped"])]
    pub source: Option<String>,

    /// JSON configuration file
    #[arg(long, env = "TRIGGER_CONFIG")]
    pub config: Option<String>,

    /// Seconds between snapshots
    #[arg(long)]
    pub interval: Option<f64>,

    /// Bytes kept from each captured buffer
    #[arg(long)]
    pub length: Option<usize>,

    /// Stop after this many snapshots (default: until Ctrl-C)
    #[arg(long)]
    pub count: Option<u64>,

    /// Run number used in the output layout
    #[arg(long)]
    pub run_id: Option<u32>,

    /// Root directory for the snapshot files
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct DetectArgs {
    /// Raw 8-bit sample file
    #[arg(long)]
    pub file: String,

    /// JSON configuration file
    #[arg(long, env = "TRIGGER_CONFIG")]
    pub config: Option<String>,

    /// Trigger threshold in standard deviations
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Byte offset of the buffer to scan
    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// JSON configuration file
    #[arg(long, env = "TRIGGER_CONFIG")]
    pub config: String,

    /// Detector table to check alongside the configuration
    #[arg(long)]
    pub detconfig: Option<String>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Host number from the trailing digits of an input file stem ("a183.bin" -> 183).
pub fn host_number(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    stem[digits_start..].parse().ok()
}

/// Antenna id for an input file: its host number minus `offset`.
pub fn antenna_id(path: &Path, offset: u32) -> Result<u32, String> {
    let host = host_number(path)
        .ok_or_else(|| format!("Cannot derive a host number from '{}'", path.display()))?;
    host.checked_sub(offset).ok_or_else(|| {
        format!(
            "Host number {} of '{}' is below the antenna id offset {}",
            host,
            path.display(),
            offset
        )
    })
}
