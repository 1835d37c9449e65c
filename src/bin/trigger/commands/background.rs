use crate::cli::{self, BackgroundArgs};
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use std::path::{Path, PathBuf};
use trigger_rs::config::SourceKind;
use trigger_rs::recorder::FileRecorder;
use trigger_rs::source::{create_source, SourceConfig};
use trigger_rs::{BackgroundMonitor, BufferSync, HaltSignal};

pub async fn execute(args: BackgroundArgs) -> i32 {
    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    if let Some(interval) = args.interval {
        config.background.interval_s = interval;
    }
    if let Some(length) = args.length {
        config.background.length = length;
    }
    if let Some(run_id) = args.run_id {
        config.recorder.run_id = run_id;
    }
    if let Some(dir) = &args.data_dir {
        config.recorder.location = PathBuf::from(dir);
    }
    if let Some(source) = &args.source {
        match source.parse::<SourceKind>() {
            Ok(kind) => config.acquisition.source = kind,
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::INPUT_ERROR;
            }
        }
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return exit_codes::INPUT_ERROR;
    }

    let input = Path::new(&args.input);
    let Some(host) = cli::host_number(input) else {
        eprintln!("Error: Cannot derive a host number from '{}'", args.input);
        return exit_codes::INPUT_ERROR;
    };

    let source = match create_source(&SourceConfig::select(input, &config.acquisition)) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };
    let recorder = match FileRecorder::create(&config.recorder.location, config.recorder.run_id, host) {
        Ok(recorder) => recorder,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    let halt = HaltSignal::new();
    let sync = BufferSync::new(source, &config.acquisition, halt.clone());
    let monitor = match BackgroundMonitor::new(sync, Box::new(recorder), &config.background, halt.clone()) {
        Ok(monitor) => monitor,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let signal_halt = halt.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Ctrl-C received, stopping after the current snapshot");
            signal_halt.raise();
        }
    });

    log::info!(
        "Background snapshots of {} bytes every {:?} from '{}'",
        config.background.length,
        config.background.interval(),
        args.input
    );
    let count = args.count;
    let joined = tokio::task::spawn_blocking(move || monitor.run(count)).await;
    signal_task.abort();

    let summary = match joined {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
        Err(e) => {
            eprintln!("Error: background task failed: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    if !output::emit(&summary, args.compact, output::Destination::Stdout) {
        return exit_codes::EXECUTION_ERROR;
    }
    exit_codes::SUCCESS
}
