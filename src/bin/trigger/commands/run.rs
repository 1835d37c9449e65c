use crate::cli::{self, RunArgs};
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use std::path::PathBuf;
use trigger_rs::coincidence::RegistrySource;
use trigger_rs::recorder::FileRecorder;
use trigger_rs::config::SourceKind;
use trigger_rs::source::{create_source, SourceConfig};
use trigger_rs::{DetectorTable, LocalArray, WorkerSpec};

fn input_files(pattern: &str, kind: SourceKind) -> Result<Vec<PathBuf>, String> {
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| format!("Invalid input pattern '{}': {}", pattern, e))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(format!("No {} files match '{}'", kind, pattern));
    }
    Ok(files)
}

pub async fn execute(args: RunArgs) -> i32 {
    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    if let Some(threshold) = args.threshold {
        config.detector.threshold_sigma = threshold;
    }
    if let Some(multiplicity) = args.multiplicity {
        config.coincidence.multiplicity = multiplicity;
    }
    if let Some(window) = args.window {
        config.coincidence.default_window = window;
    }
    if let Some(rounds) = args.rounds {
        config.coincidence.max_rounds = Some(rounds);
    }
    if let Some(interval) = args.swap_interval_ms {
        config.acquisition.swap_interval_ms = interval;
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

    let kind = config.acquisition.source;
    let files = match input_files(&args.input, kind) {
        Ok(files) => files,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let offset = config.coincidence.antenna_id_offset;
    let mut antennas = Vec::with_capacity(files.len());
    for file in &files {
        match cli::antenna_id(file, offset) {
            Ok(id) => antennas.push(id),
            Err(msg) => {
                eprintln!("Error: {}", msg);
                return exit_codes::INPUT_ERROR;
            }
        }
    }

    let registry = match &args.detconfig {
        Some(path) => match DetectorTable::load(path) {
            Ok(table) => RegistrySource::Table(table),
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::INPUT_ERROR;
            }
        },
        None => RegistrySource::Uniform {
            window: config.coincidence.default_window,
        },
    };

    let mut array = LocalArray::new(config.clone(), registry);
    for (file, &antenna_id) in files.iter().zip(&antennas) {
        let source = match create_source(&SourceConfig::select(file, &config.acquisition)) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::INPUT_ERROR;
            }
        };
        let recorder = match FileRecorder::create(
            &config.recorder.location,
            config.recorder.run_id,
            antenna_id + offset,
        ) {
            Ok(recorder) => recorder,
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::EXECUTION_ERROR;
            }
        };
        array.add_worker(WorkerSpec {
            antenna_id,
            source,
            recorder: Box::new(recorder),
        });
    }

    let halt = array.halt_signal();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Ctrl-C received, finishing the current round");
            halt.raise();
        }
    });

    log::info!("Running {} {} antenna(s) from '{}'", files.len(), kind, args.input);
    let joined = tokio::task::spawn_blocking(move || array.run()).await;
    signal_task.abort();

    let report = match joined {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
        Err(e) => {
            eprintln!("Error: array task failed: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    let destination = output::Destination::from_arg(args.output.as_deref());
    if !output::emit(&report, args.compact, destination) {
        return exit_codes::EXECUTION_ERROR;
    }
    if args.output.is_some() || log::log_enabled!(log::Level::Info) {
        eprintln!("{}", output::summarize(&report));
    }

    if report.is_success() {
        exit_codes::SUCCESS
    } else {
        if let Some(e) = &report.coordinator_error {
            eprintln!("Error: coordinator: {}", e);
        }
        for worker in report.workers.iter().filter(|w| w.error.is_some()) {
            eprintln!(
                "Error: antenna {}: {}",
                worker.antenna_id,
                worker.error.as_deref().unwrap_or_default()
            );
        }
        exit_codes::EXECUTION_ERROR
    }
}
