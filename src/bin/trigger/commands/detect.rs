use crate::cli::DetectArgs;
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use serde::Serialize;
use trigger_rs::SpikeDetector;

#[derive(Serialize)]
struct DetectOutput {
    file: String,
    offset: usize,
    length: usize,
    threshold_sigma: f32,
    noise_estimate: f32,
    truncated: bool,
    candidates: Vec<i64>,
}

pub fn execute(args: DetectArgs) -> i32 {
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
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return exit_codes::INPUT_ERROR;
    }

    let data = match std::fs::read(&args.file) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error: Cannot read '{}': {}", args.file, e);
            return exit_codes::INPUT_ERROR;
        }
    };
    if args.offset >= data.len() {
        eprintln!(
            "Error: Offset {} is past the end of '{}' ({} bytes)",
            args.offset,
            args.file,
            data.len()
        );
        return exit_codes::INPUT_ERROR;
    }

    let end = (args.offset + config.acquisition.buffer_size).min(data.len());
    let window = &data[args.offset..end];
    let detector = SpikeDetector::new(&config.detector);
    let detection = detector.detect(window, config.detector.threshold_sigma);

    let result = DetectOutput {
        file: args.file.clone(),
        offset: args.offset,
        length: window.len(),
        threshold_sigma: config.detector.threshold_sigma,
        noise_estimate: detection.noise_estimate,
        truncated: detection.truncated,
        candidates: detection.hits,
    };

    if args.json {
        if !output::emit(&result, false, output::Destination::Stdout) {
            return exit_codes::EXECUTION_ERROR;
        }
    } else {
        println!(
            "{}: {} candidate(s) in {} bytes at offset {} (noise {:.2}, threshold {} sigma){}",
            result.file,
            result.candidates.len(),
            result.length,
            result.offset,
            result.noise_estimate,
            result.threshold_sigma,
            if result.truncated { ", truncated" } else { "" }
        );
        for t in &result.candidates {
            println!("  {}", t);
        }
    }

    exit_codes::SUCCESS
}
