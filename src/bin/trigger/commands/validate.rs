use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use serde::Serialize;
use trigger_rs::{DetectorTable, TriggerConfig};

#[derive(Serialize)]
struct ValidateOutput {
    config: String,
    valid: bool,
    settings: Option<TriggerConfig>,
    detconfig: Option<String>,
    detector_antennas: Option<usize>,
    error: Option<String>,
}

pub fn execute(args: ValidateArgs) -> i32 {
    let loaded = TriggerConfig::load(&args.config);

    let table = args.detconfig.as_ref().map(DetectorTable::load);

    let error = match (&loaded, &table) {
        (Err(e), _) => Some(e.to_string()),
        (_, Some(Err(e))) => Some(e.to_string()),
        _ => None,
    };

    let result = ValidateOutput {
        config: args.config.clone(),
        valid: error.is_none(),
        detector_antennas: table
            .as_ref()
            .and_then(|t| t.as_ref().ok())
            .map(DetectorTable::antennas),
        settings: loaded.ok(),
        detconfig: args.detconfig.clone(),
        error: error.clone(),
    };

    if args.json {
        if !output::emit(&result, false, output::Destination::Stdout) {
            return exit_codes::EXECUTION_ERROR;
        }
    } else if let Some(ref err) = error {
        eprintln!("Error: {}", err);
    } else {
        match result.detector_antennas {
            Some(n) => println!("Configuration '{}' is valid ({} antennas in detector table)", args.config, n),
            None => println!("Configuration '{}' is valid", args.config),
        }
    }

    if error.is_some() {
        exit_codes::INPUT_ERROR
    } else {
        exit_codes::SUCCESS
    }
}
