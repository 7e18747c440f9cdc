use std::{path::PathBuf, process::ExitCode, str::FromStr};

use clap::Parser;
use serde_json::{Number, Value};
use tracing::error;
use tracing_subscriber::EnvFilter;
use training::{ConfigDocument, Trainer, TrainingError};

const BUDGET_REJECTED_EXIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "ResNet CIFAR-10 training CLI", long_about = None)]
struct Args {
    #[arg(
        long,
        value_name = "PATH",
        default_value = "resnet_configs/config.yaml",
        help = "Path to the run configuration document"
    )]
    config: PathBuf,

    #[arg(
        long = "resnet_architecture",
        value_name = "NAME",
        default_value = "best_model",
        help = "Run name to select from the configuration document"
    )]
    resnet_architecture: String,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a field of the selected run"
    )]
    overrides: Vec<OverrideArg>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    key: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if key.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is_budget_rejection() => {
            error!(%err, "run rejected by parameter budget");
            eprintln!("training aborted: {err}");
            ExitCode::from(BUDGET_REJECTED_EXIT)
        }
        Err(err) => {
            eprintln!("training failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), TrainingError> {
    let mut document = ConfigDocument::from_path(&args.config)?;
    for override_arg in &args.overrides {
        document.apply_override(
            &args.resnet_architecture,
            &override_arg.key,
            parse_override_value(&override_arg.value),
        )?;
    }
    let config = document.resolve(&args.resnet_architecture)?;

    let mut trainer = Trainer::new(config)?;
    let summary = trainer.run()?;
    println!(
        "finished {} epoch(s) from epoch {}; best accuracy {:.3}%",
        summary.epochs_run, summary.start_epoch, summary.best_accuracy
    );
    if let Some(path) = summary.checkpoint_path {
        println!("best checkpoint: {}", path.display());
    }
    Ok(())
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_are_typed() {
        assert_eq!(parse_override_value("3"), Value::from(3));
        assert_eq!(parse_override_value("0.05"), Value::from(0.05));
        assert_eq!(parse_override_value("false"), Value::Bool(false));
        assert_eq!(parse_override_value("[1, 2]"), serde_json::json!([1, 2]));
        assert_eq!(parse_override_value("adam"), Value::from("adam"));
    }

    #[test]
    fn defaults_select_best_model() {
        let args = Args::parse_from(["train"]);
        assert_eq!(args.config, PathBuf::from("resnet_configs/config.yaml"));
        assert_eq!(args.resnet_architecture, "best_model");
        assert!(args.overrides.is_empty());

        let args = Args::parse_from(["train", "--override", "lr=0.01"]);
        assert_eq!(args.overrides[0].key, "lr");
        assert_eq!(args.overrides[0].value, "0.01");
    }
}
