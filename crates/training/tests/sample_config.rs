use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use training::{trainer::build_gated_model, ConfigDocument, ParameterBudget};

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../resnet_configs/config.yaml")
}

#[test]
fn every_sample_run_resolves() -> Result<()> {
    let document = ConfigDocument::from_path(sample_path())?;
    let mut names = document.run_names();
    names.sort_unstable();
    assert_eq!(names, vec!["adam_small", "best_model", "resnet18", "test1"]);
    for name in names {
        let config = document.resolve(name)?;
        assert_eq!(config.run_name(), name);
    }
    Ok(())
}

#[test]
fn sample_runs_meet_or_exceed_budget_as_named() -> Result<()> {
    let document = ConfigDocument::from_path(sample_path())?;
    let budget = ParameterBudget::default();

    let best = build_gated_model(&document.resolve("best_model")?, &Device::Cpu, budget)?;
    assert_eq!(best.total_params, 2_797_610);
    let test1 = build_gated_model(&document.resolve("test1")?, &Device::Cpu, budget)?;
    assert_eq!(test1.total_params, 4_903_242);

    let rejected = build_gated_model(&document.resolve("resnet18")?, &Device::Cpu, budget);
    assert!(matches!(rejected, Err(err) if err.is_budget_rejection()));
    Ok(())
}
