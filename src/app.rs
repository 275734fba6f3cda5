//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - builds the sky configuration
//! - runs the sky pipeline on a synthetic exposure
//! - prints reports and writes optional exports

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use clap::Parser;

use crate::cli::{Command, FitArgs, RunArgs, ShowArgs, SyntheticArgs};
use crate::data::SyntheticSpec;
use crate::domain::SkyConfig;
use crate::error::SkyError;
use crate::report::{LogReporter, format_peaks};

pub mod pipeline;

/// Entry point for the `skysub` binary.
pub fn run() -> Result<(), SkyError> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();

    let cli = crate::cli::Cli::parse();
    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Show(args) => handle_show(args),
    }
}

fn handle_run(args: RunArgs) -> Result<(), SkyError> {
    let config = sky_config_from_args(&args.fit)?;
    let spec = synthetic_spec_from_args(&args.synthetic);

    let mut reporter = LogReporter;
    let run = pipeline::run_pipeline(&spec, &config, &mut reporter)?;

    println!(
        "{}",
        crate::report::format_run_summary(&run.sample.exposure, &run.fit.summary, &config, &run.stats)
    );

    if let Some(path) = &args.export {
        crate::io::write_sky_json(path, &run.fit, &config)?;
        log::info!("wrote sky model to {}", path.display());
    }
    Ok(())
}

fn handle_show(args: ShowArgs) -> Result<(), SkyError> {
    let file = crate::io::read_sky_json(&args.path)?;
    let model = file.to_model()?;

    println!("=== skysub - {} ===", args.path.display());
    println!("Created: {}", file.created_at.to_rfc3339());
    println!(
        "Sky model: nspec={} nwave={} nrej={} iterations={}",
        model.nspec(),
        model.nwave(),
        model.nrej(),
        file.summary.iterations
    );
    let masked = model.mask().iter().filter(|&&m| m != 0).count();
    println!("Masked pixels: {masked}");
    if file.summary.inflation_applied {
        println!();
        print!("{}", format_peaks(&file.summary.peaks));
    }
    Ok(())
}

/// Read a sky configuration JSON file.
pub fn read_config_json(path: &Path) -> Result<SkyConfig, SkyError> {
    let file = File::open(path).map_err(|source| SkyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SkyConfig = serde_json::from_reader(BufReader::new(file))?;
    Ok(config)
}

/// Layer CLI flags over the configuration file (or defaults) and validate.
pub fn sky_config_from_args(args: &FitArgs) -> Result<SkyConfig, SkyError> {
    let mut config = match &args.config {
        Some(path) => read_config_json(path)?,
        None => SkyConfig::default(),
    };
    if let Some(nsig) = args.nsig {
        config.nsig_clipping = nsig;
    }
    if let Some(n) = args.max_iterations {
        config.max_iterations = n;
    }
    if args.model_ivar {
        config.model_ivar = true;
    }
    if args.no_extra_variance {
        config.add_variance = false;
    }
    config.validate()?;
    Ok(config)
}

pub fn synthetic_spec_from_args(args: &SyntheticArgs) -> SyntheticSpec {
    SyntheticSpec {
        nspec: args.nspec,
        nwave: args.nwave,
        sky_every: args.sky_every,
        ndiag: args.ndiag,
        lsf_sigma: args.lsf_sigma,
        read_noise: args.read_noise,
        noise: !args.no_noise,
        cosmics: args.cosmics,
        seed: args.seed,
        ..SyntheticSpec::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn fit_args() -> FitArgs {
        FitArgs {
            config: None,
            nsig: None,
            max_iterations: None,
            model_ivar: false,
            no_extra_variance: false,
        }
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{"nsig_clipping": 6.0, "max_iterations": 7, "inflation": {{"peak_fraction": 0.2}}}}"#).unwrap();

        let args = FitArgs {
            config: Some(path),
            max_iterations: Some(3),
            no_extra_variance: true,
            ..fit_args()
        };
        let config = sky_config_from_args(&args).unwrap();
        assert_eq!(config.nsig_clipping, 6.0);
        assert_eq!(config.max_iterations, 3);
        assert!(!config.add_variance);
        assert_eq!(config.inflation.peak_fraction, 0.2);
        assert_eq!(config.inflation.sigma_wave_step, 0.005);
    }

    #[test]
    fn invalid_flags_are_config_errors() {
        let args = FitArgs {
            nsig: Some(-1.0),
            ..fit_args()
        };
        let err = sky_config_from_args(&args).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
