//! Command-line parsing for the sky subtraction tool.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the fitting code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "skysub", version, about = "Fiber spectrograph sky model fit and subtraction")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a synthetic exposure, fit its sky, subtract it, and print diagnostics.
    Run(RunArgs),
    /// Print the diagnostics stored in a previously exported sky JSON.
    Show(ShowArgs),
}

/// Fit options. Flags override values loaded with `--config`.
#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    /// Sky configuration JSON (missing keys take their defaults).
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Chi-square clipping threshold in sigma.
    #[arg(long)]
    pub nsig: Option<f64>,

    /// Maximum number of rejection iterations.
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Fit with a smooth model of the inverse variance.
    #[arg(long)]
    pub model_ivar: bool,

    /// Skip the sky line variance inflation.
    #[arg(long)]
    pub no_extra_variance: bool,
}

/// Synthetic exposure options.
#[derive(Debug, Args, Clone)]
pub struct SyntheticArgs {
    /// Number of fibers.
    #[arg(long, default_value_t = 20)]
    pub nspec: usize,

    /// Number of wavelength pixels.
    #[arg(long, default_value_t = 200)]
    pub nwave: usize,

    /// Every N-th fiber is a sky fiber.
    #[arg(long, default_value_t = 4)]
    pub sky_every: usize,

    /// Resolution band width (odd).
    #[arg(long, default_value_t = 11)]
    pub ndiag: usize,

    /// Line-spread sigma in pixels.
    #[arg(long, default_value_t = 1.0)]
    pub lsf_sigma: f64,

    /// Read noise per pixel.
    #[arg(long, default_value_t = 3.0)]
    pub read_noise: f64,

    /// Generate noise-free spectra.
    #[arg(long)]
    pub no_noise: bool,

    /// Cosmic-ray hits to inject on sky fibers.
    #[arg(long, default_value_t = 0)]
    pub cosmics: usize,

    /// Random seed.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub fit: FitArgs,

    #[command(flatten)]
    pub synthetic: SyntheticArgs,

    /// Export the sky model to JSON.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Sky JSON produced by `skysub run --export`.
    #[arg(value_name = "JSON")]
    pub path: PathBuf,
}
