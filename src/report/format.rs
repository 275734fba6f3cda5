//! Residual statistics and formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use serde::Serialize;

use crate::domain::{Exposure, FitSummary, PeakInflation, SkyConfig};

/// Residual statistics of the sky fibers after subtraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtractionStats {
    pub nsky: usize,
    /// Unmasked sky pixels with positive ivar.
    pub npix: usize,
    pub masked_pixels: usize,
    /// `Σ flux² ivar / npix` over sky fibers; close to 1 for a good fit.
    pub sky_chi2pdf: f64,
    pub sky_rms: f64,
}

/// Compute residual statistics on an already sky-subtracted exposure.
pub fn compute_subtraction_stats(frame: &Exposure) -> SubtractionStats {
    let skyfibers = frame.sky_fibers();
    let mut npix = 0usize;
    let mut masked = 0usize;
    let mut chi2 = 0.0;
    let mut sumsq = 0.0;

    for &f in &skyfibers {
        for j in 0..frame.nwave() {
            if frame.mask[(f, j)] != 0 {
                masked += 1;
                continue;
            }
            let ivar = frame.ivar[(f, j)];
            if ivar <= 0.0 {
                continue;
            }
            let r = frame.flux[(f, j)];
            chi2 += r * r * ivar;
            sumsq += r * r;
            npix += 1;
        }
    }

    let (sky_chi2pdf, sky_rms) = if npix > 0 {
        (chi2 / npix as f64, (sumsq / npix as f64).sqrt())
    } else {
        (0.0, 0.0)
    };

    SubtractionStats {
        nsky: skyfibers.len(),
        npix,
        masked_pixels: masked,
        sky_chi2pdf,
        sky_rms,
    }
}

/// Format the run summary (exposure shape + fit diagnostics + residuals).
pub fn format_run_summary(
    frame: &Exposure,
    summary: &FitSummary,
    config: &SkyConfig,
    stats: &SubtractionStats,
) -> String {
    let mut out = String::new();

    out.push_str("=== skysub - Sky Model Fit ===\n");
    out.push_str(&format!(
        "Exposure: nspec={} nwave={} | wave=[{:.2}, {:.2}]A\n",
        frame.nspec(),
        frame.nwave(),
        frame.wave.first().copied().unwrap_or(f64::NAN),
        frame.wave.last().copied().unwrap_or(f64::NAN),
    ));
    out.push_str(&format!(
        "Config: nsig={:.2} max_iterations={} model_ivar={} add_variance={}\n",
        config.nsig_clipping, config.max_iterations, config.model_ivar, config.add_variance,
    ));

    out.push_str("\nFit diagnostics:\n");
    out.push_str(&format!("- sky fibers : {}\n", summary.nsky));
    out.push_str(&format!(
        "- iterations : {}{}\n",
        summary.iterations,
        if summary.converged { "" } else { " (not converged)" }
    ));
    out.push_str(&format!("- rejected   : {}\n", summary.nrej));
    out.push_str(&format!(
        "- solver     : {} | covariance: {}\n",
        summary.final_method.display_name(),
        summary.covariance_method.display_name()
    ));

    out.push_str("\nResiduals (sky fibers):\n");
    out.push_str(&format!(
        "- pixels={} masked={} chi2pdf={:.3} rms={:.3}\n",
        stats.npix, stats.masked_pixels, stats.sky_chi2pdf, stats.sky_rms
    ));

    if summary.inflation_applied {
        out.push_str(&format!("\nSky line variance inflation ({} peaks):\n", summary.peaks.len()));
        out.push_str(&format_peaks(&summary.peaks));
    } else {
        out.push_str("\nSky line variance inflation: skipped\n");
    }

    out
}

/// Format the per-peak inflation table.
pub fn format_peaks(peaks: &[PeakInflation]) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:>6} {:>10} {:>12} {:>10} {:>8} {:>10}\n",
            "peak", "wave", "window", "chi2", "ndata", "sigma_wave"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(format!("{:-<6} {:-<10} {:-<12} {:-<10} {:-<8} {:-<10}\n", "", "", "", "", "", "").trim_end());
    out.push('\n');

    for p in peaks {
        let sigma = match p.sigma_wave {
            Some(s) => format!("{s:.3}"),
            None => "-".to_string(),
        };
        out.push_str(
            format!(
                "{:>6} {:>10.2} {:>12} {:>10.3} {:>8.1} {:>10}\n",
                p.peak,
                p.wavelength,
                format!("[{},{})", p.begin, p.end),
                p.mean_chi2,
                p.mean_ndata,
                sigma,
            )
            .trim_end(),
        );
        out.push('\n');
    }

    out
}
