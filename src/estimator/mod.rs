//! TS map estimation: per-pixel Cash fits dispatched over a worker pool.

pub mod cash;
pub mod mask;
pub mod pixel;
pub mod solvers;
pub mod uncertainty;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use ndarray::Array2;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::errors::TsMapError;
use crate::types::{FitStatus, ImageStack, Kernel, Layer, PixelResult, ResultKind, ResultMaps};
use crate::RTOL;

pub use solvers::FitMethod;
pub use uncertainty::ErrorMethod;

use pixel::{FitSettings, PixelInputs};

/// Plain estimator configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct TsMapConfig {
    pub method: FitMethod,
    pub error_method: ErrorMethod,
    /// Sigma level of the flux error map.
    pub error_sigma: u32,
    pub ul_method: ErrorMethod,
    /// Sigma level of the flux upper-limit map.
    pub ul_sigma: u32,
    /// Worker threads; 1 runs sequentially on the calling thread.
    pub n_jobs: usize,
    /// Minimum seed improvement of the statistic before a pixel is fitted.
    pub threshold: Option<f64>,
    pub rtol: f64,
}

impl Default for TsMapConfig {
    fn default() -> Self {
        TsMapConfig {
            method: FitMethod::RootBrentq,
            error_method: ErrorMethod::Covar,
            error_sigma: 1,
            ul_method: ErrorMethod::Covar,
            ul_sigma: 2,
            n_jobs: 1,
            threshold: None,
            rtol: RTOL,
        }
    }
}

impl TsMapConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |name: &'static str, reason: &str| -> Result<()> {
            Err(TsMapError::InvalidParameter {
                name,
                reason: reason.to_string(),
            }
            .into())
        };
        if self.error_sigma < 1 {
            return invalid("error_sigma", "must be at least 1");
        }
        if self.ul_sigma < 1 {
            return invalid("ul_sigma", "must be at least 1");
        }
        if self.n_jobs < 1 {
            return invalid("n_jobs", "must be at least 1");
        }
        if !(self.rtol.is_finite() && self.rtol > 0.0) {
            return invalid("rtol", "must be finite and positive");
        }
        if let Some(t) = self.threshold {
            if !t.is_finite() {
                return invalid("threshold", "must be finite");
            }
        }
        Ok(())
    }
}

/// TS map estimator with builder pattern.
///
/// Fits a source amplitude at every valid pixel of a counts image and reports
/// the test statistic, flux, flux error, flux upper limit and iteration count
/// as images of the input shape.
pub struct TsMapEstimator {
    config: TsMapConfig,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl Default for TsMapEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMapEstimator {
    pub fn new() -> Self {
        TsMapEstimator {
            config: TsMapConfig::default(),
            thread_pool: None,
        }
    }

    /// Build from a full configuration, rejecting invalid values up front.
    pub fn from_config(config: TsMapConfig) -> Result<Self> {
        config.validate()?;
        Ok(TsMapEstimator {
            config,
            thread_pool: None,
        })
    }

    pub fn config(&self) -> &TsMapConfig {
        &self.config
    }

    pub fn with_method(mut self, method: FitMethod) -> Self {
        self.config.method = method;
        self
    }

    pub fn with_error_method(mut self, method: ErrorMethod) -> Self {
        self.config.error_method = method;
        self
    }

    /// Sigma level of the `flux_err` map (at least 1).
    pub fn with_error_sigma(mut self, sigma: u32) -> Self {
        self.config.error_sigma = sigma.max(1);
        self
    }

    pub fn with_ul_method(mut self, method: ErrorMethod) -> Self {
        self.config.ul_method = method;
        self
    }

    /// Sigma level of the `flux_ul` map (at least 1).
    pub fn with_ul_sigma(mut self, sigma: u32) -> Self {
        self.config.ul_sigma = sigma.max(1);
        self
    }

    /// Number of worker threads (at least 1).
    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.config.n_jobs = n_jobs.max(1);
        self
    }

    /// Skip the fit where the seed flux improves the statistic by less than `threshold`.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.config.threshold = Some(threshold);
        self
    }

    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.config.rtol = rtol;
        self
    }

    /// Use a custom rayon thread pool instead of one sized by `n_jobs`.
    pub fn with_thread_pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.thread_pool = Some(pool);
        self
    }

    /// Compute every result map.
    pub fn run_all(&self, stack: &ImageStack, kernel: &Kernel) -> Result<ResultMaps> {
        self.run(stack, kernel, &ResultKind::ALL)
    }

    /// Compute the result maps named in `which` (e.g. `"ts"`, `"flux_ul"`).
    pub fn run_named(&self, stack: &ImageStack, kernel: &Kernel, which: &[&str]) -> Result<ResultMaps> {
        let kinds = which
            .iter()
            .map(|name| name.parse::<ResultKind>())
            .collect::<Result<Vec<_>, _>>()?;
        self.run(stack, kernel, &kinds)
    }

    /// Compute the requested result maps for `stack` with `kernel`.
    ///
    /// `stack` needs counts, background and exposure layers; an optional mask
    /// layer further restricts the fitted pixels. Every output map has the
    /// counts shape and is NaN where no fit was made.
    pub fn run(&self, stack: &ImageStack, kernel: &Kernel, which: &[ResultKind]) -> Result<ResultMaps> {
        self.config.validate()?;
        let counts = stack.require(Layer::Counts)?;
        let background = stack.require(Layer::Background)?;
        let exposure = stack.require(Layer::Exposure)?;

        let mut kinds: Vec<ResultKind> = Vec::with_capacity(which.len());
        for &kind in which {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        let mut maps = ResultMaps::nan_filled(&kinds, counts.dim());
        if kinds.is_empty() {
            return Ok(maps);
        }

        let mut fit_mask = mask::mask_default(exposure, background, kernel);
        if let Some(user_mask) = stack.mask() {
            fit_mask.zip_mut_with(&user_mask, |m, &u| *m = *m && u);
        }
        let positions: Vec<(usize, usize)> = fit_mask
            .indexed_iter()
            .filter(|&(_, &m)| m)
            .map(|(p, _)| p)
            .collect();

        let null_statistic = cash::cash(counts.view(), background.view());
        let flux_default = (self.config.method.needs_seed() || self.config.threshold.is_some())
            .then(|| mask::flux_default(counts, background, exposure, kernel));

        let inputs = PixelInputs {
            counts,
            background,
            exposure,
            null_statistic: &null_statistic,
            kernel,
            flux_default: flux_default.as_ref(),
        };
        let settings = FitSettings {
            method: self.config.method,
            error: kinds
                .contains(&ResultKind::FluxErr)
                .then_some((self.config.error_method, self.config.error_sigma)),
            upper_limit: kinds
                .contains(&ResultKind::FluxUl)
                .then_some((self.config.ul_method, self.config.ul_sigma)),
            threshold: self.config.threshold,
            rtol: self.config.rtol,
        };

        let n_jobs = match &self.thread_pool {
            Some(pool) => pool.current_num_threads(),
            None => self.config.n_jobs,
        };
        info!(
            "TS map {:?}: {} pixels to fit, method '{}', {} job(s)",
            counts.dim(),
            positions.len(),
            self.config.method,
            n_jobs
        );

        let results = match &self.thread_pool {
            Some(pool) => pool.install(|| evaluate_parallel(&positions, &inputs, &settings, n_jobs)),
            None if n_jobs <= 1 => evaluate_serial(&positions, &inputs, &settings),
            None => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n_jobs)
                    .build()
                    .context("Failed to build TS map worker pool")?;
                pool.install(|| evaluate_parallel(&positions, &inputs, &settings, n_jobs))
            }
        };

        let failed = results
            .iter()
            .filter(|(_, r)| r.status == FitStatus::Failed)
            .count();
        if failed > 0 {
            debug!("{} of {} pixel fits did not converge", failed, results.len());
        }

        for (position, result) in &results {
            write_pixel(&mut maps, *position, result);
        }
        Ok(maps)
    }
}

fn evaluate_serial(
    positions: &[(usize, usize)],
    inputs: &PixelInputs<'_>,
    settings: &FitSettings,
) -> Vec<((usize, usize), PixelResult)> {
    positions
        .iter()
        .map(|&p| (p, pixel::evaluate(p, inputs, settings)))
        .collect()
}

/// One contiguous range of positions per job; results come back in input order.
fn evaluate_parallel(
    positions: &[(usize, usize)],
    inputs: &PixelInputs<'_>,
    settings: &FitSettings,
    n_jobs: usize,
) -> Vec<((usize, usize), PixelResult)> {
    if positions.is_empty() {
        return Vec::new();
    }
    let chunk = positions.len().div_ceil(n_jobs.max(1));
    positions
        .par_chunks(chunk)
        .map(|range| evaluate_serial(range, inputs, settings))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

fn write_pixel(maps: &mut ResultMaps, position: (usize, usize), result: &PixelResult) {
    let values = [
        (ResultKind::Ts, result.ts),
        (ResultKind::SqrtTs, signed_sqrt(result.ts)),
        (ResultKind::Flux, result.flux),
        (ResultKind::FluxErr, result.flux_err.unwrap_or(f64::NAN)),
        (ResultKind::FluxUl, result.flux_ul.unwrap_or(f64::NAN)),
        (ResultKind::Niter, result.niter as f64),
    ];
    for (kind, value) in values {
        if let Some(map) = maps.get_mut(kind) {
            map[position] = value;
        }
    }
}

fn signed_sqrt(ts: f64) -> f64 {
    ts.signum() * ts.abs().sqrt()
}

/// `sign(ts) * sqrt(|ts|)`, NaN preserved.
pub fn sqrt_ts(ts: &Array2<f64>) -> Array2<f64> {
    ts.mapv(signed_sqrt)
}

impl fmt::Display for TsMapEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        writeln!(f, "TsMapEstimator")?;
        writeln!(f, "--------------")?;
        writeln!(f)?;
        writeln!(f, "  {:<14}: {}", "method", c.method)?;
        writeln!(f, "  {:<14}: {}", "error_method", c.error_method)?;
        writeln!(f, "  {:<14}: {}", "error_sigma", c.error_sigma)?;
        writeln!(f, "  {:<14}: {}", "ul_method", c.ul_method)?;
        writeln!(f, "  {:<14}: {}", "ul_sigma", c.ul_sigma)?;
        writeln!(f, "  {:<14}: {}", "n_jobs", c.n_jobs)?;
        match c.threshold {
            Some(t) => writeln!(f, "  {:<14}: {}", "threshold", t)?,
            None => writeln!(f, "  {:<14}: None", "threshold")?,
        }
        write!(f, "  {:<14}: {}", "rtol", c.rtol)
    }
}
