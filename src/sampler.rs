//! Sample sources for the relay's channels.
//!
//! A [`SampleSource`] produces one scalar reading per sample tick. The relay
//! ships a simulated feed, [`SineWaveSource`], which stands in for a real
//! sensor: a slow sinusoid with Gaussian noise. Anything that can produce an
//! `f64` on demand can replace it without changes downstream.

use std::f64::consts::PI;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::clock::Clock;

/// Produces one reading per call, once per sample interval.
pub trait SampleSource: Send {
    fn next_sample(&mut self) -> f64;
}

impl<F> SampleSource for F
where
    F: FnMut() -> f64 + Send,
{
    fn next_sample(&mut self) -> f64 {
        self()
    }
}

/// Shape of the simulated waveform.
#[derive(Debug, Clone)]
pub struct SineConfig {
    /// Period of the sinusoid in seconds
    pub period_secs: f64,

    /// Peak amplitude
    pub amplitude: f64,

    /// Standard deviation of the additive Gaussian noise
    pub noise_stddev: f64,
}

impl Default for SineConfig {
    fn default() -> Self {
        Self {
            period_secs: 600.0,
            amplitude: 200.0,
            noise_stddev: 10.0,
        }
    }
}

/// Errors building a [`SineWaveSource`].
#[derive(Debug)]
pub enum SamplerError {
    /// Period must be finite and positive
    InvalidPeriod(f64),

    /// Noise standard deviation must be finite and non-negative
    InvalidNoise(f64),
}

impl std::fmt::Display for SamplerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplerError::InvalidPeriod(p) => write!(f, "invalid sine period: {}", p),
            SamplerError::InvalidNoise(s) => write!(f, "invalid noise stddev: {}", s),
        }
    }
}

impl std::error::Error for SamplerError {}

/// Noisy sinusoid driven by wall-clock time.
///
/// The phase advances with the clock at `period_secs`. Each source draws its
/// own time offset uniformly from `[0, period_secs)`, so two channels built
/// from the same config do not move in lockstep.
pub struct SineWaveSource {
    config: SineConfig,
    clock: Arc<dyn Clock>,
    offset_secs: f64,
    noise: Normal<f64>,
    rng: StdRng,
}

impl SineWaveSource {
    /// Create a source seeded from OS entropy.
    pub fn new(config: SineConfig, clock: Arc<dyn Clock>) -> Result<Self, SamplerError> {
        Self::with_rng(config, clock, StdRng::from_entropy())
    }

    /// Create a source with the default waveform.
    pub fn with_defaults(clock: Arc<dyn Clock>) -> Result<Self, SamplerError> {
        Self::new(SineConfig::default(), clock)
    }

    /// Create a source with a deterministic seed.
    pub fn seeded(
        config: SineConfig,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> Result<Self, SamplerError> {
        Self::with_rng(config, clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: SineConfig,
        clock: Arc<dyn Clock>,
        mut rng: StdRng,
    ) -> Result<Self, SamplerError> {
        if !config.period_secs.is_finite() || config.period_secs <= 0.0 {
            return Err(SamplerError::InvalidPeriod(config.period_secs));
        }
        let stddev = config.noise_stddev;
        if !stddev.is_finite() || stddev < 0.0 {
            return Err(SamplerError::InvalidNoise(stddev));
        }
        let noise = Normal::new(0.0, stddev).map_err(|_| SamplerError::InvalidNoise(stddev))?;
        let offset_secs = rng.gen_range(0.0..config.period_secs);

        Ok(Self {
            config,
            clock,
            offset_secs,
            noise,
            rng,
        })
    }

    /// Phase offset in seconds drawn for this source.
    pub fn offset_secs(&self) -> f64 {
        self.offset_secs
    }

    /// Noise-free value of the waveform at unix time `t` (seconds).
    pub fn baseline_at(&self, t: f64) -> f64 {
        let phase = 2.0 * PI * (t + self.offset_secs) / self.config.period_secs;
        self.config.amplitude * phase.sin()
    }
}

impl SampleSource for SineWaveSource {
    fn next_sample(&mut self) -> f64 {
        let now = self.clock.now();
        let t = now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9;
        self.baseline_at(t) + self.noise.sample(&mut self.rng)
    }
}
