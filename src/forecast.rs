//! Trend Forecaster - short-horizon ARMA forecasting of the alpha signal
//!
//! Each cycle fits an ARMA(p, 0, q) model to the history window, forecasts a
//! fixed horizon and compares the forecast mean to a percentile-trimmed mean
//! of the window. The signed difference decides whether the level rises,
//! falls or holds.
//!
//! The model is estimated with the two-stage Hannan-Rissanen procedure:
//! a long autoregression supplies innovation estimates, then the series is
//! regressed on its own lags and the lagged innovations. Both stages are
//! ridge-stabilised least squares.

use crate::error::ForecastError;
use crate::shutdown::{spawn_periodic, ShutdownListener};
use crate::state::StateMachine;
use crate::types::{ConductorConfig, MeditationLevel, ModelOrder};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use std::time::Duration;
use tokio::task::JoinHandle;

const RIDGE: f64 = 1e-9;
const PIVOT_EPSILON: f64 = 1e-12;
const MA_LIMIT: f64 = 0.99;
const VARIANCE_EPSILON: f64 = 1e-20;

/// Direction of the forecast relative to the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

/// Hysteresis classification of a forecast delta.
pub fn classify(delta: f64, upper: f64, lower: f64) -> Trend {
    if delta > upper {
        Trend::Rising
    } else if delta < lower {
        Trend::Falling
    } else {
        Trend::Flat
    }
}

/// Fitted ARMA(p, 0, q) model, ready to forecast from the end of its series.
#[derive(Debug, Clone)]
pub struct ArmaModel {
    order: ModelOrder,
    mean: f64,
    ar: Vec<f64>,
    ma: Vec<f64>,
    /// Centred series the model was fitted on
    centred: Vec<f64>,
    /// Innovation estimates aligned with `centred`
    residuals: Vec<f64>,
}

impl ArmaModel {
    /// Order of the long autoregression used in the first stage.
    pub fn long_ar_order(order: ModelOrder) -> usize {
        (2 * (order.p + order.q)).max(8).max(order.p)
    }

    /// Fewest samples `fit` accepts for the given order.
    pub fn min_samples(order: ModelOrder) -> usize {
        2 * (Self::long_ar_order(order) + order.p + order.q + 1)
    }

    pub fn fit(series: &[f64], order: ModelOrder) -> Result<Self, ForecastError> {
        if order.d != 0 || order.p == 0 {
            return Err(ForecastError::UnsupportedOrder { p: order.p, d: order.d, q: order.q });
        }
        let need = Self::min_samples(order);
        if series.len() < need {
            return Err(ForecastError::InsufficientData { have: series.len(), need });
        }
        if series.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::NonFinite);
        }

        let n = series.len();
        let mean = series.iter().sum::<f64>() / n as f64;
        let centred: Vec<f64> = series.iter().map(|v| v - mean).collect();
        let variance = centred.iter().map(|v| v * v).sum::<f64>() / n as f64;
        if variance <= VARIANCE_EPSILON * (1.0 + mean * mean) {
            return Err(ForecastError::Singular);
        }

        // Stage 1: long AR(m) for innovation estimates.
        let m = Self::long_ar_order(order);
        let long_ar = fit_regression(&centred, m, &[], 0, m)?;
        let mut residuals = vec![0.0; n];
        for t in m..n {
            let predicted: f64 = (1..=m).map(|i| long_ar[i - 1] * centred[t - i]).sum();
            residuals[t] = centred[t] - predicted;
        }

        // Stage 2: regress on p lags and q lagged innovations.
        let start = m + order.q;
        let coefficients = fit_regression(&centred, order.p, &residuals, order.q, start)?;
        let ar = coefficients[..order.p].to_vec();
        let ma: Vec<f64> = coefficients[order.p..]
            .iter()
            .map(|b| b.clamp(-MA_LIMIT, MA_LIMIT))
            .collect();

        for t in start..n {
            let predicted = one_step(&ar, &ma, &centred, &residuals, t);
            residuals[t] = centred[t] - predicted;
        }

        if ar.iter().chain(ma.iter()).any(|c| !c.is_finite()) {
            return Err(ForecastError::NonFinite);
        }

        Ok(Self { order, mean, ar, ma, centred, residuals })
    }

    pub fn order(&self) -> ModelOrder {
        self.order
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn ar_coefficients(&self) -> &[f64] {
        &self.ar
    }

    pub fn ma_coefficients(&self) -> &[f64] {
        &self.ma
    }

    /// Recursive multi-step forecast; future innovations are taken as zero.
    ///
    /// Predictions are kept within the observed range widened by a quarter of
    /// its span, so a poorly conditioned fit cannot run away.
    pub fn forecast(&self, horizon: usize) -> Result<Vec<f64>, ForecastError> {
        let n = self.centred.len();
        let (lower, upper) = forecast_bounds(&self.centred);
        let mut values = self.centred.clone();
        let mut innovations = self.residuals.clone();
        values.reserve(horizon);
        innovations.reserve(horizon);

        let mut out = Vec::with_capacity(horizon);
        for t in n..n + horizon {
            let next = one_step(&self.ar, &self.ma, &values, &innovations, t);
            if !next.is_finite() {
                return Err(ForecastError::NonFinite);
            }
            let next = next.clamp(lower, upper);
            values.push(next);
            innovations.push(0.0);
            out.push(next + self.mean);
        }
        Ok(out)
    }
}

fn forecast_bounds(series: &[f64]) -> (f64, f64) {
    let (min_val, max_val) = series
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let margin = ((max_val - min_val) * 0.25).max(1e-3);
    (min_val - margin, max_val + margin)
}

fn one_step(ar: &[f64], ma: &[f64], values: &[f64], innovations: &[f64], t: usize) -> f64 {
    let ar_part: f64 = ar
        .iter()
        .enumerate()
        .filter(|(i, _)| t > *i)
        .map(|(i, a)| a * values[t - i - 1])
        .sum();
    let ma_part: f64 = ma
        .iter()
        .enumerate()
        .filter(|(j, _)| t > *j)
        .map(|(j, b)| b * innovations[t - j - 1])
        .sum();
    ar_part + ma_part
}

/// Least squares of `series[t]` on `p` own lags and `q` lags of `innovations`,
/// over rows `t in start..len`.
fn fit_regression(
    series: &[f64],
    p: usize,
    innovations: &[f64],
    q: usize,
    start: usize,
) -> Result<Vec<f64>, ForecastError> {
    let rows = series.len().saturating_sub(start);
    let cols = p + q;
    if rows <= cols {
        return Err(ForecastError::InsufficientData { have: series.len(), need: start + cols + 1 });
    }

    let mut design = Array2::<f64>::zeros((rows, cols));
    let mut target = Array1::<f64>::zeros(rows);
    for (row, t) in (start..series.len()).enumerate() {
        for i in 0..p {
            design[[row, i]] = series[t - i - 1];
        }
        for j in 0..q {
            design[[row, p + j]] = innovations[t - j - 1];
        }
        target[row] = series[t];
    }

    let mut normal = design.t().dot(&design);
    let rhs = design.t().dot(&target);

    let scale = normal.diag().sum() / cols as f64;
    for k in 0..cols {
        normal[[k, k]] += RIDGE * scale;
    }

    solve(normal, rhs).map(|x| x.to_vec())
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>, ForecastError> {
    let n = b.len();
    let scale = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return Err(ForecastError::Singular);
    }

    for col in 0..n {
        let mut pivot = col;
        for row in col + 1..n {
            if a[[row, col]].abs() > a[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if a[[pivot, col]].abs() <= PIVOT_EPSILON * scale {
            return Err(ForecastError::Singular);
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }

        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }

    if x.iter().any(|v| !v.is_finite()) {
        return Err(ForecastError::NonFinite);
    }
    Ok(x)
}

/// Percentile of an ascending slice, interpolating linearly between ranks.
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Mean of the values lying within the `[low, high]` percentile band.
pub fn trimmed_mean(values: &[f64], low: f64, high: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    let lower = percentile(&sorted, low)?;
    let upper = percentile(&sorted, high)?;

    let kept: Vec<f64> = sorted.into_iter().filter(|v| *v >= lower && *v <= upper).collect();
    if kept.is_empty() {
        return None;
    }
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Tunables of one forecast cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastSettings {
    pub order: ModelOrder,
    pub horizon: usize,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub trim_percentiles: (f64, f64),
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self::from(&ConductorConfig::default())
    }
}

impl From<&ConductorConfig> for ForecastSettings {
    fn from(config: &ConductorConfig) -> Self {
        Self {
            order: config.model_order,
            horizon: config.forecast_horizon,
            upper_threshold: config.upper_threshold,
            lower_threshold: config.lower_threshold,
            trim_percentiles: config.trim_percentiles,
        }
    }
}

/// Result of evaluating one history window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastOutcome {
    pub forecast_mean: f64,
    pub baseline: f64,
    pub delta: f64,
    pub trend: Trend,
}

/// Fit, forecast and classify a history window.
pub fn evaluate(series: &[f64], settings: &ForecastSettings) -> Result<ForecastOutcome, ForecastError> {
    let model = ArmaModel::fit(series, settings.order)?;
    let forecast = model.forecast(settings.horizon)?;
    if forecast.is_empty() {
        return Err(ForecastError::InsufficientData { have: 0, need: 1 });
    }
    let forecast_mean = forecast.iter().sum::<f64>() / forecast.len() as f64;

    let (low, high) = settings.trim_percentiles;
    let baseline = trimmed_mean(series, low, high).ok_or(ForecastError::NonFinite)?;

    let delta = forecast_mean - baseline;
    if !delta.is_finite() {
        return Err(ForecastError::NonFinite);
    }

    Ok(ForecastOutcome {
        forecast_mean,
        baseline,
        delta,
        trend: classify(delta, settings.upper_threshold, settings.lower_threshold),
    })
}

/// What a forecaster cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    /// The window could not be evaluated; nothing changed
    Skipped(ForecastError),
    /// Evaluated; `transition` holds the newly published level, if any
    Evaluated {
        outcome: ForecastOutcome,
        transition: Option<MeditationLevel>,
    },
}

/// Periodic worker that turns the alpha trend into level transitions.
pub struct TrendForecaster {
    machine: StateMachine,
    settings: ForecastSettings,
}

impl TrendForecaster {
    pub fn new(machine: StateMachine, settings: ForecastSettings) -> Self {
        Self { machine, settings }
    }

    pub fn settings(&self) -> &ForecastSettings {
        &self.settings
    }

    /// Run one cycle against the current history snapshot.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let state = self.machine.state();
        let series = state.history_snapshot();

        let outcome = match evaluate(&series, &self.settings) {
            Ok(outcome) => outcome,
            Err(e @ ForecastError::InsufficientData { .. }) => {
                log::info!("Skipping state evaluation: {}", e);
                return CycleReport::Skipped(e);
            }
            Err(e) => {
                log::warn!("Skipping state evaluation, model fit failed: {}", e);
                return CycleReport::Skipped(e);
            }
        };

        log::debug!(
            "Forecast mean {:.4}, baseline {:.4}, delta {:+.4} -> {:?}",
            outcome.forecast_mean,
            outcome.baseline,
            outcome.delta,
            outcome.trend
        );

        let transition = self.machine.apply_trend(outcome.trend, now);
        state.reset_blink();

        CycleReport::Evaluated { outcome, transition }
    }

    pub fn spawn(self, period: Duration, shutdown: ShutdownListener) -> JoinHandle<()> {
        spawn_periodic("forecaster", period, shutdown, move || {
            self.run_cycle(Utc::now());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::state::SessionState;
    use crate::types::TransitionSource;
    use std::sync::Arc;

    fn noisy(rng: &mut fastrand::Rng, base: f64, amplitude: f64) -> f64 {
        base + (rng.f64() - 0.5) * amplitude
    }

    fn step_series(before: f64, after: f64, seed: u64) -> Vec<f64> {
        let mut rng = fastrand::Rng::with_seed(seed);
        (0..300)
            .map(|i| {
                let base = if i < 240 { before } else { after };
                noisy(&mut rng, base, 0.02)
            })
            .collect()
    }

    fn forecaster(level: i64) -> (TrendForecaster, BroadcastBus, Arc<SessionState>, DateTime<Utc>) {
        let t0 = Utc::now();
        let bus = BroadcastBus::new(16);
        let state = Arc::new(SessionState::new(300, t0));
        let machine = StateMachine::new(state.clone(), Arc::new(bus.clone()));
        machine.set_level(level, TransitionSource::Manual, t0);
        (TrendForecaster::new(machine, ForecastSettings::default()), bus, state, t0)
    }

    #[test]
    fn classify_uses_two_thresholds() {
        assert_eq!(classify(0.011, 0.01, -0.03), Trend::Rising);
        assert_eq!(classify(0.01, 0.01, -0.03), Trend::Flat);
        assert_eq!(classify(-0.02, 0.01, -0.03), Trend::Flat);
        assert_eq!(classify(-0.031, 0.01, -0.03), Trend::Falling);
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 50.0), Some(2.5));
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 100.0), Some(4.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn trimmed_mean_drops_tails() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let mean = trimmed_mean(&values, 5.0, 95.0).unwrap();
        assert!((mean - 50.5).abs() < 1e-9);

        let mut spiky = vec![1.0; 98];
        spiky.push(1_000.0);
        spiky.push(-1_000.0);
        assert!((trimmed_mean(&spiky, 5.0, 95.0).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn default_order_needs_32_samples() {
        assert_eq!(ArmaModel::min_samples(ModelOrder::default()), 32);
        let short = vec![0.5; 31];
        assert_eq!(
            ArmaModel::fit(&short, ModelOrder::default()).unwrap_err(),
            ForecastError::InsufficientData { have: 31, need: 32 }
        );
    }

    #[test]
    fn constant_series_is_singular() {
        let flat = vec![0.7; 300];
        assert_eq!(ArmaModel::fit(&flat, ModelOrder::default()).unwrap_err(), ForecastError::Singular);
    }

    #[test]
    fn recovers_ar1_coefficient() {
        let mut rng = fastrand::Rng::with_seed(7);
        let mut series = vec![0.0_f64];
        for _ in 0..3_000 {
            let prev = *series.last().unwrap();
            series.push(0.8 * prev + (rng.f64() - 0.5));
        }
        let order = ModelOrder { p: 1, d: 0, q: 0 };
        let model = ArmaModel::fit(&series, order).unwrap();
        assert!((model.ar_coefficients()[0] - 0.8).abs() < 0.05, "{:?}", model.ar_coefficients());
        assert!(model.ma_coefficients().is_empty());
    }

    #[test]
    fn recovers_arma11_coefficients() {
        let mut rng = fastrand::Rng::with_seed(11);
        let mut series = vec![0.0_f64];
        let mut prev_noise = 0.0;
        for _ in 0..5_000 {
            let noise = rng.f64() - 0.5;
            let prev = *series.last().unwrap();
            series.push(0.6 * prev + noise + 0.4 * prev_noise);
            prev_noise = noise;
        }
        let order = ModelOrder { p: 1, d: 0, q: 1 };
        let model = ArmaModel::fit(&series, order).unwrap();
        assert!((model.ar_coefficients()[0] - 0.6).abs() < 0.1, "{:?}", model.ar_coefficients());
        assert!((model.ma_coefficients()[0] - 0.4).abs() < 0.1, "{:?}", model.ma_coefficients());
    }

    #[test]
    fn default_order_has_four_ar_and_one_ma_term() {
        let model = ArmaModel::fit(&step_series(0.5, 0.5, 9), ModelOrder::default()).unwrap();
        assert_eq!(model.order(), ModelOrder::default());
        assert!((model.mean() - 0.5).abs() < 0.01, "mean {}", model.mean());
        assert_eq!(model.ar_coefficients().len(), 4);
        assert_eq!(model.ma_coefficients().len(), 1);
    }

    #[test]
    fn forecast_stays_within_widened_observed_range() {
        // Strongly trending window; an unconstrained AR extrapolation keeps climbing.
        let series: Vec<f64> = (0..300).map(|i| f64::from(i) * 0.01).collect();
        let model = ArmaModel::fit(&series, ModelOrder { p: 1, d: 0, q: 0 }).unwrap();
        let forecast = model.forecast(200).unwrap();

        // Observed span is [0, 2.99]; a quarter of it widens each side.
        let margin = 2.99 * 0.25;
        assert!(forecast.iter().all(|v| *v >= -margin - 1e-9 && *v <= 2.99 + margin + 1e-9));
    }

    #[test]
    fn forecast_has_horizon_length_and_is_finite() {
        let series = step_series(0.5, 0.5, 1);
        let model = ArmaModel::fit(&series, ModelOrder::default()).unwrap();
        let forecast = model.forecast(20).unwrap();
        assert_eq!(forecast.len(), 20);
        assert!(forecast.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn step_up_is_rising() {
        let outcome = evaluate(&step_series(0.5, 0.8, 2), &ForecastSettings::default()).unwrap();
        assert!(outcome.delta > 0.01, "delta {}", outcome.delta);
        assert_eq!(outcome.trend, Trend::Rising);
    }

    #[test]
    fn step_down_is_falling() {
        let outcome = evaluate(&step_series(0.5, 0.2, 3), &ForecastSettings::default()).unwrap();
        assert!(outcome.delta < -0.03, "delta {}", outcome.delta);
        assert_eq!(outcome.trend, Trend::Falling);
    }

    #[test]
    fn stationary_noise_is_flat() {
        let mut rng = fastrand::Rng::with_seed(4);
        let series: Vec<f64> = (0..300).map(|_| noisy(&mut rng, 0.5, 0.002)).collect();
        let outcome = evaluate(&series, &ForecastSettings::default()).unwrap();
        assert_eq!(outcome.trend, Trend::Flat, "delta {}", outcome.delta);
    }

    #[test]
    fn cycle_skips_on_short_history() {
        let (forecaster, bus, state, t0) = forecaster(3);
        let mut rx = bus.subscribe_state();
        for v in 0..10 {
            state.push_alpha(f64::from(v));
        }

        let report = forecaster.run_cycle(t0 + chrono::Duration::seconds(60));
        assert!(matches!(report, CycleReport::Skipped(ForecastError::InsufficientData { .. })));
        assert_eq!(state.level().get(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cycle_advances_once_and_resets_blinks() {
        let (forecaster, bus, state, t0) = forecaster(1);
        let mut rx = bus.subscribe_state();
        for v in step_series(0.5, 0.8, 5) {
            state.push_alpha(v);
        }
        state.increment_blink();
        let now = t0 + chrono::Duration::seconds(60);

        match forecaster.run_cycle(now) {
            CycleReport::Evaluated { transition, .. } => assert_eq!(transition, MeditationLevel::new(2)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.level_record().last_published, now);
        assert_eq!(state.blink_count(), 0);
        assert_eq!(rx.try_recv().unwrap().level.get(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cycle_holds_at_ceiling() {
        let (forecaster, _, state, t0) = forecaster(5);
        for v in step_series(0.5, 0.8, 6) {
            state.push_alpha(v);
        }
        match forecaster.run_cycle(t0) {
            CycleReport::Evaluated { outcome, transition } => {
                assert_eq!(outcome.trend, Trend::Rising);
                assert_eq!(transition, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.level().get(), 5);
    }

    #[test]
    fn cycle_steps_down_on_falling_trend() {
        let (forecaster, _, state, t0) = forecaster(3);
        for v in step_series(0.5, 0.2, 8) {
            state.push_alpha(v);
        }
        forecaster.run_cycle(t0);
        assert_eq!(state.level().get(), 2);
    }
}
