// Cumulative byte counter fed with absolute totals reported by the engine.
// Deltas are relative to the previous observation and never negative: a total
// that goes backwards is an engine-side reset and contributes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    last: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {

    // Records a new absolute reading, returns the clamped delta.
    pub fn observe(&mut self, current: u64) -> u64 {
        let delta = current.saturating_sub(self.last);
        self.last = current;
        self.round += delta;
        delta
    }

    // Closes the current round, folding it into the moving average.
    pub fn reset(&mut self) {
        self.avg = (self.avg * (5 - 1) as f64 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    // Last absolute reading.
    pub fn last(&self) -> u64 {
        self.last
    }

    // Highest moving average seen at the end of a round.
    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

// Standard deviation over the whole population (divides by n).
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

// Standard deviation of a sample (divides by n - 1), undefined below two values.
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

pub fn min(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

pub fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}
