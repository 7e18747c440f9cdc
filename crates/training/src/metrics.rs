use std::fmt;
use std::time::{Duration, Instant};

/// Which stream a set of metrics belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Test,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Train => "Train",
            Phase::Test => "Test",
        })
    }
}

/// Running loss/accuracy for one phase of one epoch.
#[derive(Debug)]
pub struct RunMetrics {
    phase: Phase,
    epoch: usize,
    loss_sum: f64,
    correct: usize,
    total: usize,
    batches: usize,
    start_time: Instant,
}

impl RunMetrics {
    pub fn new(phase: Phase, epoch: usize) -> Self {
        Self {
            phase,
            epoch,
            loss_sum: 0.0,
            correct: 0,
            total: 0,
            batches: 0,
            start_time: Instant::now(),
        }
    }

    /// Folds one batch in and returns the running figures after it.
    pub fn record(&mut self, batch_loss: f64, correct: usize, examples: usize) -> BatchProgress {
        let batch_index = self.batches;
        self.loss_sum += batch_loss;
        self.correct += correct;
        self.total += examples;
        self.batches += 1;
        BatchProgress {
            phase: self.phase,
            batch_index,
            average_loss: self.average_loss(),
            accuracy: self.accuracy(),
            correct: self.correct,
            total: self.total,
        }
    }

    /// Sum of per-batch mean losses divided by the number of batches.
    pub fn average_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    /// Percentage of correct predictions so far.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.total as f64
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn finalize(self) -> EpochSummary {
        EpochSummary {
            phase: self.phase,
            epoch: self.epoch,
            average_loss: self.average_loss(),
            accuracy: self.accuracy(),
            correct: self.correct,
            total: self.total,
            batches: self.batches,
            wall_time: self.start_time.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchProgress {
    pub phase: Phase,
    pub batch_index: usize,
    pub average_loss: f64,
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
}

impl fmt::Display for BatchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch_idx: {} | {phase} Loss: {:.3} | {phase} Acc: {:.3}% ({}/{})",
            self.batch_index,
            self.average_loss,
            self.accuracy,
            self.correct,
            self.total,
            phase = self.phase
        )
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub phase: Phase,
    pub epoch: usize,
    pub average_loss: f64,
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    pub batches: usize,
    pub wall_time: Duration,
}

impl EpochSummary {
    pub fn images_per_sec(&self) -> f64 {
        let secs = self.wall_time.as_secs_f64();
        if secs > 0.0 {
            self.total as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_averages_follow_batch_counts() {
        let mut metrics = RunMetrics::new(Phase::Train, 0);
        let losses = [2.0, 1.0, 0.6];
        let correct = [3, 5, 8];
        let mut last = None;
        for (k, (loss, hits)) in losses.iter().zip(correct.iter()).enumerate() {
            let progress = metrics.record(*loss, *hits, 8);
            let expected = losses[..=k].iter().sum::<f64>() / (k + 1) as f64;
            assert!((progress.average_loss - expected).abs() < 1e-12);
            let hits_so_far: usize = correct[..=k].iter().sum();
            let expected_acc = 100.0 * hits_so_far as f64 / (8 * (k + 1)) as f64;
            assert!((progress.accuracy - expected_acc).abs() < 1e-12);
            assert_eq!(progress.batch_index, k);
            last = Some(progress);
        }
        let summary = metrics.finalize();
        assert_eq!(summary.correct, 16);
        assert_eq!(summary.total, 24);
        assert_eq!(summary.batches, 3);
        assert!(last.is_some());
    }

    #[test]
    fn partial_final_batch_counts_actual_examples() {
        let mut metrics = RunMetrics::new(Phase::Test, 2);
        metrics.record(1.0, 4, 4);
        let progress = metrics.record(1.0, 0, 2);
        assert_eq!(progress.total, 6);
        assert!((progress.accuracy - 100.0 * 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn progress_line_matches_expected_format() {
        let progress = BatchProgress {
            phase: Phase::Train,
            batch_index: 3,
            average_loss: 1.23456,
            accuracy: 50.0,
            correct: 2,
            total: 4,
        };
        assert_eq!(
            progress.to_string(),
            "Batch_idx: 3 | Train Loss: 1.235 | Train Acc: 50.000% (2/4)"
        );
    }
}
