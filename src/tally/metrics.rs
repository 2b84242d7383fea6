/// Stage timings for resyncs, aggregation and flushes
use chrono::{DateTime, Utc};
use instant::Instant;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage: EngineStage,
    pub duration_ms: u64,
    pub rows_processed: Option<u64>,
    pub succeeded: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineStage {
    Resync,
    Aggregate,
    Flush,
}

impl std::fmt::Display for EngineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineStage::Resync => write!(f, "resync"),
            EngineStage::Aggregate => write!(f, "aggregate"),
            EngineStage::Flush => write!(f, "flush"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub runs: u64,
    pub failures: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub rows: u64,
}

pub struct MetricsCollector {
    stage_timers: HashMap<String, Instant>,
    history: VecDeque<StageMetrics>,
    capacity: usize,
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            stage_timers: HashMap::new(),
            history: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Start timing a stage
    pub fn start_stage(&mut self, stage_key: &str) {
        self.stage_timers
            .insert(stage_key.to_string(), Instant::now());
    }

    /// End timing a stage and record metrics
    pub fn end_stage(
        &mut self,
        stage_key: &str,
        stage: EngineStage,
        rows_processed: Option<u64>,
        succeeded: bool,
    ) -> StageMetrics {
        let duration = self
            .stage_timers
            .remove(stage_key)
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let metrics = StageMetrics {
            stage,
            duration_ms: duration,
            rows_processed,
            succeeded,
            timestamp: Utc::now(),
        };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(metrics.clone());
        metrics
    }

    pub fn history(&self) -> impl Iterator<Item = &StageMetrics> {
        self.history.iter()
    }

    pub fn summary(&self, stage: EngineStage) -> StageSummary {
        self.history
            .iter()
            .filter(|m| m.stage == stage)
            .fold(StageSummary::default(), |mut acc, m| {
                acc.runs += 1;
                if !m.succeeded {
                    acc.failures += 1;
                }
                acc.total_ms += m.duration_ms;
                acc.max_ms = acc.max_ms.max(m.duration_ms);
                acc.rows += m.rows_processed.unwrap_or(0);
                acc
            })
    }

    /// Print performance summary
    pub fn print_summary(&self) {
        use colored::*;

        println!("\n{}", "📊 Engine Performance Summary".bright_cyan().bold());
        println!("{}", "=".repeat(50).bright_cyan());

        for stage in [EngineStage::Resync, EngineStage::Aggregate, EngineStage::Flush] {
            let summary = self.summary(stage);
            if summary.runs == 0 {
                continue;
            }

            let stage_color = match stage {
                EngineStage::Resync => "yellow",
                EngineStage::Aggregate => "blue",
                EngineStage::Flush => "green",
            };
            let average = summary.total_ms as f64 / summary.runs as f64;

            println!(
                "{}: {} runs, {:.1} ms avg, {} ms max, {} rows{}",
                stage.to_string().color(stage_color),
                summary.runs.to_string().bright_white(),
                average,
                summary.max_ms,
                summary.rows.to_string().bright_yellow(),
                if summary.failures > 0 {
                    format!(" ({} failed)", summary.failures.to_string().bright_red())
                } else {
                    String::new()
                }
            );
        }

        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut metrics = MetricsCollector::new(2);
        for _ in 0..5 {
            metrics.start_stage("resync");
            metrics.end_stage("resync", EngineStage::Resync, Some(3), true);
        }
        assert_eq!(metrics.history().count(), 2);
        assert_eq!(metrics.summary(EngineStage::Resync).rows, 6);
    }

    #[test]
    fn summary_separates_stages_and_failures() {
        let mut metrics = MetricsCollector::new(10);
        metrics.end_stage("flush", EngineStage::Flush, Some(20), true);
        metrics.end_stage("flush", EngineStage::Flush, None, false);
        metrics.end_stage("resync", EngineStage::Resync, Some(1), true);

        let flush = metrics.summary(EngineStage::Flush);
        assert_eq!(flush.runs, 2);
        assert_eq!(flush.failures, 1);
        assert_eq!(flush.rows, 20);
        assert_eq!(metrics.summary(EngineStage::Aggregate).runs, 0);
    }
}
