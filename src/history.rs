use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use crate::challenge::Difficulty;
use crate::error::{io_context, ForgeError};
use crate::lock;
use crate::logger::Logger;
use crate::review::{DimensionScores, DIMENSIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Completion {
    Completed,
    Abandoned,
}

/// One line of `history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct HistoryRecord {
    pub(crate) challenge_id: String,
    pub(crate) title: String,
    pub(crate) difficulty: Difficulty,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) completed_at: DateTime<Utc>,
    pub(crate) elapsed_minutes: f64,
    pub(crate) hints_consumed: u32,
    #[serde(default)]
    pub(crate) scores: Option<DimensionScores>,
    pub(crate) penalty: f64,
    #[serde(default)]
    pub(crate) final_score: Option<f64>,
    #[serde(default)]
    pub(crate) test_passed: Option<bool>,
    pub(crate) completion: Completion,
}

/// Appends one record under `history.lock`; earlier lines are never touched.
pub(crate) fn append(
    history_path: &Path,
    lock_path: &Path,
    record: &HistoryRecord,
    lock_timeout: Duration,
    logger: &Logger,
) -> Result<(), ForgeError> {
    let _guard = lock::acquire(lock_path, "history", lock_timeout, logger)?;
    let mut line = serde_json::to_string(record).map_err(|err| ForgeError::Io {
        context: "Failed to serialize history record".to_string(),
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(history_path)
        .map_err(io_context(format!("Failed to open {}", history_path.display())))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(io_context(format!("Failed to append to {}", history_path.display())))?;
    logger.log(&format!(
        "history append challenge={} completion={:?}",
        record.challenge_id, record.completion
    ));
    Ok(())
}

#[derive(Debug, Default)]
pub(crate) struct HistoryLog {
    pub(crate) records: Vec<HistoryRecord>,
    pub(crate) skipped_lines: Vec<usize>,
}

/// Reads every parseable record in append order; malformed lines are reported
/// by line number and skipped.
pub(crate) fn read_all(history_path: &Path) -> Result<HistoryLog, ForgeError> {
    let content = match fs::read_to_string(history_path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HistoryLog::default()),
        Err(err) => {
            return Err(ForgeError::Io {
                context: format!("Failed to read {}", history_path.display()),
                source: err,
            })
        }
    };
    let mut log = HistoryLog::default();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryRecord>(line) {
            Ok(record) => log.records.push(record),
            Err(_) => log.skipped_lines.push(index + 1),
        }
    }
    Ok(log)
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StatsFilter {
    pub(crate) difficulty: Option<Difficulty>,
    pub(crate) last: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DifficultyStats {
    pub(crate) attempted: usize,
    pub(crate) completed: usize,
    pub(crate) completion_rate: f64,
    pub(crate) mean_final: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Level {
    pub(crate) rank: u8,
    pub(crate) title: &'static str,
    pub(crate) min_completed: usize,
    pub(crate) min_mean_final: f64,
    pub(crate) min_hard: usize,
}

pub(crate) const LEVELS: [Level; 5] = [
    Level { rank: 1, title: "Novice", min_completed: 1, min_mean_final: 0.0, min_hard: 0 },
    Level { rank: 2, title: "Apprentice", min_completed: 5, min_mean_final: 5.0, min_hard: 0 },
    Level { rank: 3, title: "Journeyman", min_completed: 10, min_mean_final: 6.0, min_hard: 0 },
    Level { rank: 4, title: "Craftsman", min_completed: 15, min_mean_final: 7.0, min_hard: 1 },
    Level { rank: 5, title: "Master", min_completed: 18, min_mean_final: 8.0, min_hard: 3 },
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Trend {
    Improving(f64),
    Declining(f64),
    Steady,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statistics {
    pub(crate) count: usize,
    pub(crate) completed: usize,
    pub(crate) abandoned: usize,
    pub(crate) mean_scores: Vec<(&'static str, f64)>,
    pub(crate) mean_final: Option<f64>,
    pub(crate) total_hints: u32,
    pub(crate) mean_elapsed_minutes: Option<f64>,
    pub(crate) by_difficulty: BTreeMap<Difficulty, DifficultyStats>,
    pub(crate) weakest_dimension: Option<(&'static str, f64)>,
    pub(crate) trend: Option<Trend>,
    pub(crate) level: Level,
    pub(crate) next_level: Option<Level>,
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), value| (sum + value, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Derives statistics from the records; nothing is cached between calls.
pub(crate) fn aggregate(records: &[HistoryRecord], filter: &StatsFilter) -> Statistics {
    let mut selected: Vec<&HistoryRecord> = records
        .iter()
        .filter(|record| filter.difficulty.map_or(true, |wanted| record.difficulty == wanted))
        .collect();
    if let Some(last) = filter.last {
        let skip = selected.len().saturating_sub(last);
        selected.drain(..skip);
    }

    let completed: Vec<&HistoryRecord> = selected
        .iter()
        .copied()
        .filter(|record| record.completion == Completion::Completed)
        .collect();
    let scored: Vec<(&DimensionScores, f64)> = completed
        .iter()
        .filter_map(|record| Some((record.scores.as_ref()?, record.final_score?)))
        .collect();

    let mean_scores: Vec<(&'static str, f64)> = DIMENSIONS
        .iter()
        .enumerate()
        .filter_map(|(index, name)| {
            mean(scored.iter().map(|(scores, _)| f64::from(scores.values()[index])))
                .map(|value| (*name, value))
        })
        .collect();
    let weakest_dimension = mean_scores
        .iter()
        .copied()
        .min_by(|a, b| a.1.total_cmp(&b.1));
    let finals: Vec<f64> = scored.iter().map(|(_, final_score)| *final_score).collect();
    let mean_final = mean(finals.iter().copied());

    let trend = (finals.len() >= 3).then(|| {
        let first = mean(finals[..3].iter().copied()).unwrap_or(0.0);
        let recent = mean(finals[finals.len() - 3..].iter().copied()).unwrap_or(0.0);
        let delta = recent - first;
        if delta > 0.05 {
            Trend::Improving(delta)
        } else if delta < -0.05 {
            Trend::Declining(-delta)
        } else {
            Trend::Steady
        }
    });

    let mut by_difficulty = BTreeMap::new();
    for difficulty in Difficulty::ALL {
        let attempted: Vec<&HistoryRecord> = selected
            .iter()
            .copied()
            .filter(|record| record.difficulty == difficulty)
            .collect();
        if attempted.is_empty() {
            continue;
        }
        let done: Vec<&HistoryRecord> = attempted
            .iter()
            .copied()
            .filter(|record| record.completion == Completion::Completed)
            .collect();
        by_difficulty.insert(
            difficulty,
            DifficultyStats {
                attempted: attempted.len(),
                completed: done.len(),
                completion_rate: done.len() as f64 / attempted.len() as f64,
                mean_final: mean(done.iter().filter_map(|record| record.final_score)),
            },
        );
    }

    let hard_completed = completed
        .iter()
        .filter(|record| record.difficulty == Difficulty::Hard)
        .count();
    let level_mean = mean_final.unwrap_or(0.0);
    let level = LEVELS
        .iter()
        .copied()
        .filter(|level| {
            completed.len() >= level.min_completed
                && level_mean >= level.min_mean_final
                && hard_completed >= level.min_hard
        })
        .last()
        .unwrap_or(LEVELS[0]);
    let next_level = LEVELS.iter().copied().find(|next| next.rank == level.rank + 1);

    Statistics {
        count: selected.len(),
        completed: completed.len(),
        abandoned: selected.len() - completed.len(),
        mean_scores,
        mean_final,
        total_hints: selected.iter().map(|record| record.hints_consumed).sum(),
        mean_elapsed_minutes: mean(completed.iter().map(|record| record.elapsed_minutes)),
        by_difficulty,
        weakest_dimension,
        trend,
        level,
        next_level,
    }
}
