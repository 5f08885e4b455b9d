//! Relative-importance strategy.
//!
//! Every request on a path becomes one row: the elapsed time of each call
//! plus the total response time. After each period-sized bucket the engine
//! fits `lm(Total ~ .)` over all rows so far and decomposes R² with the
//! LMG metric (`relaimpo`). What the calls do not explain is `LOCAL`.
//! The sequence of score vectors is the importance trend; a rising level
//! shift in it after the anomaly started dates the root cause.

use std::cmp::Ordering;

use roots_core::model::LOCAL_CALL;
use roots_core::ApplicationRequest;
use roots_stats::{PooledSession, StatsError, StatsPool};

use crate::changepoint::ChangePointDetector;
use crate::error::AnalysisError;

#[derive(Debug, Clone, PartialEq)]
pub struct RelativeImportance {
    pub call: String,
    pub importance: f64,
    /// 1 is the most important.
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RootCause {
    pub call: String,
    /// Start of the bucket where the call's importance rose the most.
    /// `None` when no call shows a rising shift.
    pub onset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportanceOutcome {
    /// The path makes no API calls, so there is nothing to rank.
    NoCalls,
    InsufficientData { rows: usize, required: usize },
    Ranked {
        /// Bucket start and the scores computed over all rows up to it.
        trend: Vec<(i64, Vec<RelativeImportance>)>,
        root_cause: RootCause,
    },
}

impl ImportanceOutcome {
    /// Scores of the last bucket, in call order with `LOCAL` last.
    pub fn latest(&self) -> Option<&[RelativeImportance]> {
        match self {
            Self::Ranked { trend, .. } => trend.last().map(|(_, r)| r.as_slice()),
            _ => None,
        }
    }
}

pub struct RelativeImportanceFinder {
    stats: StatsPool,
    pelt_penalty: f64,
}

impl RelativeImportanceFinder {
    pub fn new(stats: StatsPool, pelt_penalty: f64) -> Result<Self, AnalysisError> {
        if !(pelt_penalty.is_finite() && pelt_penalty >= 0.0) {
            return Err(AnalysisError::Invalid(format!(
                "PELT penalty must be a non-negative number, got {pelt_penalty}"
            )));
        }
        Ok(Self { stats, pelt_penalty })
    }

    /// `requests` all took `path`, are time ordered and start at or after
    /// `window_start`. Buckets are `period_ms` wide, aligned to `window_start`.
    pub async fn analyze_path(
        &self,
        path: &str,
        requests: &[ApplicationRequest],
        window_start: i64,
        anomaly_start: i64,
        period_ms: i64,
    ) -> Result<ImportanceOutcome, AnalysisError> {
        let Some(first) = requests.first() else {
            return Ok(ImportanceOutcome::NoCalls);
        };
        let calls: Vec<String> = first.api_calls.iter().map(|c| c.name()).collect();
        if calls.is_empty() {
            return Ok(ImportanceOutcome::NoCalls);
        }
        let required = calls.len() + 2;
        if requests.len() < required {
            tracing::warn!(
                path,
                rows = requests.len(),
                required,
                "insufficient data to perform a bottleneck identification"
            );
            return Ok(ImportanceOutcome::InsufficientData {
                rows: requests.len(),
                required,
            });
        }

        let buckets = bucket(requests, window_start, period_ms.max(1));
        let trend = self.rank_buckets(&calls, &buckets).await?;
        let Some((_, latest)) = trend.last() else {
            return Ok(ImportanceOutcome::InsufficientData {
                rows: requests.len(),
                required,
            });
        };
        tracing::info!(
            path,
            rankings = %format_rankings(latest),
            variance_explained = latest
                .iter()
                .filter(|r| r.call != LOCAL_CALL)
                .map(|r| r.importance)
                .sum::<f64>(),
            "relative importance metrics"
        );
        for (index, call) in calls.iter().enumerate() {
            let history: Vec<String> = trend
                .iter()
                .map(|(_, scores)| format!("{:.4}", scores[index].importance))
                .collect();
            tracing::info!(path, call = %call, trend = %history.join(", "), "historical importance trend");
        }

        let root_cause = self.root_cause(&trend, anomaly_start).await?;
        tracing::info!(
            path,
            call = %root_cause.call,
            onset = ?root_cause.onset,
            "root cause identified"
        );
        Ok(ImportanceOutcome::Ranked { trend, root_cause })
    }

    /// Score vectors for every bucket once the cumulative row count reaches
    /// `calls + 2`. A bucket whose fit fails is skipped; only when every fit
    /// fails is the last error returned.
    async fn rank_buckets(
        &self,
        calls: &[String],
        buckets: &[(i64, Vec<&ApplicationRequest>)],
    ) -> Result<Vec<(i64, Vec<RelativeImportance>)>, StatsError> {
        let width = calls.len() + 1;
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); width];
        let mut trend = Vec::new();
        let mut last_error = None;
        let mut session = self.stats.borrow().await?;

        for (timestamp, requests) in buckets {
            for request in requests {
                let row = request
                    .api_calls
                    .iter()
                    .map(|c| c.elapsed_ms as f64)
                    .chain(std::iter::once(request.response_time_ms as f64));
                for (column, value) in columns.iter_mut().zip(row) {
                    column.push(value);
                }
            }
            if columns[0].len() < calls.len() + 2 {
                continue;
            }
            match lmg_scores(&mut session, &columns).await {
                Ok(scores) => trend.push((*timestamp, rank(calls, &scores))),
                Err(e) => {
                    tracing::debug!(timestamp, "relative importance fit failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        session.close().await?;

        match last_error {
            Some(e) if trend.is_empty() => Err(e),
            _ => Ok(trend),
        }
    }

    /// Walk the calls in rank order of the latest bucket and return the
    /// first one whose post-anomaly importance shifts upwards.
    async fn root_cause(
        &self,
        trend: &[(i64, Vec<RelativeImportance>)],
        anomaly_start: i64,
    ) -> Result<RootCause, StatsError> {
        let latest = trend.last().map(|(_, r)| r.as_slice()).unwrap_or_default();
        let mut by_rank: Vec<usize> = (0..latest.len()).collect();
        by_rank.sort_by_key(|&i| latest[i].rank);

        let offset = trend.iter().filter(|(ts, _)| *ts < anomaly_start).count();
        let detector = ChangePointDetector::pelt_with_penalty(self.pelt_penalty);
        for &index in &by_rank {
            let call = &latest[index].call;
            let series: Vec<f64> = trend[offset..]
                .iter()
                .map(|(_, scores)| scores[index].importance)
                .collect();
            let segments = detector.segments(&self.stats, &series).await?;
            if segments.len() <= 1 {
                tracing::info!(call = %call, "no significant change in relative importance");
                continue;
            }

            let mut onset = None;
            let mut max_rise = 0.0;
            for pair in segments.windows(2) {
                let at = trend[offset + pair[1].start].0;
                tracing::info!(
                    call = %call,
                    at,
                    from = pair[0].mean,
                    to = pair[1].mean,
                    "relative importance level shift"
                );
                let rise = pair[1].mean - pair[0].mean;
                if rise > max_rise {
                    max_rise = rise;
                    onset = Some(at);
                }
            }
            if let (Some(first), Some(last)) = (segments.first(), segments.last()) {
                tracing::info!(
                    call = %call,
                    from = first.mean,
                    to = last.mean,
                    change_pct = first.percentage_increase(last),
                    "net change in relative importance"
                );
            }
            if onset.is_some() {
                return Ok(RootCause {
                    call: call.clone(),
                    onset,
                });
            }
        }

        Ok(RootCause {
            call: by_rank
                .first()
                .map(|&i| latest[i].call.clone())
                .unwrap_or_else(|| LOCAL_CALL.to_string()),
            onset: None,
        })
    }
}

/// Group requests into `period_ms` buckets keyed by bucket start.
fn bucket(
    requests: &[ApplicationRequest],
    window_start: i64,
    period_ms: i64,
) -> Vec<(i64, Vec<&ApplicationRequest>)> {
    let mut buckets: Vec<(i64, Vec<&ApplicationRequest>)> = Vec::new();
    for request in requests {
        let key = (request.timestamp - window_start).div_euclid(period_ms) * period_ms + window_start;
        match buckets.last_mut() {
            Some((ts, group)) if *ts == key => group.push(request),
            _ => buckets.push((key, vec![request])),
        }
    }
    buckets
}

/// Fit the model over `columns` (calls, then total) and return one LMG
/// score per call.
async fn lmg_scores(session: &mut PooledSession, columns: &[Vec<f64>]) -> Result<Vec<f64>, StatsError> {
    let calls = columns.len() - 1;
    let mut names = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let name = if i == calls {
            "Total".to_string()
        } else {
            format!("X{}", i + 1)
        };
        session.assign_doubles(&name, column).await?;
        names.push(name);
    }
    session
        .eval_and_assign("df", &format!("data.frame({})", names.join(", ")))
        .await?;
    session.eval_and_assign("model", "lm(Total ~ ., data=df)").await?;
    session
        .eval_and_assign("rankings", "calc.relimp(model, type=c('lmg'))")
        .await?;
    let scores = session.eval_doubles("rankings$lmg").await?;
    if scores.len() != calls {
        return Err(StatsError::Evaluation {
            expression: "rankings$lmg".to_string(),
            message: format!("expected {calls} scores, got {}", scores.len()),
        });
    }
    Ok(scores)
}

/// Attach names and ranks; `LOCAL` takes the unexplained remainder.
fn rank(calls: &[String], scores: &[f64]) -> Vec<RelativeImportance> {
    let local = 1.0 - scores.iter().sum::<f64>();
    let mut result: Vec<RelativeImportance> = calls
        .iter()
        .cloned()
        .chain(std::iter::once(LOCAL_CALL.to_string()))
        .zip(scores.iter().copied().chain(std::iter::once(local)))
        .map(|(call, importance)| RelativeImportance {
            call,
            importance,
            rank: 0,
        })
        .collect();
    let mut order: Vec<usize> = (0..result.len()).collect();
    order.sort_by(|&a, &b| {
        result[b]
            .importance
            .partial_cmp(&result[a].importance)
            .unwrap_or(Ordering::Equal)
    });
    for (position, index) in order.into_iter().enumerate() {
        result[index].rank = position + 1;
    }
    result
}

fn format_rankings(scores: &[RelativeImportance]) -> String {
    let mut sorted: Vec<&RelativeImportance> = scores.iter().collect();
    sorted.sort_by_key(|r| r.rank);
    sorted
        .iter()
        .map(|r| format!("[{}] {} {:.6}", r.rank, r.call, r.importance))
        .collect::<Vec<_>>()
        .join("; ")
}
