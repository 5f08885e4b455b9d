//! Change point detection on the statistics engine.
//!
//! `PELT` and `BinSeg` run `cpt.mean` from the `changepoint` package; `CL`
//! runs the Chen-Liu level-shift search of `tsoutliers`. Either way the
//! result is normalized to 0-based indices of the last element of each
//! segment, which is what [`Segment::split`] takes.

use std::fmt;
use std::str::FromStr;

use roots_core::Segment;
use roots_stats::{PooledSession, StatsError, StatsPool};
use serde::Deserialize;

use crate::error::AnalysisError;

/// Detector property selecting the method for one application.
pub const WORKLOAD_ANALYZER: &str = "workload.analyzer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ChangePointMethod {
    #[default]
    #[serde(rename = "PELT")]
    Pelt,
    #[serde(rename = "BinSeg")]
    BinSeg,
    #[serde(rename = "CL")]
    ChenLiu,
}

impl FromStr for ChangePointMethod {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PELT" => Ok(Self::Pelt),
            "BinSeg" => Ok(Self::BinSeg),
            "CL" => Ok(Self::ChenLiu),
            other => Err(AnalysisError::UnknownChangePointMethod(other.to_string())),
        }
    }
}

impl fmt::Display for ChangePointMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pelt => "PELT",
            Self::BinSeg => "BinSeg",
            Self::ChenLiu => "CL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangePointDetector {
    method: ChangePointMethod,
    penalty: Option<f64>,
}

impl ChangePointDetector {
    pub fn new(method: ChangePointMethod) -> Self {
        Self {
            method,
            penalty: None,
        }
    }

    /// PELT with a manual penalty instead of the package default (MBIC).
    pub fn pelt_with_penalty(penalty: f64) -> Self {
        Self {
            method: ChangePointMethod::Pelt,
            penalty: Some(penalty),
        }
    }

    pub fn method(&self) -> ChangePointMethod {
        self.method
    }

    fn cpt_mean_expression(&self) -> String {
        let method = match self.method {
            ChangePointMethod::BinSeg => "BinSeg",
            _ => "PELT",
        };
        match self.penalty {
            Some(p) => format!("cpt.mean(x, method='{method}', penalty='Manual', pen.value={p})"),
            None => format!("cpt.mean(x, method='{method}')"),
        }
    }

    /// Change points of `data`, sorted and deduplicated.
    pub async fn change_points(
        &self,
        session: &mut PooledSession,
        data: &[f64],
    ) -> Result<Vec<usize>, StatsError> {
        session.assign_doubles("x", data).await?;
        let mut points: Vec<usize> = match self.method {
            ChangePointMethod::Pelt | ChangePointMethod::BinSeg => {
                session
                    .eval_and_assign("result", &self.cpt_mean_expression())
                    .await?;
                // 1-based index of the last element before each change.
                session
                    .eval_integers("cpts(result)")
                    .await?
                    .into_iter()
                    .filter(|&i| i >= 1)
                    .map(|i| (i - 1) as usize)
                    .collect()
            }
            ChangePointMethod::ChenLiu => {
                session.eval_and_assign("x_ts", "ts(x)").await?;
                session
                    .eval_and_assign("result", "tso(x_ts, types=c('LS'))")
                    .await?;
                // 1-based index of the first element after each level shift.
                session
                    .eval_integers("result$outliers[,2]")
                    .await?
                    .into_iter()
                    .filter(|&i| i > 1)
                    .map(|i| (i - 2) as usize)
                    .collect()
            }
        };
        points.sort_unstable();
        points.dedup();
        Ok(points)
    }

    /// Split `data` into segments on a borrowed session. Series shorter than
    /// two points are a single segment without a round trip to the engine.
    pub async fn segments(&self, pool: &StatsPool, data: &[f64]) -> Result<Vec<Segment>, StatsError> {
        if data.len() < 2 {
            return Ok(Segment::split(data, &[]));
        }
        let mut session = pool.borrow().await?;
        let points = self.change_points(&mut session, data).await?;
        session.close().await?;
        tracing::debug!(
            method = %self.method,
            points = data.len(),
            change_points = ?points,
            "change point analysis"
        );
        Ok(Segment::split(data, &points))
    }
}
