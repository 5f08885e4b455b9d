//! The telemetry query contract.
//!
//! Timestamps are epoch milliseconds; windows are `[start, end)` with
//! `start <= end`. Results are all-or-nothing: a failed query returns an
//! error, never a partial map.

use std::collections::BTreeMap;

use async_trait::async_trait;
use roots_core::{ApplicationRequest, BenchmarkResult, ResponseTimeSummary};

use crate::error::DataStoreError;

pub type SummaryMap = BTreeMap<String, ResponseTimeSummary>;
pub type HistoryMap = BTreeMap<String, Vec<ResponseTimeSummary>>;
pub type BenchmarkMap = BTreeMap<String, Vec<BenchmarkResult>>;
pub type RequestMap = BTreeMap<String, Vec<ApplicationRequest>>;

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Mean response time and request count per request type (`"METHOD path"`).
    async fn response_time_summary(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<SummaryMap, DataStoreError>;

    /// Per request type, one summary per `period_ms` bucket that saw traffic.
    async fn response_time_history(
        &self,
        application: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<HistoryMap, DataStoreError>;

    /// Raw benchmark samples per request type, in time order.
    async fn benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<BenchmarkMap, DataStoreError>;

    /// Request count for one operation in each `period_ms` bucket.
    async fn workload_summary(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<Vec<f64>, DataStoreError>;

    /// Traced requests per operation, time-ordered and unique by request id.
    async fn request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<RequestMap, DataStoreError>;

    /// Traced requests for one operation, time-ordered and unique by request id.
    async fn operation_request_info(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ApplicationRequest>, DataStoreError>;

    async fn record_benchmark_result(&self, _result: &BenchmarkResult) -> Result<(), DataStoreError> {
        Err(DataStoreError::Unsupported {
            store: std::any::type_name::<Self>(),
            operation: "record_benchmark_result",
        })
    }

    /// Release connections. Called once when the environment shuts down.
    async fn destroy(&self) {}
}

pub(crate) fn check_window(start: i64, end: i64) -> Result<(), DataStoreError> {
    if start > end {
        return Err(DataStoreError::InvalidQuery(format!(
            "window start {start} is after end {end}"
        )));
    }
    Ok(())
}

pub(crate) fn check_period(period_ms: i64) -> Result<(), DataStoreError> {
    if period_ms <= 0 {
        return Err(DataStoreError::InvalidQuery(format!(
            "period must be positive, got {period_ms}"
        )));
    }
    Ok(())
}
