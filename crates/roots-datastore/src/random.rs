//! Synthetic telemetry: a fixed set of operations with uniformly random
//! response times, counts and call traces.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::Rng;
use roots_core::{ApiCall, ApplicationRequest, BenchmarkResult, ResponseTimeSummary};

use crate::error::DataStoreError;
use crate::store::{
    BenchmarkMap, DataStore, HistoryMap, RequestMap, SummaryMap, check_period, check_window,
};

const OPERATIONS: [&str; 2] = ["GET /", "GET /users"];
const BENCHMARK_INTERVAL_MS: i64 = 15_000;
const SERVICES: [(&str, &str); 3] = [
    ("datastore", "query"),
    ("datastore", "put"),
    ("memcache", "get"),
];

#[derive(Debug, Default)]
pub struct RandomDataStore;

impl RandomDataStore {
    pub fn new() -> Self {
        Self
    }

    fn summary(timestamp: i64) -> ResponseTimeSummary {
        let mut rng = rand::thread_rng();
        ResponseTimeSummary::new(
            timestamp,
            rng.gen_range(10.0..100.0),
            rng.gen_range(1..1000) as f64,
        )
    }

    fn request(application: &str, operation: &str, timestamp: i64) -> ApplicationRequest {
        let mut rng = rand::thread_rng();
        let mut calls = Vec::new();
        for (service, op) in SERVICES {
            if rng.gen_bool(0.8) {
                calls.push(ApiCall::new(timestamp, service, op, rng.gen_range(1..30)));
            }
        }
        let api_time: u64 = calls.iter().map(|c| c.elapsed_ms).sum();
        ApplicationRequest {
            request_id: format!("{:016x}", rng.r#gen::<u64>()),
            timestamp,
            application: application.to_string(),
            operation: operation.to_string(),
            api_calls: calls,
            response_time_ms: api_time + rng.gen_range(0..20),
        }
    }

    fn requests(application: &str, operation: &str, start: i64, end: i64) -> Vec<ApplicationRequest> {
        let count = rand::thread_rng().gen_range(0..20);
        let span = (end - start).max(1);
        let mut requests: Vec<_> = (0..count)
            .map(|i| Self::request(application, operation, start + span * i / count.max(1)))
            .collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }
}

#[async_trait]
impl DataStore for RandomDataStore {
    async fn response_time_summary(
        &self,
        _application: &str,
        start: i64,
        end: i64,
    ) -> Result<SummaryMap, DataStoreError> {
        check_window(start, end)?;
        Ok(OPERATIONS
            .iter()
            .map(|op| (op.to_string(), Self::summary(start)))
            .collect())
    }

    async fn response_time_history(
        &self,
        _application: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<HistoryMap, DataStoreError> {
        check_window(start, end)?;
        check_period(period_ms)?;
        let mut map: HistoryMap = BTreeMap::new();
        for op in OPERATIONS {
            let series = (start..end)
                .step_by(period_ms as usize)
                .map(Self::summary)
                .collect();
            map.insert(op.to_string(), series);
        }
        Ok(map)
    }

    async fn benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<BenchmarkMap, DataStoreError> {
        check_window(start, end)?;
        let mut rng = rand::thread_rng();
        let mut map: BenchmarkMap = BTreeMap::new();
        for op in OPERATIONS {
            let (method, path) = op.split_once(' ').unwrap_or(("GET", op));
            let samples = (start..end)
                .step_by(BENCHMARK_INTERVAL_MS as usize)
                .map(|ts| BenchmarkResult {
                    timestamp: ts,
                    application: application.to_string(),
                    method: method.to_string(),
                    path: path.to_string(),
                    response_time_ms: rng.gen_range(5..120),
                })
                .collect();
            map.insert(op.to_string(), samples);
        }
        Ok(map)
    }

    async fn workload_summary(
        &self,
        _application: &str,
        _operation: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<Vec<f64>, DataStoreError> {
        check_window(start, end)?;
        check_period(period_ms)?;
        let mut rng = rand::thread_rng();
        Ok((start..end)
            .step_by(period_ms as usize)
            .map(|_| rng.gen_range(50..150) as f64)
            .collect())
    }

    async fn request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<RequestMap, DataStoreError> {
        check_window(start, end)?;
        Ok(OPERATIONS
            .iter()
            .map(|op| (op.to_string(), Self::requests(application, op, start, end)))
            .collect())
    }

    async fn operation_request_info(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ApplicationRequest>, DataStoreError> {
        check_window(start, end)?;
        Ok(Self::requests(application, operation, start, end))
    }

    async fn record_benchmark_result(&self, result: &BenchmarkResult) -> Result<(), DataStoreError> {
        tracing::debug!(request_type = %result.request_type(), "discarding benchmark result");
        Ok(())
    }
}
