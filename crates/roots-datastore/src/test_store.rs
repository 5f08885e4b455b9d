//! Scripted data store for tests.
//!
//! Data added with the `add_*` methods is handed out by the next matching
//! query and then forgotten, which mirrors how each detector window only
//! sees new telemetry. Every query is recorded; [`TestDataStore::fail_next`]
//! makes upcoming queries fail.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use roots_core::{ApplicationRequest, BenchmarkResult, ResponseTimeSummary};

use crate::error::DataStoreError;
use crate::store::{BenchmarkMap, DataStore, HistoryMap, RequestMap, SummaryMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataStoreCall {
    ResponseTimeSummary { application: String, start: i64, end: i64 },
    ResponseTimeHistory { application: String, start: i64, end: i64, period_ms: i64 },
    BenchmarkResults { application: String, start: i64, end: i64 },
    WorkloadSummary { application: String, operation: String, start: i64, end: i64, period_ms: i64 },
    RequestInfo { application: String, start: i64, end: i64 },
    OperationRequestInfo { application: String, operation: String, start: i64, end: i64 },
    RecordBenchmarkResult { application: String },
}

impl DataStoreCall {
    /// `(start, end)` of the queried window, if the call has one.
    pub fn window(&self) -> Option<(i64, i64)> {
        match self {
            Self::ResponseTimeSummary { start, end, .. }
            | Self::ResponseTimeHistory { start, end, .. }
            | Self::BenchmarkResults { start, end, .. }
            | Self::WorkloadSummary { start, end, .. }
            | Self::RequestInfo { start, end, .. }
            | Self::OperationRequestInfo { start, end, .. } => Some((*start, *end)),
            Self::RecordBenchmarkResult { .. } => None,
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<DataStoreCall>,
    fail_next: usize,
    summaries: SummaryMap,
    histories: HistoryMap,
    benchmarks: BenchmarkMap,
    workloads: VecDeque<Vec<f64>>,
    requests: Vec<ApplicationRequest>,
    recorded: Vec<BenchmarkResult>,
}

#[derive(Default)]
pub struct TestDataStore {
    state: Mutex<State>,
}

impl TestDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_summary(&self, key: &str, summary: ResponseTimeSummary) {
        self.state().summaries.insert(key.to_string(), summary);
    }

    pub fn add_history(&self, key: &str, summary: ResponseTimeSummary) {
        self.state()
            .histories
            .entry(key.to_string())
            .or_default()
            .push(summary);
    }

    pub fn add_benchmark_result(&self, result: BenchmarkResult) {
        self.state()
            .benchmarks
            .entry(result.request_type())
            .or_default()
            .push(result);
    }

    /// Queue one workload series; each `workload_summary` call pops one.
    pub fn add_workload(&self, series: Vec<f64>) {
        self.state().workloads.push_back(series);
    }

    pub fn add_request(&self, request: ApplicationRequest) {
        self.state().requests.push(request);
    }

    /// Fail the next `n` queries with a request error.
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn calls_and_clear(&self) -> Vec<DataStoreCall> {
        std::mem::take(&mut self.state().calls)
    }

    pub fn recorded_benchmark_results(&self) -> Vec<BenchmarkResult> {
        self.state().recorded.clone()
    }

    /// Record the call, then either fail or run `f` on the state.
    fn query<T>(
        &self,
        call: DataStoreCall,
        f: impl FnOnce(&mut State) -> T,
    ) -> Result<T, DataStoreError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DataStoreError::Request("scripted failure".into()));
        }
        Ok(f(&mut state))
    }
}

fn take_requests(
    state: &mut State,
    operation: Option<&str>,
    start: i64,
    end: i64,
) -> Vec<ApplicationRequest> {
    let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.requests)
        .into_iter()
        .partition(|r| {
            r.timestamp >= start
                && r.timestamp < end
                && operation.is_none_or(|op| r.operation == op)
        });
    state.requests = kept;
    let mut taken = taken;
    roots_core::model::normalize_requests(&mut taken);
    taken
}

#[async_trait]
impl DataStore for TestDataStore {
    async fn response_time_summary(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<SummaryMap, DataStoreError> {
        let call = DataStoreCall::ResponseTimeSummary {
            application: application.to_string(),
            start,
            end,
        };
        self.query(call, |s| std::mem::take(&mut s.summaries))
    }

    async fn response_time_history(
        &self,
        application: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<HistoryMap, DataStoreError> {
        let call = DataStoreCall::ResponseTimeHistory {
            application: application.to_string(),
            start,
            end,
            period_ms,
        };
        self.query(call, |s| std::mem::take(&mut s.histories))
    }

    async fn benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<BenchmarkMap, DataStoreError> {
        let call = DataStoreCall::BenchmarkResults {
            application: application.to_string(),
            start,
            end,
        };
        self.query(call, |s| std::mem::take(&mut s.benchmarks))
    }

    async fn workload_summary(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<Vec<f64>, DataStoreError> {
        let call = DataStoreCall::WorkloadSummary {
            application: application.to_string(),
            operation: operation.to_string(),
            start,
            end,
            period_ms,
        };
        self.query(call, |s| s.workloads.pop_front().unwrap_or_default())
    }

    async fn request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<RequestMap, DataStoreError> {
        let call = DataStoreCall::RequestInfo {
            application: application.to_string(),
            start,
            end,
        };
        self.query(call, |s| {
            let mut grouped: RequestMap = BTreeMap::new();
            for request in take_requests(s, None, start, end) {
                grouped
                    .entry(request.operation.clone())
                    .or_default()
                    .push(request);
            }
            grouped
        })
    }

    async fn operation_request_info(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ApplicationRequest>, DataStoreError> {
        let call = DataStoreCall::OperationRequestInfo {
            application: application.to_string(),
            operation: operation.to_string(),
            start,
            end,
        };
        self.query(call, |s| take_requests(s, Some(operation), start, end))
    }

    async fn record_benchmark_result(&self, result: &BenchmarkResult) -> Result<(), DataStoreError> {
        let call = DataStoreCall::RecordBenchmarkResult {
            application: result.application.clone(),
        };
        self.query(call, |s| s.recorded.push(result.clone()))
    }
}
