//! Elasticsearch-backed data store.
//!
//! Three indices, one document type per application:
//! - access logs (`{access_log_index}/{app}`): aggregated into response-time
//!   summaries and workload counts
//! - benchmark samples (`{benchmark_index}/{app}`): raw response times
//! - API call traces (`{api_call_index}/{app}`): one document per call,
//!   grouped into requests by request id

pub mod query;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use roots_core::model::normalize_requests;
use roots_core::{ApiCall, ApplicationRequest, BenchmarkResult, ResponseTimeSummary};
use serde::Deserialize;
use serde_json::Value;

use crate::error::DataStoreError;
use crate::store::{
    BenchmarkMap, DataStore, HistoryMap, RequestMap, SummaryMap, check_period, check_window,
};

const METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

// ─── Configuration ──────────────────────────────────────────────────

/// Document field names. Defaults match the access-log and tracing
/// pipelines Roots was deployed with; any of them can be overridden.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FieldMappings {
    pub access_log_timestamp: String,
    pub access_log_method: String,
    pub access_log_path: String,
    pub access_log_response_time: String,
    pub benchmark_timestamp: String,
    pub benchmark_method: String,
    pub benchmark_path: String,
    pub benchmark_response_time: String,
    pub api_call_timestamp: String,
    pub api_call_request_timestamp: String,
    pub api_call_request_operation: String,
    pub api_call_request_operation_raw: String,
    pub api_call_sequence_number: String,
    pub api_call_application: String,
    pub api_call_service: String,
    pub api_call_operation: String,
    pub api_call_response_time: String,
    pub api_call_request_id: String,
}

impl Default for FieldMappings {
    fn default() -> Self {
        Self {
            access_log_timestamp: "@timestamp".into(),
            access_log_method: "http_verb.raw".into(),
            access_log_path: "http_request.raw".into(),
            access_log_response_time: "time_duration".into(),
            benchmark_timestamp: "timestamp".into(),
            benchmark_method: "method".into(),
            benchmark_path: "path".into(),
            benchmark_response_time: "responseTime".into(),
            api_call_timestamp: "timestamp".into(),
            api_call_request_timestamp: "requestTimestamp".into(),
            api_call_request_operation: "requestOperation".into(),
            api_call_request_operation_raw: "requestOperation.raw".into(),
            api_call_sequence_number: "sequenceNumber".into(),
            api_call_application: "appId".into(),
            api_call_service: "service".into(),
            api_call_operation: "operation".into(),
            api_call_response_time: "elapsed".into(),
            api_call_request_id: "requestId".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElasticSearchConfig {
    pub host: String,
    pub port: u16,
    pub access_log_index: Option<String>,
    pub benchmark_index: Option<String>,
    pub api_call_index: Option<String>,
    pub fields: FieldMappings,
    pub timeout: Duration,
}

impl ElasticSearchConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            access_log_index: None,
            benchmark_index: None,
            api_call_index: None,
            fields: FieldMappings::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

// ─── Store ──────────────────────────────────────────────────────────

pub struct ElasticSearchDataStore {
    client: reqwest::Client,
    base_url: String,
    config: ElasticSearchConfig,
}

impl ElasticSearchDataStore {
    pub fn new(config: ElasticSearchConfig) -> Result<Self, DataStoreError> {
        if config.host.trim().is_empty() {
            return Err(DataStoreError::InvalidQuery(
                "elasticsearch host is required".into(),
            ));
        }
        if config.port == 0 {
            return Err(DataStoreError::InvalidQuery(
                "elasticsearch port is invalid".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DataStoreError::Request(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", config.host, config.port),
            config,
        })
    }

    fn index<'a>(
        &'a self,
        index: &'a Option<String>,
        what: &str,
    ) -> Result<&'a str, DataStoreError> {
        index
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DataStoreError::InvalidQuery(format!("{what} index is not configured")))
    }

    async fn post(&self, path: &str, params: &[(&str, &str)], body: &Value) -> Result<Value, DataStoreError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::trace!(%url, %body, "elasticsearch request");
        let response = self
            .client
            .post(&url)
            .query(params)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DataStoreError::Request(format!("{url} returned {status}: {text}")));
        }
        Ok(response.json().await?)
    }

    /// Run a scrolled search and hand every hit's `_source` to `sink`.
    async fn scroll_hits<F>(&self, path: &str, body: &Value, mut sink: F) -> Result<(), DataStoreError>
    where
        F: FnMut(&Value) -> Result<(), DataStoreError> + Send,
    {
        let mut page = self
            .post(path, &[("scroll", query::SCROLL_KEEP_ALIVE)], body)
            .await?;
        let total = hits_total(&page)?;
        let mut received = 0u64;
        loop {
            let hits = page
                .pointer("/hits/hits")
                .and_then(Value::as_array)
                .ok_or_else(|| DataStoreError::Response("missing hits".into()))?;
            for hit in hits {
                let source = hit
                    .get("_source")
                    .ok_or_else(|| DataStoreError::Response("hit without _source".into()))?;
                sink(source)?;
            }
            received += hits.len() as u64;
            if received >= total || hits.is_empty() {
                break;
            }
            let scroll_id = page
                .get("_scroll_id")
                .and_then(Value::as_str)
                .ok_or_else(|| DataStoreError::Response("missing _scroll_id".into()))?
                .to_string();
            page = self
                .post("/_search/scroll", &[], &query::scroll(&scroll_id))
                .await?;
        }
        Ok(())
    }

    async fn api_calls(
        &self,
        application: &str,
        operation: Option<&str>,
        start: i64,
        end: i64,
    ) -> Result<BTreeMap<String, TracedCalls>, DataStoreError> {
        let index = self.index(&self.config.api_call_index, "api call")?;
        let body = query::request_info(&self.config.fields, operation, start, end);
        let fields = &self.config.fields;
        let mut calls: BTreeMap<String, TracedCalls> = BTreeMap::new();
        self.scroll_hits(&format!("/{index}/{application}/_search"), &body, |source| {
            let request_id = str_field(source, &fields.api_call_request_id)?;
            let entry = calls.entry(request_id).or_insert_with(|| TracedCalls {
                request_timestamp: 0,
                operation: String::new(),
                calls: Vec::new(),
            });
            entry.request_timestamp = i64_field(source, &fields.api_call_request_timestamp)?;
            entry.operation = str_field(source, &fields.api_call_request_operation)?;
            entry.calls.push(ApiCall::new(
                i64_field(source, &fields.api_call_timestamp)?,
                str_field(source, &fields.api_call_service)?,
                str_field(source, &fields.api_call_operation)?,
                u64_field(source, &fields.api_call_response_time)?,
            ));
            Ok(())
        })
        .await?;
        Ok(calls)
    }
}

struct TracedCalls {
    request_timestamp: i64,
    operation: String,
    calls: Vec<ApiCall>,
}

impl TracedCalls {
    /// Traces carry no access-log join, so the response time is the time
    /// spent in API calls.
    fn into_request(self, request_id: String, application: &str) -> ApplicationRequest {
        let response_time_ms = self.calls.iter().map(|c| c.elapsed_ms).sum();
        ApplicationRequest {
            request_id,
            timestamp: self.request_timestamp,
            application: application.to_string(),
            operation: self.operation,
            api_calls: self.calls,
            response_time_ms,
        }
    }
}

#[async_trait]
impl DataStore for ElasticSearchDataStore {
    async fn response_time_summary(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<SummaryMap, DataStoreError> {
        check_window(start, end)?;
        let index = self.index(&self.config.access_log_index, "access log")?;
        let body = query::response_time_summary(&self.config.fields, start, end);
        let result = self
            .post(&format!("/{index}/{application}/_search"), &[], &body)
            .await?;
        parse_response_time_summary(&result, start)
    }

    async fn response_time_history(
        &self,
        application: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<HistoryMap, DataStoreError> {
        check_window(start, end)?;
        check_period(period_ms)?;
        let index = self.index(&self.config.access_log_index, "access log")?;
        let body = query::response_time_history(&self.config.fields, start, end, period_ms);
        let result = self
            .post(&format!("/{index}/{application}/_search"), &[], &body)
            .await?;
        parse_response_time_history(&result)
    }

    async fn benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<BenchmarkMap, DataStoreError> {
        check_window(start, end)?;
        let index = self.index(&self.config.benchmark_index, "benchmark")?;
        let body = query::benchmark_results(&self.config.fields, start, end);
        let fields = &self.config.fields;
        let mut results: BenchmarkMap = BTreeMap::new();
        self.scroll_hits(&format!("/{index}/{application}/_search"), &body, |source| {
            let result = BenchmarkResult {
                timestamp: i64_field(source, &fields.benchmark_timestamp)?,
                application: application.to_string(),
                method: str_field(source, &fields.benchmark_method)?,
                path: str_field(source, &fields.benchmark_path)?,
                response_time_ms: u64_field(source, &fields.benchmark_response_time)?,
            };
            results.entry(result.request_type()).or_default().push(result);
            Ok(())
        })
        .await?;
        Ok(results)
    }

    async fn workload_summary(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
        period_ms: i64,
    ) -> Result<Vec<f64>, DataStoreError> {
        check_window(start, end)?;
        check_period(period_ms)?;
        let (method, path) = operation.split_once(' ').ok_or_else(|| {
            DataStoreError::InvalidQuery(format!("invalid operation string: {operation}"))
        })?;
        let index = self.index(&self.config.access_log_index, "access log")?;
        let body = query::workload_summary(&self.config.fields, method, path, start, end, period_ms);
        let result = self
            .post(&format!("/{index}/{application}/_search"), &[], &body)
            .await?;
        parse_workload_summary(&result)
    }

    async fn request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> Result<RequestMap, DataStoreError> {
        check_window(start, end)?;
        let calls = self.api_calls(application, None, start, end).await?;
        let mut grouped: RequestMap = BTreeMap::new();
        for (request_id, traced) in calls {
            let request = traced.into_request(request_id, application);
            grouped
                .entry(request.operation.clone())
                .or_default()
                .push(request);
        }
        for requests in grouped.values_mut() {
            normalize_requests(requests);
        }
        Ok(grouped)
    }

    async fn operation_request_info(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ApplicationRequest>, DataStoreError> {
        check_window(start, end)?;
        let calls = self.api_calls(application, Some(operation), start, end).await?;
        let mut requests: Vec<_> = calls
            .into_iter()
            .map(|(id, traced)| {
                let mut request = traced.into_request(id, application);
                request.operation = operation.to_string();
                request
            })
            .collect();
        normalize_requests(&mut requests);
        Ok(requests)
    }

    async fn record_benchmark_result(&self, result: &BenchmarkResult) -> Result<(), DataStoreError> {
        let index = self.index(&self.config.benchmark_index, "benchmark")?;
        let fields = &self.config.fields;
        let mut doc = serde_json::Map::new();
        doc.insert(fields.benchmark_timestamp.clone(), result.timestamp.into());
        doc.insert(fields.benchmark_method.clone(), result.method.clone().into());
        doc.insert(fields.benchmark_path.clone(), result.path.clone().into());
        doc.insert(
            fields.benchmark_response_time.clone(),
            result.response_time_ms.into(),
        );
        self.post(
            &format!("/{index}/{}", result.application),
            &[],
            &Value::Object(doc),
        )
        .await
        .map(drop)
    }

    async fn destroy(&self) {
        tracing::debug!(url = %self.base_url, "elasticsearch data store closed");
    }
}

// ─── Response parsing ───────────────────────────────────────────────

#[derive(Deserialize)]
struct Buckets<T> {
    buckets: Vec<T>,
}

#[derive(Deserialize)]
struct MethodBucket<P> {
    key: String,
    paths: Buckets<P>,
}

#[derive(Deserialize)]
struct AvgValue {
    value: Option<f64>,
}

const NO_VALUE: AvgValue = AvgValue { value: None };

#[derive(Deserialize)]
struct PathSummaryBucket {
    key: String,
    doc_count: f64,
    avg_time: AvgValue,
}

#[derive(Deserialize)]
struct PeriodBucket {
    key: f64,
    doc_count: f64,
    #[serde(default)]
    avg_time: Option<AvgValue>,
}

#[derive(Deserialize)]
struct PathHistoryBucket {
    key: String,
    periods: Buckets<PeriodBucket>,
}

fn aggregation<T: serde::de::DeserializeOwned>(result: &Value, name: &str) -> Result<T, DataStoreError> {
    let agg = result
        .get("aggregations")
        .and_then(|a| a.get(name))
        .ok_or_else(|| DataStoreError::Response(format!("missing aggregation {name}")))?;
    T::deserialize(agg).map_err(|e| DataStoreError::Response(format!("aggregation {name}: {e}")))
}

fn known_method(key: &str) -> Option<String> {
    let method = key.to_ascii_uppercase();
    METHODS.contains(&method.as_str()).then_some(method)
}

/// Access logs record seconds; summaries carry milliseconds.
fn summary(timestamp: i64, doc_count: f64, avg: &AvgValue) -> ResponseTimeSummary {
    ResponseTimeSummary::new(timestamp, avg.value.unwrap_or(0.0) * 1000.0, doc_count)
}

pub(crate) fn parse_response_time_summary(
    result: &Value,
    timestamp: i64,
) -> Result<SummaryMap, DataStoreError> {
    let methods: Buckets<MethodBucket<PathSummaryBucket>> = aggregation(result, "methods")?;
    let mut map = BTreeMap::new();
    for method in methods.buckets {
        let Some(name) = known_method(&method.key) else {
            continue;
        };
        for path in method.paths.buckets {
            map.insert(
                format!("{name} {}", path.key),
                summary(timestamp, path.doc_count, &path.avg_time),
            );
        }
    }
    Ok(map)
}

pub(crate) fn parse_response_time_history(result: &Value) -> Result<HistoryMap, DataStoreError> {
    let methods: Buckets<MethodBucket<PathHistoryBucket>> = aggregation(result, "methods")?;
    let mut map: HistoryMap = BTreeMap::new();
    for method in methods.buckets {
        let Some(name) = known_method(&method.key) else {
            continue;
        };
        for path in method.paths.buckets {
            let key = format!("{name} {}", path.key);
            for period in path.periods.buckets.iter().filter(|p| p.doc_count > 0.0) {
                let avg = period.avg_time.as_ref().unwrap_or(&NO_VALUE);
                map.entry(key.clone())
                    .or_default()
                    .push(summary(period.key as i64, period.doc_count, avg));
            }
        }
    }
    Ok(map)
}

pub(crate) fn parse_workload_summary(result: &Value) -> Result<Vec<f64>, DataStoreError> {
    let periods: Buckets<PeriodBucket> = aggregation(result, "periods")?;
    Ok(periods.buckets.into_iter().map(|p| p.doc_count).collect())
}

fn hits_total(page: &Value) -> Result<u64, DataStoreError> {
    let total = page
        .pointer("/hits/total")
        .ok_or_else(|| DataStoreError::Response("missing hits.total".into()))?;
    // ES 7+ reports `{"value": n, "relation": "eq"}`, older versions a bare number.
    total
        .as_u64()
        .or_else(|| total.get("value").and_then(Value::as_u64))
        .ok_or_else(|| DataStoreError::Response(format!("invalid hits.total: {total}")))
}

fn field<'a>(source: &'a Value, name: &str) -> Result<&'a Value, DataStoreError> {
    source
        .get(name)
        .ok_or_else(|| DataStoreError::Response(format!("document missing field {name}")))
}

fn str_field(source: &Value, name: &str) -> Result<String, DataStoreError> {
    field(source, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DataStoreError::Response(format!("field {name} is not a string")))
}

fn i64_field(source: &Value, name: &str) -> Result<i64, DataStoreError> {
    let v = field(source, name)?;
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .ok_or_else(|| DataStoreError::Response(format!("field {name} is not a number")))
}

fn u64_field(source: &Value, name: &str) -> Result<u64, DataStoreError> {
    let v = i64_field(source, name)?;
    u64::try_from(v).map_err(|_| DataStoreError::Response(format!("field {name} is negative")))
}
