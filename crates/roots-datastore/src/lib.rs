//! roots-datastore: where detectors and analyzers read telemetry from.
//!
//! [`DataStore`] is the async IO boundary. Implementations:
//! - [`ElasticSearchDataStore`]: access logs, benchmark samples and API call
//!   traces stored in Elasticsearch indices
//! - [`RandomDataStore`]: synthetic telemetry for demos and smoke runs
//! - [`TestDataStore`]: scripted responses plus a call log, for tests

pub mod elasticsearch;
pub mod error;
pub mod random;
pub mod registry;
pub mod store;
pub mod test_store;

pub use elasticsearch::{ElasticSearchConfig, ElasticSearchDataStore, FieldMappings};
pub use error::DataStoreError;
pub use random::RandomDataStore;
pub use registry::DataStoreRegistry;
pub use store::{BenchmarkMap, DataStore, HistoryMap, RequestMap, SummaryMap};
pub use test_store::{DataStoreCall, TestDataStore};
