//! Pre-built test fixtures for common test scenarios.
//!
//! Provides builders for records and engine configuration with sensible defaults.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use strata_core::{
    AttributeValue, Attributes, BatchId, BatchIngestRecord, EngineConfig, RetryConfig,
    SourceConfig,
};

/// Midnight UTC on the given date.
pub fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .expect("valid date")
}

/// Builder for [`BatchIngestRecord`]s.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: BatchIngestRecord,
}

impl RecordBuilder {
    /// Starts a record for `source` / `natural_key` loaded at 2024-01-01.
    pub fn new(source: impl Into<String>, natural_key: impl Into<String>) -> Self {
        Self {
            record: BatchIngestRecord {
                source: source.into(),
                natural_key: natural_key.into(),
                attributes: Attributes::new(),
                load_timestamp: ts(2024, 1, 1),
                batch_id: BatchId::generate(),
                sequence: 0,
            },
        }
    }

    /// Sets an attribute.
    #[must_use]
    pub fn attr(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.record.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Sets the load timestamp.
    #[must_use]
    pub fn at(mut self, load_timestamp: DateTime<Utc>) -> Self {
        self.record.load_timestamp = load_timestamp;
        self
    }

    /// Sets the ingestion sequence.
    #[must_use]
    pub fn seq(mut self, sequence: u64) -> Self {
        self.record.sequence = sequence;
        self
    }

    /// Sets the batch.
    #[must_use]
    pub fn batch(mut self, batch_id: BatchId) -> Self {
        self.record.batch_id = batch_id;
        self
    }

    /// Finishes the record.
    pub fn build(self) -> BatchIngestRecord {
        self.record
    }
}

/// A `customers` dimension record tracking `segment`.
pub fn customer(natural_key: &str, segment: &str, load_timestamp: DateTime<Utc>) -> BatchIngestRecord {
    RecordBuilder::new("customers", natural_key)
        .attr("segment", segment)
        .attr("name", format!("Customer {natural_key}"))
        .at(load_timestamp)
        .build()
}

/// An `orders` fact record referencing a customer.
pub fn order(
    natural_key: &str,
    customer_key: &str,
    amount: i64,
    event_time: DateTime<Utc>,
    load_timestamp: DateTime<Utc>,
) -> BatchIngestRecord {
    RecordBuilder::new("orders", natural_key)
        .attr("customer_id", customer_key)
        .attr("amount", amount)
        .attr("event_time", event_time.to_rfc3339())
        .at(load_timestamp)
        .build()
}

/// Engine config with a `customers` dimension (tracking `segment`) and an
/// `orders` fact source. Retries use millisecond backoff to keep tests fast.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_source(SourceConfig::dimension("customers", ["segment"]))
        .with_source(SourceConfig::fact(
            "orders",
            "event_time",
            BTreeMap::from([("customers".to_string(), "customer_id".to_string())]),
        ));
    config.retry = RetryConfig {
        max_attempts: 3,
        base_backoff_ms: 1,
        max_backoff_ms: 4,
    };
    config
}
