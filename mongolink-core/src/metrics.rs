// Copyright 2026 Mongolink Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Metrics instrumentation.
//!
//! Mongolink records through the [`metrics`] facade. Without an installed
//! recorder every call is a no-op; install an exporter (for example
//! `metrics-exporter-prometheus`) to collect them.
//!
//! # Naming
//!
//! All metrics follow Prometheus naming conventions:
//! - Prefix with application name (mongolink\_)
//! - Include unit suffix (\_seconds, \_total)
//! - Counter metrics end with \_total
//!
//! # Labels
//!
//! - **collection**: MongoDB collection name (low cardinality)
//! - **operation**: store or change operation, e.g. "add", "insert"
//! - **error\_type**: [`ErrorCategory`] label
//!
//! Never label with logical ids or error messages.
//!
//! # Examples
//!
//! ```rust
//! use mongolink_core::metrics::{self, ErrorCategory, LinkStatus};
//!
//! metrics::init_metrics();
//! metrics::set_link_status(LinkStatus::Connected);
//! metrics::increment_change_notices_delivered("Orders", "insert");
//! metrics::increment_change_events_skipped("Orders", ErrorCategory::CorruptedDocument);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all Mongolink metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "mongolink";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Total number of reconnect attempts made by the supervisor.
///
/// Type: Counter
#[doc(hidden)]
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "mongolink_reconnect_attempts_total";

/// Total number of successful reconnects.
///
/// Type: Counter
#[doc(hidden)]
pub const RECONNECTS_TOTAL: &str = "mongolink_reconnects_total";

/// Current link status (0=disconnected, 1=connected, 2=reconnecting).
///
/// Type: Gauge
const LINK_STATUS: &str = "mongolink_link_status";

/// Total number of change notices handed to watcher callbacks.
///
/// Type: Counter
/// Labels: collection, operation
#[doc(hidden)]
pub const CHANGE_NOTICES_DELIVERED_TOTAL: &str = "mongolink_change_notices_delivered_total";

/// Total number of change events skipped by watchers.
///
/// Type: Counter
/// Labels: collection, error_type
const CHANGE_EVENTS_SKIPPED_TOTAL: &str = "mongolink_change_events_skipped_total";

/// Total number of times a watcher dropped its feed and subscribed again.
///
/// Type: Counter
/// Labels: collection
const FEED_RESUBSCRIPTIONS_TOTAL: &str = "mongolink_feed_resubscriptions_total";

/// Duration of store operations issued through a link.
///
/// Type: Histogram
/// Labels: operation
/// Unit: seconds
#[doc(hidden)]
pub const OPERATION_DURATION_SECONDS: &str = "mongolink_operation_duration_seconds";

/// Total number of failed store operations.
///
/// Type: Counter
/// Labels: operation, error_type
const OPERATION_ERRORS_TOTAL: &str = "mongolink_operation_errors_total";

// ============================================================================
// Initialization
// ============================================================================

/// Registers metric descriptions with the installed recorder.
///
/// Call once at startup, after installing an exporter.
pub fn init_metrics() {
    describe_counter!(
        RECONNECT_ATTEMPTS_TOTAL,
        "Total number of reconnect attempts made by the supervisor"
    );

    describe_counter!(RECONNECTS_TOTAL, "Total number of successful reconnects");

    describe_gauge!(
        LINK_STATUS,
        "Current link status: 0=disconnected, 1=connected, 2=reconnecting"
    );

    describe_counter!(
        CHANGE_NOTICES_DELIVERED_TOTAL,
        "Total number of change notices delivered to watcher callbacks"
    );

    describe_counter!(
        CHANGE_EVENTS_SKIPPED_TOTAL,
        "Total number of change events skipped because they could not be interpreted"
    );

    describe_counter!(
        FEED_RESUBSCRIPTIONS_TOTAL,
        "Total number of change feed resubscriptions after a feed error or end"
    );

    describe_histogram!(
        OPERATION_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of store operations issued through a link"
    );

    describe_counter!(
        OPERATION_ERRORS_TOTAL,
        "Total number of failed store operations"
    );
}

// ============================================================================
// Reconnect Metrics
// ============================================================================

/// Increments the reconnect attempt counter.
pub fn increment_reconnect_attempts() {
    counter!(RECONNECT_ATTEMPTS_TOTAL).increment(1);
}

/// Increments the successful reconnect counter.
pub fn increment_reconnects() {
    counter!(RECONNECTS_TOTAL).increment(1);
}

/// Sets the link status gauge.
///
/// # Examples
///
/// ```rust
/// use mongolink_core::metrics::{self, LinkStatus};
///
/// metrics::set_link_status(LinkStatus::Reconnecting);
/// ```
pub fn set_link_status(status: LinkStatus) {
    gauge!(LINK_STATUS).set(f64::from(status as u8));
}

// ============================================================================
// Watcher Metrics
// ============================================================================

/// Increments the count of change notices delivered to a callback.
pub fn increment_change_notices_delivered(collection: &str, operation: &str) {
    counter!(
        CHANGE_NOTICES_DELIVERED_TOTAL,
        "collection" => collection.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Increments the count of change events a watcher skipped.
pub fn increment_change_events_skipped(collection: &str, error_category: ErrorCategory) {
    counter!(
        CHANGE_EVENTS_SKIPPED_TOTAL,
        "collection" => collection.to_string(),
        "error_type" => error_category.as_str()
    )
    .increment(1);
}

/// Increments the feed resubscription counter.
pub fn increment_feed_resubscriptions(collection: &str) {
    counter!(
        FEED_RESUBSCRIPTIONS_TOTAL,
        "collection" => collection.to_string()
    )
    .increment(1);
}

// ============================================================================
// Store Operation Metrics
// ============================================================================

/// Records the duration of one store operation.
pub fn record_operation_duration(duration: Duration, operation: &str) {
    histogram!(
        OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increments the failed store operation counter.
pub fn increment_operation_errors(operation: &str, error_category: ErrorCategory) {
    counter!(
        OPERATION_ERRORS_TOTAL,
        "operation" => operation.to_string(),
        "error_type" => error_category.as_str()
    )
    .increment(1);
}

// ============================================================================
// Label Types
// ============================================================================

/// Link status for the `link_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkStatus {
    /// No connection has been established, or it was torn down.
    Disconnected = 0,
    /// The link holds a verified connection.
    Connected = 1,
    /// The supervisor is re-establishing the connection.
    Reconnecting = 2,
}

/// Error categories for consistent metric labeling.
///
/// A fixed set of labels keeps free-form error messages out of metric
/// cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Timeout error (ping or server selection exceeded its limit)
    Timeout,
    /// Connection error (dial failures, unreachable servers)
    Connection,
    /// Serialization error (BSON encoding or decoding)
    Serialization,
    /// Stored or streamed document violates the logical id contract
    CorruptedDocument,
    /// Link was not connected or was reconnecting
    Unavailable,
    /// Validation error (invalid configuration, unique index violations)
    Validation,
    /// Unknown error (unclassified)
    Unknown,
}

impl ErrorCategory {
    /// Returns the error category as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout_error",
            Self::Connection => "connection_error",
            Self::Serialization => "serialization_error",
            Self::CorruptedDocument => "corrupted_document",
            Self::Unavailable => "unavailable_error",
            Self::Validation => "validation_error",
            Self::Unknown => "unknown_error",
        }
    }
}

// ============================================================================
// Metric Helper Utilities
// ============================================================================

/// Helper for timing operations and automatically recording the duration.
///
/// # Examples
///
/// ```rust
/// use mongolink_core::metrics::Timer;
///
/// {
///     let _timer = Timer::new("get_all", |duration, operation| {
///         mongolink_core::metrics::record_operation_duration(duration, operation);
///     });
///     // ... operation to time ...
/// } // Timer records when dropped
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a new timer that will record the duration when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
