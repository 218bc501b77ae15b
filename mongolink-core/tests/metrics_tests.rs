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

//! Tests for metrics instrumentation module.

use mongolink_core::metrics::{
    ErrorCategory, LinkStatus, Timer, CHANGE_NOTICES_DELIVERED_TOTAL, METRIC_PREFIX,
    OPERATION_DURATION_SECONDS, RECONNECTS_TOTAL, RECONNECT_ATTEMPTS_TOTAL,
};
use mongolink_core::ConnectionStatus;

#[test]
fn test_metric_names() {
    // Ensure all metric names follow conventions
    for name in [
        RECONNECT_ATTEMPTS_TOTAL,
        RECONNECTS_TOTAL,
        CHANGE_NOTICES_DELIVERED_TOTAL,
    ] {
        assert!(name.starts_with(METRIC_PREFIX));
        assert!(name.ends_with("_total"));
    }
    assert!(OPERATION_DURATION_SECONDS.starts_with(METRIC_PREFIX));
    assert!(OPERATION_DURATION_SECONDS.ends_with("_seconds"));
}

#[test]
fn test_link_status_values() {
    assert_eq!(LinkStatus::Disconnected as u8, 0);
    assert_eq!(LinkStatus::Connected as u8, 1);
    assert_eq!(LinkStatus::Reconnecting as u8, 2);
}

#[test]
fn test_connection_status_maps_to_gauge() {
    assert_eq!(
        LinkStatus::from(ConnectionStatus::Reconnecting),
        LinkStatus::Reconnecting
    );
    assert_eq!(
        LinkStatus::from(ConnectionStatus::Disconnected),
        LinkStatus::Disconnected
    );
}

#[test]
fn test_error_category_labels_are_distinct() {
    let labels = [
        ErrorCategory::Timeout,
        ErrorCategory::Connection,
        ErrorCategory::Serialization,
        ErrorCategory::CorruptedDocument,
        ErrorCategory::Unavailable,
        ErrorCategory::Validation,
        ErrorCategory::Unknown,
    ]
    .map(|category| category.as_str());

    let unique: std::collections::HashSet<_> = labels.iter().collect();
    assert_eq!(unique.len(), labels.len());
}

#[test]
fn test_timer() {
    use std::thread;
    use std::time::Duration;

    let recorded = std::sync::Arc::new(std::sync::Mutex::new(None));
    let recorded_clone = recorded.clone();

    {
        let _timer = Timer::new("get_all", move |duration, label: &str| {
            *recorded_clone.lock().unwrap() = Some((duration, label.to_string()));
        });
        thread::sleep(Duration::from_millis(10));
    }

    let (duration, label) = recorded.lock().unwrap().clone().unwrap();
    assert!(duration.as_millis() >= 10);
    assert_eq!(label, "get_all");
}
