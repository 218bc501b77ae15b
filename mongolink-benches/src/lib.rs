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

//! Shared fixtures for the Mongolink benchmarks.

use bson::{doc, Document};
use serde::{Deserialize, Serialize};

/// Sample record used across benchmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOrder {
    /// Logical id
    pub id: i64,
    /// Owning customer
    pub customer_id: i64,
    /// Order status
    pub status: String,
    /// Free-form notes, sized to vary payloads
    pub notes: String,
}

/// Creates `count` orders with payloads between 50 and 1000 bytes.
pub fn create_sample_orders(count: usize) -> Vec<SampleOrder> {
    (0..count)
        .map(|i| {
            let payload_size = match i % 4 {
                0 => 100,
                1 => 500,
                2 => 1000,
                _ => 50,
            };

            SampleOrder {
                id: i as i64,
                customer_id: (i % 1000) as i64,
                status: if i % 2 == 0 { "open" } else { "shipped" }.to_string(),
                notes: "x".repeat(payload_size),
            }
        })
        .collect()
}

/// Creates `count` raw insert envelopes shaped like server change events.
pub fn create_insert_envelopes(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            doc! {
                "_id": { "_data": format!("token_{i}") },
                "operationType": "insert",
                "ns": { "db": "bench_db", "coll": "orders" },
                "documentKey": { "_id": i as i64 },
                "fullDocument": {
                    "_id": i as i64,
                    "id": i as i64,
                    "customer_id": (i % 1000) as i64,
                    "status": "open",
                },
            }
        })
        .collect()
}
