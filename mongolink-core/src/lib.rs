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

//! Mongolink Core - Resilient MongoDB Link
//!
//! This crate keeps a MongoDB connection usable across network interruptions
//! and server restarts, exposes a small typed CRUD surface over it, and turns
//! a collection's change feed into logical-id notifications.
//!
//! # Key Components
//!
//! - **Link**: [`link`] module, the connection facade and CRUD surface
//! - **Supervisor**: [`supervisor`] module, background reconnection
//! - **Watcher**: [`watcher`] module, change feed to id notifications
//! - **Codec**: [`codec`] module, typed records to BSON documents and back
//! - **Drivers**: [`driver`] capability with [`mongo`] and [`memory`]
//!   implementations
//!
//! # Example
//!
//! ```rust
//! use mongolink_core::event::Namespace;
//! use mongolink_core::link::{Link, LinkConfig};
//! use mongolink_core::memory::MemoryDriver;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Job {
//!     id: i64,
//!     product_id: i64,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::builder().uri("memory://local").build()?;
//! let link = Link::builder(config).driver(MemoryDriver::new()).build();
//! link.connect().await?;
//!
//! let jobs = Namespace::new("Factory", "Jobs");
//! link.add(&jobs, &Job { id: 1, product_id: 42 }).await?;
//!
//! let all: Vec<Job> = link.get_all(&jobs).await?;
//! assert_eq!(all, vec![Job { id: 1, product_id: 42 }]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod codec;
pub mod driver;
pub mod event;
pub mod link;
pub mod memory;
pub mod metrics;
pub mod mongo;
pub mod state;
pub mod supervisor;
pub mod watcher;

pub use codec::{CodecError, DocumentCodec, LogicalId};
pub use event::{ChangeEvent, Namespace, OperationType};
pub use link::{Link, LinkConfig, LinkError};
pub use state::ConnectionStatus;
pub use watcher::{ChangeNotice, ChangeWatcher, WatchConfig};
