// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! # Address Pool
//!
//! Node-local bookkeeping of the IP addresses available on a set of virtual
//! network interfaces, and of which workload owns which address.
//!
//! [store::AddressPool] owns all registered interfaces and serializes every
//! mutation behind a single lock. Each interface carries address blocks:
//! either individual host addresses or delegated prefixes, whose untouched
//! addresses are never materialized (see [block]).
//!
//! Assignments are written through to a [checkpoint::CheckpointSink] inside
//! the same critical section as the mutation they record, so the in-memory
//! view never outlives a failed durable write.

pub mod block;
pub mod checkpoint;
pub mod interface;
pub mod key;
pub mod store;
