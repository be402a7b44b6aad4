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
//! Workload identity.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one workload network attachment.
///
/// The pool treats the key as fully opaque: equal keys always mean "the same
/// attachment", which is what makes assignment idempotent per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    /// Name of the network the attachment belongs to.
    pub network_name: String,
    /// Sandbox identifier of the workload.
    pub sandbox_id: String,
    /// Interface name inside the sandbox.
    pub if_name: String,
}

impl WorkloadKey {
    pub fn new(
        network_name: impl Into<String>,
        sandbox_id: impl Into<String>,
        if_name: impl Into<String>,
    ) -> Self {
        Self {
            network_name: network_name.into(),
            sandbox_id: sandbox_id.into(),
            if_name: if_name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.network_name, self.sandbox_id, self.if_name
        )
    }
}

/// Descriptive fields attached to an assignment.
///
/// Only used for reporting and checkpointing, never for identity or
/// allocation decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadMetadata {
    /// Namespace of the workload.
    pub namespace: String,
    /// Name of the workload.
    pub name: String,
}

impl WorkloadMetadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}
