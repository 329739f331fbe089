// Copyright 2021 rexc project contributors
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

pub use anyhow::{anyhow, bail, Context, Error, Result};

/// Invalid setting detected while loading the environment or a config file.
#[derive(thiserror::Error, Debug)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// A command line that cannot be turned into a remote action: malformed
/// compiler invocation, unsupported file suffix, bad `argv[0]`.
///
/// Parse errors never fail the build; the orchestrator runs the original
/// command locally instead.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct ParseError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum SubprocessError {
    /// The executable could not be launched at all.
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, #[source] std::io::Error),
    /// The dependency command ran but exited non-zero.
    #[error("subprocess exited with status {0}")]
    Failed(i32),
}

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// SIGINT observed while the Execute stream was live.
    #[error("remote execution cancelled")]
    Cancelled,
    #[error("rpc {code}: {message}")]
    Status { code: i32, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl RpcError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled)
    }
}
