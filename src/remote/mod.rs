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

//! The remote-execution service seam.
//!
//! The orchestrator only ever talks to [`RemoteExecution`]; the production
//! implementation lives in [`grpc`], and tests script a mock against the
//! same trait.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::errors::*;
use crate::proto;

pub mod grpc;

pub use grpc::GrpcRemoteExecution;

/// One blob to upload, either synthesized in memory or backed by a local
/// file.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub digest: proto::Digest,
    pub source: UploadSource,
}

#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[async_trait]
pub trait RemoteExecution: Send + Sync {
    /// `FindMissingBlobs`: which of `digests` the CAS does not have.
    async fn find_missing_blobs(&self, digests: Vec<proto::Digest>) -> Result<Vec<proto::Digest>>;

    /// Upload blobs to the CAS. Idempotent by digest; ordering is
    /// irrelevant.
    async fn upload_blobs(&self, requests: Vec<UploadRequest>) -> Result<()>;

    /// `GetActionResult`: probe the Action Cache. `Ok(None)` is a miss.
    async fn get_action_result(
        &self,
        action_digest: &proto::Digest,
    ) -> Result<Option<proto::ActionResult>>;

    /// `UpdateActionResult`: publish the result of a local build.
    async fn update_action_result(
        &self,
        action_digest: &proto::Digest,
        result: &proto::ActionResult,
    ) -> Result<()>;

    /// `Execute` and stream the long-running operation to completion. The
    /// `stop` flag is the process-wide SIGINT token; observing it aborts the
    /// stream and surfaces [`RpcError::Cancelled`].
    async fn execute(
        &self,
        action_digest: &proto::Digest,
        skip_cache_lookup: bool,
        stop: Arc<AtomicBool>,
    ) -> Result<proto::ActionResult>;

    /// Materialize every output of `result` (files, directories, symlinks)
    /// under `root`.
    async fn download_outputs(&self, result: &proto::ActionResult, root: &Path) -> Result<()>;
}
