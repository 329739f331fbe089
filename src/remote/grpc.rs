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

//! Production [`RemoteExecution`] implementation over gRPC.
//!
//! Stubs are hand-rolled on `tonic::client::Grpc` with a prost codec; the
//! method paths below are the REAPI v2 service definitions. Blob transfer
//! goes through the batch RPCs, chunked to stay under the server's message
//! budget and fanned out across a bounded worker pool. A blob larger than
//! one batch is sent in a singleton batch.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use http::uri::PathAndQuery;
use prost::Message;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tonic::transport::{Channel, Endpoint};

use crate::config::Config;
use crate::digest::DigestFunction;
use crate::errors::*;
use crate::proto;
use crate::proto::longrunning;

use super::{RemoteExecution, UploadRequest, UploadSource};

const FIND_MISSING_BLOBS_PATH: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs";
const BATCH_UPDATE_BLOBS_PATH: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchUpdateBlobs";
const BATCH_READ_BLOBS_PATH: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchReadBlobs";
const GET_ACTION_RESULT_PATH: &str =
    "/build.bazel.remote.execution.v2.ActionCache/GetActionResult";
const UPDATE_ACTION_RESULT_PATH: &str =
    "/build.bazel.remote.execution.v2.ActionCache/UpdateActionResult";
const EXECUTE_PATH: &str = "/build.bazel.remote.execution.v2.Execution/Execute";

/// Leave headroom under the conventional 4 MiB gRPC message limit.
const MAX_BATCH_BYTES: i64 = 4 * 1024 * 1024 - 64 * 1024;
/// Digest-only requests are cheap; still bound them.
const MAX_DIGESTS_PER_REQUEST: usize = 4096;

pub struct GrpcRemoteExecution {
    cas: Channel,
    execution: Channel,
    action_cache: Channel,
    instance: String,
    retry_limit: u32,
    retry_delay: Duration,
    worker_count: usize,
    digest_function: DigestFunction,
}

impl GrpcRemoteExecution {
    /// Build (lazy) channels for the configured endpoints, sharing one
    /// channel wherever endpoints coincide.
    pub fn connect(config: &Config) -> Result<Self> {
        let execution_uri = config
            .execution_endpoint()
            .ok_or_else(|| ConfigError("SERVER is not configured".to_string()))?
            .to_string();
        let cas_uri = config.cas_endpoint().unwrap_or_default().to_string();
        let action_cache_uri = config
            .action_cache_endpoint()
            .unwrap_or_default()
            .to_string();

        let execution = build_channel(&execution_uri, config)?;
        let cas = if cas_uri == execution_uri {
            execution.clone()
        } else {
            build_channel(&cas_uri, config)?
        };
        let action_cache = if action_cache_uri == cas_uri {
            cas.clone()
        } else if action_cache_uri == execution_uri {
            execution.clone()
        } else {
            build_channel(&action_cache_uri, config)?
        };

        Ok(GrpcRemoteExecution {
            cas,
            execution,
            action_cache,
            instance: config.instance.clone(),
            retry_limit: config.retry_limit,
            retry_delay: config.retry_delay,
            worker_count: config.worker_count(),
            digest_function: config.cas_digest_function,
        })
    }

    async fn try_unary<Req, Resp>(
        &self,
        channel: &Channel,
        path: &'static str,
        request: Req,
    ) -> std::result::Result<Resp, tonic::Status>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(channel.clone());
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service was not ready: {}", e)))?;
        let codec: tonic::codec::ProstCodec<Req, Resp> = tonic::codec::ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await?;
        Ok(response.into_inner())
    }

    /// One unary call with the configured exponential retry policy.
    async fn call_unary<Req, Resp>(
        &self,
        channel: &Channel,
        path: &'static str,
        request: Req,
    ) -> Result<Resp>
    where
        Req: Message + Clone + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor((self.retry_delay.as_millis() as u64 / 2).max(1))
            .max_delay(Duration::from_secs(30))
            .map(jitter);
        let mut attempt = 0u32;
        loop {
            match self.try_unary(channel, path, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(status) if attempt < self.retry_limit && retryable(&status) => {
                    attempt += 1;
                    warn!(
                        "{} failed ({}), retry {} of {}",
                        path, status, attempt, self.retry_limit
                    );
                    tokio::time::sleep(delays.next().unwrap_or(self.retry_delay)).await;
                }
                Err(status) => return Err(rpc_error(status).into()),
            }
        }
    }

    async fn send_update_batch(&self, batch: Vec<UploadRequest>) -> Result<()> {
        let mut requests = Vec::with_capacity(batch.len());
        for upload in batch {
            let data = match upload.source {
                UploadSource::Bytes(bytes) => bytes,
                UploadSource::File(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
            };
            requests.push(proto::batch_update_blobs_request::Request {
                digest: Some(upload.digest),
                data,
            });
        }
        let response: proto::BatchUpdateBlobsResponse = self
            .call_unary(
                &self.cas,
                BATCH_UPDATE_BLOBS_PATH,
                proto::BatchUpdateBlobsRequest {
                    instance_name: self.instance.clone(),
                    requests,
                },
            )
            .await?;
        for entry in response.responses {
            let status = entry.status.unwrap_or_default();
            if status.code != 0 {
                bail!(RpcError::Status {
                    code: status.code,
                    message: format!(
                        "upload of {} rejected: {}",
                        entry.digest.unwrap_or_default(),
                        status.message
                    ),
                });
            }
        }
        Ok(())
    }

    /// Fetch blobs by digest. Zero-size digests resolve to empty payloads
    /// without a round trip.
    async fn read_blobs(
        &self,
        digests: Vec<proto::Digest>,
    ) -> Result<HashMap<proto::Digest, Vec<u8>>> {
        let mut fetched: HashMap<proto::Digest, Vec<u8>> = HashMap::new();
        let mut wanted = Vec::new();
        for digest in digests {
            if digest.size_bytes == 0 {
                fetched.insert(digest, Vec::new());
            } else {
                wanted.push(digest);
            }
        }

        let mut batches: Vec<Vec<proto::Digest>> = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0i64;
        for digest in wanted {
            if !current.is_empty() && current_bytes + digest.size_bytes > MAX_BATCH_BYTES {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += digest.size_bytes;
            current.push(digest);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let responses: Vec<Result<proto::BatchReadBlobsResponse>> = stream::iter(batches)
            .map(|digests| {
                self.call_unary(
                    &self.cas,
                    BATCH_READ_BLOBS_PATH,
                    proto::BatchReadBlobsRequest {
                        instance_name: self.instance.clone(),
                        digests,
                    },
                )
            })
            .buffer_unordered(self.worker_count)
            .collect()
            .await;

        for response in responses {
            for entry in response?.responses {
                let status = entry.status.unwrap_or_default();
                let digest = entry.digest.unwrap_or_default();
                if status.code != 0 {
                    bail!(RpcError::Status {
                        code: status.code,
                        message: format!("read of {} failed: {}", digest, status.message),
                    });
                }
                fetched.insert(digest, entry.data);
            }
        }
        Ok(fetched)
    }

    /// Decode a Tree blob and plan the writes it implies under `base`.
    fn plan_tree(
        &self,
        base: &Path,
        tree: &proto::Tree,
        pending: &mut Vec<(PathBuf, proto::Digest, bool)>,
    ) -> Result<()> {
        let root = tree
            .root
            .as_ref()
            .ok_or_else(|| anyhow!("output tree has no root directory"))?;
        let children: HashMap<proto::Digest, &proto::Directory> = tree
            .children
            .iter()
            .map(|child| (self.digest_function.make_digest_of_message(child), child))
            .collect();

        let mut stack: Vec<(PathBuf, &proto::Directory)> = vec![(base.to_path_buf(), root)];
        while let Some((dir_path, dir)) = stack.pop() {
            fs_err::create_dir_all(&dir_path)?;
            for file in &dir.files {
                pending.push((
                    dir_path.join(&file.name),
                    file.digest.clone().unwrap_or_default(),
                    file.is_executable,
                ));
            }
            for symlink in &dir.symlinks {
                write_symlink(&dir_path.join(&symlink.name), &symlink.target)?;
            }
            for node in &dir.directories {
                let digest = node.digest.clone().unwrap_or_default();
                let child = children
                    .get(&digest)
                    .ok_or_else(|| anyhow!("output tree is missing directory {}", digest))?;
                stack.push((dir_path.join(&node.name), child));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecution for GrpcRemoteExecution {
    async fn find_missing_blobs(&self, digests: Vec<proto::Digest>) -> Result<Vec<proto::Digest>> {
        let chunks: Vec<Vec<proto::Digest>> = digests
            .chunks(MAX_DIGESTS_PER_REQUEST)
            .map(|chunk| chunk.to_vec())
            .collect();
        let responses: Vec<Result<proto::FindMissingBlobsResponse>> = stream::iter(chunks)
            .map(|blob_digests| {
                self.call_unary(
                    &self.cas,
                    FIND_MISSING_BLOBS_PATH,
                    proto::FindMissingBlobsRequest {
                        instance_name: self.instance.clone(),
                        blob_digests,
                    },
                )
            })
            .buffer_unordered(self.worker_count)
            .collect()
            .await;

        let mut missing = Vec::new();
        for response in responses {
            missing.extend(response?.missing_blob_digests);
        }
        Ok(missing)
    }

    async fn upload_blobs(&self, requests: Vec<UploadRequest>) -> Result<()> {
        let mut batches: Vec<Vec<UploadRequest>> = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0i64;
        for request in requests {
            if !current.is_empty() && current_bytes + request.digest.size_bytes > MAX_BATCH_BYTES {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += request.digest.size_bytes;
            current.push(request);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let results: Vec<Result<()>> = stream::iter(batches)
            .map(|batch| self.send_update_batch(batch))
            .buffer_unordered(self.worker_count)
            .collect()
            .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn get_action_result(
        &self,
        action_digest: &proto::Digest,
    ) -> Result<Option<proto::ActionResult>> {
        let request = proto::GetActionResultRequest {
            instance_name: self.instance.clone(),
            action_digest: Some(action_digest.clone()),
            inline_stdout: true,
            inline_stderr: true,
        };
        match self
            .call_unary::<_, proto::ActionResult>(&self.action_cache, GET_ACTION_RESULT_PATH, request)
            .await
        {
            Ok(result) => Ok(Some(result)),
            Err(e) => match e.downcast_ref::<RpcError>() {
                Some(RpcError::Status { code, .. })
                    if *code == tonic::Code::NotFound as i32 =>
                {
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }

    async fn update_action_result(
        &self,
        action_digest: &proto::Digest,
        result: &proto::ActionResult,
    ) -> Result<()> {
        let request = proto::UpdateActionResultRequest {
            instance_name: self.instance.clone(),
            action_digest: Some(action_digest.clone()),
            action_result: Some(result.clone()),
        };
        let _: proto::ActionResult = self
            .call_unary(&self.action_cache, UPDATE_ACTION_RESULT_PATH, request)
            .await?;
        Ok(())
    }

    async fn execute(
        &self,
        action_digest: &proto::Digest,
        skip_cache_lookup: bool,
        stop: Arc<AtomicBool>,
    ) -> Result<proto::ActionResult> {
        let request = proto::ExecuteRequest {
            instance_name: self.instance.clone(),
            skip_cache_lookup,
            action_digest: Some(action_digest.clone()),
        };

        let mut grpc = tonic::client::Grpc::new(self.execution.clone());
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service was not ready: {}", e)))
            .map_err(rpc_error)?;
        let codec: tonic::codec::ProstCodec<proto::ExecuteRequest, longrunning::Operation> =
            tonic::codec::ProstCodec::default();
        let response = grpc
            .server_streaming(
                tonic::Request::new(request),
                PathAndQuery::from_static(EXECUTE_PATH),
                codec,
            )
            .await
            .map_err(rpc_error)?;
        let mut operations = response.into_inner();

        loop {
            if stop.load(Ordering::Relaxed) {
                // Dropping the stream aborts the RPC server-side.
                bail!(RpcError::Cancelled);
            }
            let next = tokio::select! {
                message = operations.message() => message,
                _ = wait_for_stop(&stop) => bail!(RpcError::Cancelled),
            };
            match next {
                Ok(Some(operation)) if operation.done => {
                    return decode_completed_operation(operation)
                }
                Ok(Some(operation)) => {
                    trace!("execution in progress: {}", operation.name);
                }
                Ok(None) => bail!(RpcError::Status {
                    code: tonic::Code::Unknown as i32,
                    message: "execute stream ended before the operation completed".to_string(),
                }),
                Err(status) => return Err(rpc_error(status).into()),
            }
        }
    }

    async fn download_outputs(&self, result: &proto::ActionResult, root: &Path) -> Result<()> {
        let mut pending: Vec<(PathBuf, proto::Digest, bool)> = Vec::new();

        for file in &result.output_files {
            let path = root.join(&file.path);
            let digest = file.digest.clone().unwrap_or_default();
            if !file.contents.is_empty() || digest.size_bytes == 0 {
                write_file(&path, &file.contents, file.is_executable)?;
            } else {
                pending.push((path, digest, file.is_executable));
            }
        }

        for symlink in &result.output_symlinks {
            write_symlink(&root.join(&symlink.path), &symlink.target)?;
        }

        if !result.output_directories.is_empty() {
            let tree_digests: Vec<proto::Digest> = result
                .output_directories
                .iter()
                .filter_map(|dir| dir.tree_digest.clone())
                .collect();
            let trees = self.read_blobs(tree_digests).await?;
            for dir in &result.output_directories {
                let digest = dir.tree_digest.clone().unwrap_or_default();
                let data = trees
                    .get(&digest)
                    .ok_or_else(|| anyhow!("missing tree blob {}", digest))?;
                let tree = proto::Tree::decode(data.as_slice())
                    .with_context(|| format!("invalid tree blob {}", digest))?;
                self.plan_tree(&root.join(&dir.path), &tree, &mut pending)?;
            }
        }

        let blobs = self
            .read_blobs(pending.iter().map(|(_, digest, _)| digest.clone()).collect())
            .await?;
        for (path, digest, executable) in pending {
            let data = blobs
                .get(&digest)
                .ok_or_else(|| anyhow!("server did not return blob {}", digest))?;
            write_file(&path, data, executable)?;
        }
        Ok(())
    }
}

fn build_channel(uri: &str, config: &Config) -> Result<Channel> {
    let mut endpoint = Endpoint::from_shared(uri.to_string())
        .map_err(|e| RpcError::Transport(format!("invalid endpoint \"{}\": {}", uri, e)))?;
    if let Some(timeout) = config.request_timeout {
        endpoint = endpoint.timeout(timeout);
    }
    if let Some(keepalive) = config.keepalive_time {
        endpoint = endpoint
            .http2_keep_alive_interval(keepalive)
            .keep_alive_while_idle(true);
    }
    Ok(endpoint.connect_lazy())
}

fn retryable(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::Unavailable
            | tonic::Code::DeadlineExceeded
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted
    )
}

fn rpc_error(status: tonic::Status) -> RpcError {
    if status.code() == tonic::Code::Cancelled {
        RpcError::Cancelled
    } else {
        RpcError::Status {
            code: status.code() as i32,
            message: status.message().to_string(),
        }
    }
}

fn decode_completed_operation(operation: longrunning::Operation) -> Result<proto::ActionResult> {
    match operation.result {
        Some(longrunning::operation::Result::Error(status)) => Err(status_error(status)),
        Some(longrunning::operation::Result::Response(any)) => {
            let response = proto::ExecuteResponse::decode(any.value.as_slice())
                .context("malformed ExecuteResponse in operation")?;
            if let Some(status) = response.status {
                if status.code != 0 {
                    return Err(status_error(status));
                }
            }
            response
                .result
                .ok_or_else(|| anyhow!("execute response carried no action result"))
        }
        None => Err(anyhow!("completed operation carried no result")),
    }
}

fn status_error(status: proto::rpc::Status) -> Error {
    if status.code == tonic::Code::Cancelled as i32 {
        RpcError::Cancelled.into()
    } else {
        RpcError::Status {
            code: status.code,
            message: status.message,
        }
        .into()
    }
}

async fn wait_for_stop(stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn write_file(path: &Path, data: &[u8], executable: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(path, data)?;
    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt;
        fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(unix)]
fn write_symlink(path: &Path, target: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    match fs_err::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink(_path: &Path, _target: &str) -> Result<()> {
    bail!("symlink outputs are not supported on this platform")
}
