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

//! The per-invocation control flow: classify the command, build its Action,
//! probe the cache, upload, execute, and fetch results — falling back to a
//! plain local run whenever the command cannot (or should not) go remote.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::actionbuilder::{self, ActionBundle, BlobStore};
use crate::compiler::parse_command;
use crate::config::Config;
use crate::errors::*;
use crate::metrics::Metrics;
use crate::proto;
use crate::remote::RemoteExecution;
use crate::subprocess;

pub const TIMER_EXECUTE_ACTION: &str = "rexc.execute_action";
pub const TIMER_FIND_MISSING_BLOBS: &str = "rexc.find_missing_blobs";
pub const TIMER_QUERY_ACTION_CACHE: &str = "rexc.query_action_cache";
pub const TIMER_UPLOAD_MISSING_BLOBS: &str = "rexc.upload_missing_blobs";
pub const TIMER_DOWNLOAD_BLOBS: &str = "rexc.download_blobs";

pub const COUNTER_ACTION_CACHE_HIT: &str = "rexc.action_cache_hit";
pub const COUNTER_ACTION_CACHE_MISS: &str = "rexc.action_cache_miss";
pub const COUNTER_UPLOAD_BLOBS_CACHE_HIT: &str = "rexc.upload_blobs_cache_hit";
pub const COUNTER_UPLOAD_BLOBS_CACHE_MISS: &str = "rexc.upload_blobs_cache_miss";
pub const COUNTER_INPUT_SIZE_BYTES: &str = "rexc.input_size_bytes";

pub struct ExecutionContext {
    config: Config,
    metrics: Arc<Mutex<Metrics>>,
    stop: Arc<AtomicBool>,
    action_digest: Option<proto::Digest>,
}

impl ExecutionContext {
    pub fn new(config: Config, stop: Arc<AtomicBool>) -> ExecutionContext {
        ExecutionContext {
            config,
            metrics: Arc::new(Mutex::new(Metrics::default())),
            stop,
            action_digest: None,
        }
    }

    /// Shared handle for the publisher guard.
    pub fn metrics(&self) -> Arc<Mutex<Metrics>> {
        self.metrics.clone()
    }

    /// Digest of the last Action built, if any.
    pub fn action_digest(&self) -> Option<&proto::Digest> {
        self.action_digest.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn count(&self, name: &str, value: i64) {
        lock(&self.metrics).add_counter(name, value);
    }

    fn time(&self, name: &str, started: Instant) {
        lock(&self.metrics).record_duration(name, started.elapsed());
    }

    /// Run `argv` from the current working directory. Returns the exit code
    /// to surface, which on the happy path is the wrapped command's own.
    pub async fn execute<C, Fut>(&mut self, argv: &[String], connect: C) -> Result<i32>
    where
        C: FnOnce(&Config) -> Fut,
        Fut: Future<Output = Result<Arc<dyn RemoteExecution>>>,
    {
        let cwd = env::current_dir().context("cannot determine current working directory")?;
        self.execute_in(argv, &cwd, connect).await
    }

    pub async fn execute_in<C, Fut>(
        &mut self,
        argv: &[String],
        working_dir: &Path,
        connect: C,
    ) -> Result<i32>
    where
        C: FnOnce(&Config) -> Fut,
        Fut: Future<Output = Result<Arc<dyn RemoteExecution>>>,
    {
        let parsed = parse_command(argv, working_dir, &self.config);

        if !parsed.is_compiler_command && !self.config.force_remote {
            info!("not a compiler command, running locally (set REXC_FORCE_REMOTE=1 to send everything remote)");
            if self.config.no_execute {
                info!("NO_EXECUTE is enabled, exiting");
                return Ok(0);
            }
            return self.exec_locally(argv).await;
        }

        let mut blobs = BlobStore::default();
        let bundle =
            match actionbuilder::build_action(&parsed, working_dir, &mut blobs, &self.config).await
            {
                Ok(bundle) => bundle,
                Err(e)
                    if e.downcast_ref::<ParseError>().is_some()
                        || e.downcast_ref::<SubprocessError>().is_some() =>
                {
                    warn!("cannot build a remote action ({:#}), running locally", e);
                    if self.config.no_execute {
                        return Ok(0);
                    }
                    return self.exec_locally(argv).await;
                }
                Err(e) => return Err(e),
            };

        self.count(COUNTER_INPUT_SIZE_BYTES, blobs.total_size());
        self.action_digest = Some(bundle.action_digest.clone());
        debug!("action digest: {}", bundle.action_digest);

        if self.config.no_execute {
            info!(
                "NO_EXECUTE is enabled, exiting [actionDigest={}]",
                bundle.action_digest
            );
            return Ok(0);
        }

        let client = connect(&self.config).await?;

        let mut cached_result = None;
        if !self.config.skip_cache {
            let started = Instant::now();
            match client.get_action_result(&bundle.action_digest).await {
                Ok(Some(result)) => {
                    self.count(COUNTER_ACTION_CACHE_HIT, 1);
                    info!("action cache hit for [{}]", bundle.action_digest);
                    cached_result = Some(result);
                }
                Ok(None) => {
                    self.count(COUNTER_ACTION_CACHE_MISS, 1);
                }
                Err(e) => {
                    error!(
                        "error while querying the action cache: {:#}; treating as a miss",
                        e
                    );
                    self.count(COUNTER_ACTION_CACHE_MISS, 1);
                }
            }
            self.time(TIMER_QUERY_ACTION_CACHE, started);
        }

        let result = match cached_result {
            Some(result) => result,
            None => {
                if self.config.cache_only {
                    return self
                        .cache_only_local_build(
                            argv,
                            &bundle,
                            &mut blobs,
                            working_dir,
                            client.as_ref(),
                        )
                        .await;
                }

                info!(
                    "executing action remotely... [actionDigest={}]",
                    bundle.action_digest
                );
                if let Err(e) = self.upload_resources(&blobs, client.as_ref()).await {
                    error!("error while uploading resources to the CAS: {:#}", e);
                    return Err(e);
                }

                let started = Instant::now();
                let execution = client
                    .execute(
                        &bundle.action_digest,
                        self.config.skip_cache,
                        self.stop.clone(),
                    )
                    .await;
                self.time(TIMER_EXECUTE_ACTION, started);
                let result = execution?;
                info!(
                    "remote execution finished with exit code {}",
                    result.exit_code
                );
                result
            }
        };

        self.save_result(&result, &bundle, working_dir, client.as_ref())
            .await?;
        Ok(result.exit_code)
    }

    async fn exec_locally(&self, argv: &[String]) -> Result<i32> {
        let started = Instant::now();
        let result = subprocess::execute(argv, false, false, &BTreeMap::new()).await;
        self.time(TIMER_EXECUTE_ACTION, started);
        Ok(result?.exit_code)
    }

    /// Run locally with captured streams and hash everything the build
    /// produced into an ActionResult for cache upload.
    async fn exec_locally_with_action_result(
        &self,
        argv: &[String],
        products: &BTreeSet<String>,
        blobs: &mut BlobStore,
        working_dir: &Path,
    ) -> Result<proto::ActionResult> {
        let started = Instant::now();
        let run = subprocess::execute(argv, true, true, &BTreeMap::new()).await?;
        self.time(TIMER_EXECUTE_ACTION, started);

        // These are compiler output, not log lines.
        std::io::stdout().write_all(&run.stdout)?;
        std::io::stderr().write_all(&run.stderr)?;

        let digest_function = self.config.cas_digest_function;
        let stdout_digest = digest_function.make_digest(&run.stdout);
        let stderr_digest = digest_function.make_digest(&run.stderr);
        blobs.add_inline(stdout_digest.clone(), run.stdout);
        blobs.add_inline(stderr_digest.clone(), run.stderr);

        let mut result = proto::ActionResult {
            exit_code: run.exit_code,
            stdout_digest: Some(stdout_digest),
            stderr_digest: Some(stderr_digest),
            ..Default::default()
        };

        for product in products {
            let path = working_dir.join(product);
            let Ok(metadata) = fs_err::metadata(&path) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let data = fs_err::read(&path)?;
            let digest = digest_function.make_digest(&data);
            blobs.add_file(digest.clone(), path.clone());
            result.output_files.push(proto::OutputFile {
                path: product.clone(),
                digest: Some(digest),
                is_executable: is_executable(&metadata),
                contents: Vec::new(),
            });
        }
        Ok(result)
    }

    async fn cache_only_local_build(
        &mut self,
        argv: &[String],
        bundle: &ActionBundle,
        blobs: &mut BlobStore,
        working_dir: &Path,
        client: &dyn RemoteExecution,
    ) -> Result<i32> {
        info!("action not cached and cache-only mode is on, building locally");
        let upload_local_build =
            self.config.cache_upload_local_build && !self.config.action_uncacheable;
        if !upload_local_build {
            return self.exec_locally(argv).await;
        }

        // A local build needs no input files in the CAS.
        blobs.clear_files();

        let result = self
            .exec_locally_with_action_result(argv, &bundle.products, blobs, working_dir)
            .await?;

        let produced = result.output_files.len();
        if result.exit_code != 0 && !self.config.cache_upload_failed_build {
            warn!(
                "not uploading the local result: exit code {} and CACHE_UPLOAD_FAILED_BUILD is off",
                result.exit_code
            );
        } else if produced != bundle.products.len() {
            warn!(
                "not uploading the local result: {} of the expected outputs were not produced",
                bundle.products.len() - produced
            );
        } else if let Err(e) = self.upload_resources(blobs, client).await {
            // The local build still succeeded; failure to populate the
            // cache is not the user's problem.
            warn!("error while uploading the local build: {:#}", e);
        } else {
            match client
                .update_action_result(&bundle.action_digest, &result)
                .await
            {
                Ok(()) => info!("action cache updated"),
                Err(e) => warn!("error while updating the action cache: {:#}", e),
            }
        }
        Ok(result.exit_code)
    }

    /// FindMissingBlobs first, then upload only what the CAS lacks.
    async fn upload_resources(
        &self,
        blobs: &BlobStore,
        client: &dyn RemoteExecution,
    ) -> Result<()> {
        let digests = blobs.digests();
        let total = digests.len();

        let started = Instant::now();
        let missing = client.find_missing_blobs(digests).await?;
        self.time(TIMER_FIND_MISSING_BLOBS, started);

        let mut requests = Vec::with_capacity(missing.len());
        for digest in &missing {
            let request = blobs.upload_request(digest).ok_or_else(|| {
                anyhow!(
                    "FindMissingBlobs returned digest {} that is in neither blob map",
                    digest
                )
            })?;
            requests.push(request);
        }
        self.count(COUNTER_UPLOAD_BLOBS_CACHE_HIT, (total - missing.len()) as i64);
        self.count(COUNTER_UPLOAD_BLOBS_CACHE_MISS, missing.len() as i64);

        let started = Instant::now();
        client.upload_blobs(requests).await?;
        self.time(TIMER_UPLOAD_MISSING_BLOBS, started);
        Ok(())
    }

    /// Write outputs to disk and stream the remote command's stdout/stderr
    /// to ours.
    async fn save_result(
        &self,
        result: &proto::ActionResult,
        bundle: &ActionBundle,
        working_dir: &Path,
        client: &dyn RemoteExecution,
    ) -> Result<()> {
        if result.exit_code == 0 && result.output_files.is_empty() && !bundle.products.is_empty() {
            bail!("the action produced none of the expected output files");
        }

        let mut to_save = result.clone();
        if self.config.dont_save_output {
            to_save.output_files.clear();
            to_save.output_directories.clear();
            to_save.output_symlinks.clear();
        }

        // Digested stdout/stderr are fetched as synthetic output files so
        // everything arrives in a single download pass.
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let stdout_spill = format!(".rexc-stdout-{}", tag);
        let stderr_spill = format!(".rexc-stderr-{}", tag);
        let fetch_stdout = result
            .stdout_digest
            .as_ref()
            .is_some_and(|d| d.size_bytes > 0);
        let fetch_stderr = result
            .stderr_digest
            .as_ref()
            .is_some_and(|d| d.size_bytes > 0);
        if fetch_stdout {
            to_save.output_files.push(proto::OutputFile {
                path: stdout_spill.clone(),
                digest: result.stdout_digest.clone(),
                is_executable: false,
                contents: Vec::new(),
            });
        }
        if fetch_stderr {
            to_save.output_files.push(proto::OutputFile {
                path: stderr_spill.clone(),
                digest: result.stderr_digest.clone(),
                is_executable: false,
                contents: Vec::new(),
            });
        }

        let started = Instant::now();
        let downloaded = client.download_outputs(&to_save, working_dir).await;
        self.time(TIMER_DOWNLOAD_BLOBS, started);
        downloaded?;

        // Compiler output, not log lines.
        if fetch_stdout {
            let path = working_dir.join(&stdout_spill);
            let data = fs_err::read(&path)?;
            std::io::stdout().write_all(&data)?;
            let _ = fs_err::remove_file(&path);
        } else {
            std::io::stdout().write_all(&result.stdout_raw)?;
        }
        if fetch_stderr {
            let path = working_dir.join(&stderr_spill);
            let data = fs_err::read(&path)?;
            std::io::stderr().write_all(&data)?;
            let _ = fs_err::remove_file(&path);
        } else {
            std::io::stderr().write_all(&result.stderr_raw)?;
        }
        Ok(())
    }
}

fn lock(metrics: &Arc<Mutex<Metrics>>) -> std::sync::MutexGuard<'_, Metrics> {
    match metrics.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::mock_remote::MockRemote;
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        config: Config,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs_err::write(root.join("hello.c"), "int main() { return 0; }\n").unwrap();
        let mut config = Config::default();
        config.project_root = root.clone();
        config.deps_override = Some(vec!["hello.c".to_string()]);
        Fixture {
            _dir: dir,
            root,
            config,
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn context(config: Config) -> ExecutionContext {
        ExecutionContext::new(config, Arc::new(AtomicBool::new(false)))
    }

    fn connector(
        mock: Arc<MockRemote>,
    ) -> impl FnOnce(&Config) -> futures::future::Ready<Result<Arc<dyn RemoteExecution>>> {
        move |_| futures::future::ready(Ok(mock as Arc<dyn RemoteExecution>))
    }

    fn compile_result(exit_code: i32) -> proto::ActionResult {
        proto::ActionResult {
            exit_code,
            output_files: vec![proto::OutputFile {
                path: "hello.o".to_string(),
                digest: None,
                is_executable: false,
                contents: b"ELF".to_vec(),
            }],
            stdout_raw: Vec::new(),
            stderr_raw: Vec::new(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn non_compiler_commands_run_locally() {
        let fx = fixture();
        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(&strings(&["true"]), &fx.root, |_| {
                futures::future::ready(Err(anyhow!("connect must not be called")))
            })
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn cache_hit_skips_upload_and_execute() {
        let fx = fixture();
        let mock = Arc::new(MockRemote::new());
        mock.next_action_result(Ok(Some(compile_result(0))));

        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(
                &strings(&["./gcc", "-c", "hello.c", "-o", "hello.o"]),
                &fx.root,
                connector(mock.clone()),
            )
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert!(mock.uploads.lock().unwrap().is_empty());
        assert_eq!(mock.execute_calls.lock().unwrap().len(), 0);
        assert_eq!(mock.download_calls.lock().unwrap().len(), 1);
        let metrics = context.metrics();
        let metrics = metrics.lock().unwrap();
        assert_eq!(metrics.counters()[COUNTER_ACTION_CACHE_HIT], 1);
    }

    #[tokio::test]
    async fn cache_miss_uploads_then_executes() {
        let fx = fixture();
        let mock = Arc::new(MockRemote::new());
        mock.next_action_result(Ok(None));
        mock.next_execute_result(Ok(compile_result(0)));

        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(
                &strings(&["./gcc", "-c", "hello.c", "-o", "hello.o"]),
                &fx.root,
                connector(mock.clone()),
            )
            .await
            .unwrap();

        assert_eq!(code, 0);
        // Everything was missing, so everything was uploaded: the source
        // file, the input root, the Command and the Action.
        assert!(mock.uploads.lock().unwrap().len() >= 4);
        assert_eq!(mock.execute_calls.lock().unwrap().len(), 1);
        let metrics = context.metrics();
        let metrics = metrics.lock().unwrap();
        assert_eq!(metrics.counters()[COUNTER_ACTION_CACHE_MISS], 1);
        assert!(metrics.counters()[COUNTER_UPLOAD_BLOBS_CACHE_MISS] >= 4);
        assert!(metrics.counters()[COUNTER_INPUT_SIZE_BYTES] > 0);
    }

    #[tokio::test]
    async fn cache_probe_errors_degrade_to_miss() {
        let fx = fixture();
        let mock = Arc::new(MockRemote::new());
        mock.next_action_result(Err(RpcError::Status {
            code: 14,
            message: "unavailable".to_string(),
        }
        .into()));
        mock.next_execute_result(Ok(compile_result(0)));

        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(
                &strings(&["./gcc", "-c", "hello.c", "-o", "hello.o"]),
                &fx.root,
                connector(mock.clone()),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(mock.execute_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_propagates_as_cancelled() {
        let fx = fixture();
        let mock = Arc::new(MockRemote::new());
        mock.next_action_result(Ok(None));
        mock.next_execute_result(Err(RpcError::Cancelled.into()));

        let mut context = context(fx.config.clone());
        let err = context
            .execute_in(
                &strings(&["./gcc", "-c", "hello.c", "-o", "hello.o"]),
                &fx.root,
                connector(mock.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RpcError>(),
            Some(RpcError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn no_execute_builds_and_exits() {
        let mut fx = fixture();
        fx.config.no_execute = true;
        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(
                &strings(&["./gcc", "-c", "hello.c", "-o", "hello.o"]),
                &fx.root,
                |_| futures::future::ready(Err(anyhow!("connect must not be called"))),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(context.action_digest().is_some());
    }

    #[tokio::test]
    async fn parse_failures_fall_back_to_local() {
        let mut fx = fixture();
        // Force everything remote; the bare "sh" fails action construction
        // (argv[0] has no slash), so the original command runs locally.
        fx.config.force_remote = true;
        fx.config.deps_override = Some(vec![]);
        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(
                &strings(&["sh", "-c", "exit 5"]),
                &fx.root,
                |_| futures::future::ready(Err(anyhow!("connect must not be called"))),
            )
            .await
            .unwrap();
        assert_eq!(code, 5);
    }

    /// Drop an argument-less executable script into `tools/`; invoked by
    /// absolute path so the remote form keeps a slash and no positional
    /// token is mistaken for an input file.
    fn write_script(fx: &Fixture, name: &str, body: &str) -> String {
        let dir = fx.root.join("tools");
        fs_err::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs_err::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn cache_only_miss_runs_locally() {
        let mut fx = fixture();
        fx.config.force_remote = true;
        fx.config.cache_only = true;
        fx.config.deps_override = Some(vec![]);
        let script = write_script(&fx, "exit7.sh", "exit 7");
        let mock = Arc::new(MockRemote::new());
        mock.next_action_result(Ok(None));

        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(&strings(&[script.as_str()]), &fx.root, connector(mock.clone()))
            .await
            .unwrap();
        assert_eq!(code, 7);
        assert!(mock.uploads.lock().unwrap().is_empty());
        assert!(mock.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_only_uploads_successful_local_build() {
        let mut fx = fixture();
        fx.config.force_remote = true;
        fx.config.cache_only = true;
        fx.config.cache_upload_local_build = true;
        fx.config.deps_override = Some(vec![]);
        let artifact = fx.root.join("local-artifact");
        fx.config.output_files_override =
            Some(vec![artifact.to_string_lossy().into_owned()]);
        let script = write_script(&fx, "build.sh", &format!("echo built > {}", artifact.display()));

        let mock = Arc::new(MockRemote::new());
        mock.next_action_result(Ok(None));

        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(&strings(&[script.as_str()]), &fx.root, connector(mock.clone()))
            .await
            .unwrap();

        assert_eq!(code, 0);
        let updates = mock.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.exit_code, 0);
        assert_eq!(updates[0].1.output_files.len(), 1);
        // stdout/stderr digests and the artifact were uploaded.
        assert!(!mock.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_only_skips_upload_of_failed_build() {
        let mut fx = fixture();
        fx.config.force_remote = true;
        fx.config.cache_only = true;
        fx.config.cache_upload_local_build = true;
        fx.config.cache_upload_failed_build = false;
        fx.config.deps_override = Some(vec![]);
        fx.config.output_files_override = Some(vec![]);
        let script = write_script(&fx, "fail.sh", "exit 3");

        let mock = Arc::new(MockRemote::new());
        mock.next_action_result(Ok(None));

        let mut context = context(fx.config.clone());
        let code = context
            .execute_in(&strings(&[script.as_str()]), &fx.root, connector(mock.clone()))
            .await
            .unwrap();
        assert_eq!(code, 3);
        assert!(mock.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_expected_outputs_is_an_error() {
        let fx = fixture();
        let mock = Arc::new(MockRemote::new());
        // A "successful" result with no outputs at all.
        mock.next_action_result(Ok(Some(proto::ActionResult::default())));

        let mut context = context(fx.config.clone());
        let err = context
            .execute_in(
                &strings(&["./gcc", "-c", "hello.c", "-o", "hello.o"]),
                &fx.root,
                connector(mock.clone()),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected output"));
    }
}
