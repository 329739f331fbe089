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

//! Turning a parsed command into a REAPI Action: compose the input set,
//! build the canonical Merkle tree, and assemble the Command and Action
//! messages whose digests key the remote cache.

use prost::Message;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::compiler::ParsedCommand;
use crate::config::Config;
use crate::deps;
use crate::digest::DigestFunction;
use crate::errors::*;
use crate::paths;
use crate::proto;
use crate::remote::{UploadRequest, UploadSource};

/// Per-invocation blob stores: small synthesized blobs inline, input and
/// output files by path. For every digest in either map, the payload hashes
/// back to its key; duplicates across the maps resolve to the inline copy.
#[derive(Debug, Default)]
pub struct BlobStore {
    inline: HashMap<proto::Digest, Vec<u8>>,
    files: HashMap<proto::Digest, PathBuf>,
}

impl BlobStore {
    pub fn add_inline(&mut self, digest: proto::Digest, data: Vec<u8>) {
        self.inline.insert(digest, data);
    }

    pub fn add_file(&mut self, digest: proto::Digest, path: PathBuf) {
        self.files.insert(digest, path);
    }

    /// Every digest held by either map, deduplicated.
    pub fn digests(&self) -> Vec<proto::Digest> {
        let mut all: Vec<proto::Digest> = self
            .inline
            .keys()
            .chain(self.files.keys())
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn upload_request(&self, digest: &proto::Digest) -> Option<UploadRequest> {
        if let Some(data) = self.inline.get(digest) {
            return Some(UploadRequest {
                digest: digest.clone(),
                source: UploadSource::Bytes(data.clone()),
            });
        }
        self.files.get(digest).map(|path| UploadRequest {
            digest: digest.clone(),
            source: UploadSource::File(path.clone()),
        })
    }

    pub fn total_size(&self) -> i64 {
        self.digests().iter().map(|d| d.size_bytes).sum()
    }

    /// Drop the file-backed inputs; used in cache-only mode where nothing is
    /// compiled remotely.
    pub fn clear_files(&mut self) {
        self.files.clear();
    }
}

/// An Action ready for the cache probe, plus what the orchestrator needs to
/// handle its results.
#[derive(Debug)]
pub struct ActionBundle {
    pub action: proto::Action,
    pub action_digest: proto::Digest,
    pub products: BTreeSet<String>,
}

/// In-memory directory tree keyed by `BTreeMap`, so every produced
/// `Directory` message is canonically sorted by construction.
#[derive(Debug, Default)]
struct DirectoryBuilder {
    files: BTreeMap<String, (proto::Digest, bool)>,
    children: BTreeMap<String, DirectoryBuilder>,
}

impl DirectoryBuilder {
    fn insert(&mut self, location: &Path, digest: proto::Digest, executable: bool) -> Result<()> {
        let mut parts: Vec<String> = location
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let file_name = parts
            .pop()
            .ok_or_else(|| ParseError(format!("input path {:?} has no file name", location)))?;

        let mut node = self;
        for part in parts {
            node = node.children.entry(part).or_default();
        }
        node.files.insert(file_name, (digest, executable));
        Ok(())
    }

    /// Encode bottom-up; every directory blob lands in the store and the
    /// returned digest is the input root.
    fn build(&self, digest_function: DigestFunction, blobs: &mut BlobStore) -> proto::Digest {
        let mut directory = proto::Directory::default();
        for (name, child) in &self.children {
            let child_digest = child.build(digest_function, blobs);
            directory.directories.push(proto::DirectoryNode {
                name: name.clone(),
                digest: Some(child_digest),
            });
        }
        for (name, (digest, executable)) in &self.files {
            directory.files.push(proto::FileNode {
                name: name.clone(),
                digest: Some(digest.clone()),
                is_executable: *executable,
            });
        }
        let encoded = directory.encode_to_vec();
        let digest = digest_function.make_digest(&encoded);
        blobs.add_inline(digest.clone(), encoded);
        digest
    }
}

/// Build the Action for `parsed`, populating `blobs` with every referenced
/// blob (input files, directory messages, the Command and the Action
/// itself). The Action digest is the remote cache key.
pub async fn build_action(
    parsed: &ParsedCommand,
    working_dir: &Path,
    blobs: &mut BlobStore,
    config: &Config,
) -> Result<ActionBundle> {
    let executable = parsed
        .command
        .first()
        .ok_or_else(|| ParseError("cannot build an action for an empty command".to_string()))?;
    if !executable.contains('/') {
        // A bare name would be resolved against the remote worker's PATH,
        // which REAPI forbids.
        bail!(ParseError(format!(
            "invalid argv[0] \"{}\": the remote requires a relative or absolute path",
            executable
        )));
    }

    let cwd = paths::normalize_path(working_dir);
    if !paths::has_path_prefix(&cwd, &config.project_root) {
        bail!(ParseError(format!(
            "working directory {} is outside the project root {}",
            cwd.display(),
            config.project_root.display()
        )));
    }
    let relative_wd = paths::make_path_relative(&cwd, &config.project_root);
    let remote_wd = match &config.working_dir_prefix {
        Some(prefix) => paths::normalize_path(&prefix.join(&relative_wd)),
        None => relative_wd,
    };
    let working_directory = if remote_wd == Path::new(".") {
        String::new()
    } else {
        path_str(&remote_wd)
    };
    let remote_wd_depth = remote_wd
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();

    // Dependencies come from the compiler itself unless overridden; products
    // from the parse plus prediction.
    let (dependencies, predicted_products) = if config.deps_directory_override.is_some()
        || config.deps_override.is_some()
    {
        let dependencies: BTreeSet<String> =
            if let Some(dir) = &config.deps_directory_override {
                let mut set = BTreeSet::new();
                for entry in WalkDir::new(dir).follow_links(false) {
                    let entry = entry.context("failed to walk DEPS_DIRECTORY_OVERRIDE")?;
                    if entry.file_type().is_file() {
                        set.insert(path_str(entry.path()));
                    }
                }
                set
            } else {
                config
                    .deps_override
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .collect()
            };
        (dependencies, deps::predict_products(parsed)?)
    } else {
        let info = deps::get_file_info(parsed, config).await?;
        (info.dependencies, info.products)
    };

    let products: BTreeSet<String> = match &config.output_files_override {
        Some(files) => files.iter().cloned().collect(),
        None => predicted_products,
    };

    let mut inputs: BTreeSet<String> = dependencies;
    inputs.extend(parsed.input_files.iter().cloned());
    if parsed.upload_all_include_dirs {
        for dir in &parsed.include_dirs {
            let dir_path = Path::new(dir);
            let local_root = if dir_path.is_absolute() {
                dir_path.to_path_buf()
            } else {
                working_dir.join(dir_path)
            };
            for entry in WalkDir::new(&local_root).follow_links(false) {
                let entry = entry
                    .with_context(|| format!("failed to walk include dir {}", dir))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let suffix = entry
                    .path()
                    .strip_prefix(&local_root)
                    .expect("walkdir stays under its root");
                inputs.insert(path_str(&dir_path.join(suffix)));
            }
        }
    }

    let mut tree = DirectoryBuilder::default();
    for input in &inputs {
        let local = Path::new(input);
        if paths::has_path_prefixes(&paths::normalize_path(local), &config.deps_exclude_paths) {
            debug!("input {} excluded by DEPS_EXCLUDE_PATHS", input);
            continue;
        }

        let local_abs = if local.is_absolute() {
            local.to_path_buf()
        } else {
            working_dir.join(local)
        };

        let remote = paths::modify_for_remote(local, working_dir, true, config);
        let location = if remote.is_absolute() {
            // A rewritten path stays absolute either because the file lives
            // outside the project, or merely because NO_PATH_REWRITE turned
            // relativization off for an in-project file. DEPS_GLOBAL_PATHS
            // gates only the former; in-project inputs always travel.
            let outside_project = !paths::has_path_prefix(
                &paths::normalize_path(&local_abs),
                &config.project_root,
            );
            if outside_project && !config.deps_global_paths {
                debug!("skipping system dependency {}", input);
                continue;
            }
            // Root-anchored: the worker materializes the input root as its
            // filesystem root, so /usr/include/x.h lives at usr/include/x.h.
            remote
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect::<PathBuf>()
        } else {
            if paths::parent_directory_levels(&remote) > remote_wd_depth {
                bail!(ParseError(format!(
                    "input {} escapes the input root",
                    input
                )));
            }
            paths::normalize_path(&remote_wd.join(&remote))
        };

        let data = fs_err::read(&local_abs)?;
        let digest = config.cas_digest_function.make_digest(&data);
        let executable = is_executable(&local_abs);
        blobs.add_file(digest.clone(), local_abs);
        tree.insert(&location, digest, executable)?;
    }

    let input_root_digest = tree.build(config.cas_digest_function, blobs);

    let environment_variables: Vec<proto::command::EnvironmentVariable> = config
        .remote_environment()
        .into_iter()
        .map(|(name, value)| proto::command::EnvironmentVariable { name, value })
        .collect();
    let platform = if config.remote_platform.is_empty() {
        None
    } else {
        Some(proto::Platform {
            properties: config
                .remote_platform
                .iter()
                .map(|(name, value)| proto::platform::Property {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        })
    };
    let mut output_directories: Vec<String> = config
        .output_directories_override
        .clone()
        .unwrap_or_default();
    output_directories.sort();

    let command = proto::Command {
        arguments: parsed.command.clone(),
        environment_variables,
        output_files: products.iter().cloned().collect(),
        output_directories,
        platform,
        working_directory,
    };
    let command_digest = config.cas_digest_function.make_digest_of_message(&command);
    blobs.add_inline(command_digest.clone(), command.encode_to_vec());

    let action = proto::Action {
        command_digest: Some(command_digest),
        input_root_digest: Some(input_root_digest),
        timeout: None,
        do_not_cache: config.action_uncacheable,
        salt: Vec::new(),
    };
    let action_digest = config.cas_digest_function.make_digest_of_message(&action);
    blobs.add_inline(action_digest.clone(), action.encode_to_vec());

    Ok(ActionBundle {
        action,
        action_digest,
        products,
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs_err::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
