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

//! End-to-end tests over the public pipeline: parse a compiler command,
//! discover dependencies through a stand-in compiler, and build the Action.

use std::path::{Path, PathBuf};

use rexc::actionbuilder::{build_action, BlobStore};
use rexc::compiler::parse_command;
use rexc::config::Config;
use rexc::deps;
use rexc::errors::ParseError;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn config_rooted_at(root: &str) -> Config {
    let mut config = Config::default();
    config.project_root = PathBuf::from(root);
    config
}

#[test]
fn gcc_command_is_rewritten_for_the_remote() {
    let config = config_rooted_at("/home/nobody/");
    let parsed = parse_command(
        &strings(&[
            "gcc",
            "-c",
            "/home/nobody/test/hello.c",
            "-I/home/nobody/test/include/user.h",
        ]),
        Path::new("/home/nobody/"),
        &config,
    );

    assert!(parsed.is_compiler_command);
    assert_eq!(
        parsed.command,
        strings(&["gcc", "-c", "test/hello.c", "-Itest/include/user.h"])
    );
    assert_eq!(
        parsed.dependencies_command,
        strings(&[
            "gcc",
            "-c",
            "/home/nobody/test/hello.c",
            "-I/home/nobody/test/include/user.h",
            "-M"
        ])
    );
}

#[test]
fn unsupported_language_is_not_a_compiler_command() {
    let config = config_rooted_at("/home/nobody/");
    let parsed = parse_command(
        &strings(&["gcc", "-x", "assembler", "-c", "hello.c"]),
        Path::new("/home/nobody/"),
        &config,
    );
    assert!(parsed.contains_unsupported_options);
    assert!(!parsed.is_compiler_command);
}

#[test]
fn md_flag_adds_a_deps_product() {
    let config = config_rooted_at("/home/nobody/");
    let parsed = parse_command(
        &strings(&["gcc", "-c", "empty.c", "-MD"]),
        Path::new("/home/nobody/"),
        &config,
    );
    let products = deps::predict_products(&parsed).unwrap();
    let expected: std::collections::BTreeSet<String> =
        ["empty.o", "empty.d"].iter().map(|s| s.to_string()).collect();
    assert_eq!(products, expected);
}

#[test]
fn explicit_deps_output_replaces_the_default() {
    let config = config_rooted_at("/home/nobody/");
    let parsed = parse_command(
        &strings(&["gcc", "-c", "empty.c", "-MD", "-MF", "outputfile"]),
        Path::new("/home/nobody/"),
        &config,
    );
    let products = deps::predict_products(&parsed).unwrap();
    let expected: std::collections::BTreeSet<String> = ["empty.o", "outputfile"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(products, expected);
}

#[test]
fn linking_defaults_to_a_out() {
    let config = config_rooted_at("/home/nobody/");
    let parsed = parse_command(
        &strings(&["gcc", "subdirectory/empty.c"]),
        Path::new("/home/nobody/"),
        &config,
    );
    assert!(!parsed.is_compiler_command);
    let products = deps::determine_products(&parsed).unwrap();
    assert_eq!(products, ["a.out".to_string()].into_iter().collect());
}

#[test]
fn unsupported_suffix_is_rejected() {
    let config = config_rooted_at("/home/nobody/");
    let parsed = parse_command(
        &strings(&["gcc", "-c", "empty.i"]),
        Path::new("/home/nobody/"),
        &config,
    );
    let err = deps::predict_products(&parsed).unwrap_err();
    assert!(err.downcast_ref::<ParseError>().is_some());
}

/// A project with a stand-in `gcc` that emits make rules, driven through
/// dependency discovery and action construction.
struct Project {
    _dir: tempfile::TempDir,
    root: PathBuf,
    config: Config,
    /// Absolute path of the stand-in compiler; invoking it by absolute path
    /// keeps dependency discovery independent of the test process's working
    /// directory.
    compiler: String,
}

impl Project {
    fn compile_argv(&self) -> Vec<String> {
        strings(&[&self.compiler, "-c", "hello.c"])
    }
}

fn project() -> Project {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();

    fs_err::write(root.join("hello.c"), "#include \"hello.h\"\nint main(){}\n").unwrap();
    fs_err::write(root.join("hello.h"), "#pragma once\n").unwrap();
    fs_err::create_dir_all(root.join("tools")).unwrap();
    let compiler = root.join("tools/gcc");
    fs_err::write(&compiler, "#!/bin/sh\nprintf 'hello.o: hello.c hello.h\\n'\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs_err::set_permissions(&compiler, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut config = Config::default();
    config.project_root = root.clone();
    Project {
        _dir: dir,
        root,
        config,
        compiler: compiler.to_string_lossy().into_owned(),
    }
}

#[tokio::test]
async fn deps_discovery_feeds_the_input_root() {
    let project = project();
    let parsed = parse_command(&project.compile_argv(), &project.root, &project.config);
    assert!(parsed.is_compiler_command);
    assert_eq!(parsed.command[0], "tools/gcc");

    let info = deps::get_file_info(&parsed, &project.config).await.unwrap();
    let expected: std::collections::BTreeSet<String> = ["hello.c", "hello.h"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(info.dependencies, expected);
    assert_eq!(info.products, ["hello.o".to_string()].into_iter().collect());

    let mut blobs = BlobStore::default();
    let bundle = build_action(&parsed, &project.root, &mut blobs, &project.config)
        .await
        .unwrap();
    assert_eq!(
        bundle.products,
        ["hello.o".to_string()].into_iter().collect()
    );

    // Both source files, the input root directory, the Command and the
    // Action are all in the blob store, resolvable by digest.
    let digests = blobs.digests();
    assert!(digests.len() >= 5);
    for digest in &digests {
        assert!(blobs.upload_request(digest).is_some());
    }
    assert!(digests.contains(&bundle.action_digest));
}

#[tokio::test]
async fn action_digests_are_reproducible() {
    let project = project();
    let parsed = parse_command(&project.compile_argv(), &project.root, &project.config);

    let mut first_blobs = BlobStore::default();
    let first = build_action(&parsed, &project.root, &mut first_blobs, &project.config)
        .await
        .unwrap();
    let mut second_blobs = BlobStore::default();
    let second = build_action(&parsed, &project.root, &mut second_blobs, &project.config)
        .await
        .unwrap();

    assert_eq!(first.action_digest, second.action_digest);
    assert_eq!(first_blobs.digests(), second_blobs.digests());
}

#[tokio::test]
async fn changing_a_source_changes_the_action_digest() {
    let project = project();
    let parsed = parse_command(&project.compile_argv(), &project.root, &project.config);

    let mut blobs = BlobStore::default();
    let before = build_action(&parsed, &project.root, &mut blobs, &project.config)
        .await
        .unwrap();

    fs_err::write(
        project.root.join("hello.h"),
        "#pragma once\n#define CHANGED 1\n",
    )
    .unwrap();
    let mut blobs = BlobStore::default();
    let after = build_action(&parsed, &project.root, &mut blobs, &project.config)
        .await
        .unwrap();

    assert_ne!(before.action_digest, after.action_digest);
}

#[tokio::test]
async fn remote_environment_changes_the_action_digest() {
    let mut project = project();
    let parsed = parse_command(&project.compile_argv(), &project.root, &project.config);

    let mut blobs = BlobStore::default();
    let plain = build_action(&parsed, &project.root, &mut blobs, &project.config)
        .await
        .unwrap();

    project
        .config
        .remote_env
        .insert("LANG".to_string(), "C".to_string());
    let mut blobs = BlobStore::default();
    let with_env = build_action(&parsed, &project.root, &mut blobs, &project.config)
        .await
        .unwrap();

    assert_ne!(plain.action_digest, with_env.action_digest);
}
