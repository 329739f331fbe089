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

//! Path algebra for rewriting local paths into the form the remote worker
//! sees: prefix-map resolution, project-root relativization, and lexical
//! normalization.
//!
//! Everything here is segment-wise. Raw substring comparisons would make
//! `/a/bb` look like it lives under `/a/b`.

use std::path::{Component, Path, PathBuf};

use crate::config::Config;

/// Lexically collapse `.`, `..` and duplicate slashes. `..` at the start of
/// a relative path is preserved; `..` at the root of an absolute path is
/// dropped.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = path.is_absolute();
    let mut segments: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..".as_ref());
                }
            }
            Component::Normal(seg) => segments.push(seg),
            Component::Prefix(_) => {}
        }
    }
    let mut out = PathBuf::new();
    if absolute {
        out.push("/");
    }
    for seg in segments {
        out.push(seg);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Segment-wise prefix test. No normalization is applied; trailing slashes
/// are irrelevant; an absolute prefix never matches a relative path (or vice
/// versa). A path is a prefix of itself.
pub fn has_path_prefix(path: &Path, prefix: &Path) -> bool {
    if path.is_absolute() != prefix.is_absolute() {
        return false;
    }
    let mut path_components = path.components();
    for expected in prefix.components() {
        if path_components.next() != Some(expected) {
            return false;
        }
    }
    true
}

/// True if any of `prefixes` is a segment-wise prefix of `path`.
pub fn has_path_prefixes<P: AsRef<Path>>(path: &Path, prefixes: &[P]) -> bool {
    prefixes
        .iter()
        .any(|prefix| has_path_prefix(path, prefix.as_ref()))
}

/// Number of levels above its starting directory the path can reach, e.g.
/// `a/../../b.txt` climbs one level.
pub fn parent_directory_levels(path: &Path) -> usize {
    let mut depth: i64 = 0;
    let mut min_depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                min_depth = min_depth.min(depth);
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    (-min_depth) as usize
}

/// The last `n` segments of `path`, or `None` if it has fewer than `n`.
pub fn last_n_segments(path: &Path, n: usize) -> Option<PathBuf> {
    let segments: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(seg) => Some(seg),
            _ => None,
        })
        .collect();
    if n > segments.len() {
        return None;
    }
    Some(segments[segments.len() - n..].iter().collect())
}

/// Express `path` relative to `working_dir`, ascending with `..` where
/// needed. Both arguments must be absolute; `path` is returned unchanged if
/// it is not.
pub fn make_path_relative(path: &Path, working_dir: &Path) -> PathBuf {
    if !path.is_absolute() || !working_dir.is_absolute() {
        return path.to_path_buf();
    }
    let path = normalize_path(path);
    let working_dir = normalize_path(working_dir);

    let path_segments: Vec<_> = path.components().collect();
    let wd_segments: Vec<_> = working_dir.components().collect();
    let common = path_segments
        .iter()
        .zip(wd_segments.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..wd_segments.len() {
        out.push("..");
    }
    for segment in &path_segments[common..] {
        out.push(segment);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Apply the ordered `(from, to)` prefix replacements; the first matching
/// rule wins and the result is normalized. Non-absolute paths are returned
/// unchanged.
pub fn resolve_with_prefix_map(path: &Path, prefix_map: &[(PathBuf, PathBuf)]) -> PathBuf {
    if !path.is_absolute() {
        return path.to_path_buf();
    }
    for (from, to) in prefix_map {
        if has_path_prefix(path, from) {
            let from_segments = from.components().count();
            let mut replaced = to.clone();
            for segment in path.components().skip(from_segments) {
                replaced.push(segment);
            }
            return normalize_path(&replaced);
        }
    }
    path.to_path_buf()
}

/// The canonical rewrite pipeline for paths sent to the remote:
///
/// 1. prefix-map resolution,
/// 2. relativization against `working_dir` when the (replaced) path lies
///    under the project root,
/// 3. lexical normalization (unless `normalize` is false).
///
/// Steps 1 and 2 are skipped under `no_path_rewrite`.
pub fn modify_for_remote(
    path: &Path,
    working_dir: &Path,
    normalize: bool,
    config: &Config,
) -> PathBuf {
    let mut result = path.to_path_buf();
    if !config.no_path_rewrite {
        result = resolve_with_prefix_map(&result, &config.prefix_map);
        if result.is_absolute() && has_path_prefix(&normalize_path(&result), &config.project_root) {
            result = make_path_relative(&result, working_dir);
        }
    }
    if normalize {
        result = normalize_path(&result);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    fn config_with(project_root: &str, prefix_map: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        config.project_root = PathBuf::from(project_root);
        config.prefix_map = prefix_map
            .iter()
            .map(|(from, to)| (PathBuf::from(from), PathBuf::from(to)))
            .collect();
        config
    }

    #[test]
    fn normalize_collapses_dots_and_slashes() {
        assert_eq!(normalize_path(Path::new("//a//b/./c")), Path::new("/a/b/c"));
        assert_eq!(normalize_path(Path::new("a/b/../c")), Path::new("a/c"));
        assert_eq!(normalize_path(Path::new("a/../../b")), Path::new("../b"));
        assert_eq!(normalize_path(Path::new("/../a")), Path::new("/a"));
        assert_eq!(normalize_path(Path::new("./gcc")), Path::new("gcc"));
        assert_eq!(normalize_path(Path::new(".")), Path::new("."));
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in ["//a//b/./c", "a/../../b", "/x/y/..", "subdir/../empty.c"] {
            let once = normalize_path(Path::new(p));
            assert_eq!(normalize_path(&once), once, "{}", p);
        }
    }

    #[test]
    fn path_prefix_absolute() {
        assert!(has_path_prefix(Path::new("/a/b/c/"), Path::new("/a/b")));
        assert!(has_path_prefix(Path::new("/a/b/c"), Path::new("/a/b/")));
        assert!(has_path_prefix(Path::new("/a/b/c"), Path::new("/a/b/c")));
        assert!(!has_path_prefix(Path::new("/a/c/d"), Path::new("/a/b/")));
        // Segment-wise, not substring-wise.
        assert!(!has_path_prefix(Path::new("/a/boo"), Path::new("/a/b")));
        assert!(!has_path_prefix(Path::new("/a/boo"), Path::new("/a/b/a/boo")));
    }

    #[test]
    fn path_prefix_relative_and_mixed() {
        assert!(has_path_prefix(Path::new("a/b/c"), Path::new("a/b")));
        assert!(!has_path_prefix(Path::new("a/boo"), Path::new("a/b")));
        assert!(!has_path_prefix(Path::new("/a/b/c"), Path::new("a/b")));
        assert!(!has_path_prefix(Path::new("a/b/c"), Path::new("/a/b")));
    }

    #[test]
    fn path_prefixes_set() {
        let prefixes = [PathBuf::from("/usr/include"), PathBuf::from("/opt/rh")];
        assert!(has_path_prefixes(
            Path::new("/usr/include/stat.h"),
            &prefixes
        ));
        assert!(!has_path_prefixes(
            Path::new("usr/include/stat.h"),
            &prefixes
        ));
        assert!(has_path_prefixes(Path::new("/some/dir/foo.h"), &["/"]));
    }

    #[test]
    fn parent_levels() {
        assert_eq!(parent_directory_levels(Path::new("")), 0);
        assert_eq!(parent_directory_levels(Path::new("/")), 0);
        assert_eq!(parent_directory_levels(Path::new(".")), 0);
        assert_eq!(parent_directory_levels(Path::new("..")), 1);
        assert_eq!(parent_directory_levels(Path::new("../..")), 2);
        assert_eq!(parent_directory_levels(Path::new("a/b.txt")), 0);
        assert_eq!(parent_directory_levels(Path::new("a/../../b.txt")), 1);
        assert_eq!(
            parent_directory_levels(Path::new("a/../../b/c/d/../../../../t.txt")),
            2
        );
    }

    #[test]
    fn last_segments() {
        assert_eq!(
            last_n_segments(Path::new("abc"), 1),
            Some(PathBuf::from("abc"))
        );
        assert_eq!(last_n_segments(Path::new("abc"), 2), None);
        assert_eq!(
            last_n_segments(Path::new("/a/bb/c/dd/e"), 2),
            Some(PathBuf::from("dd/e"))
        );
        assert_eq!(
            last_n_segments(Path::new("/a/bb/c/dd/e/"), 5),
            Some(PathBuf::from("a/bb/c/dd/e"))
        );
        assert_eq!(last_n_segments(Path::new("/a/bb/c/dd/e"), 6), None);
    }

    #[test]
    fn relative_paths_ascend() {
        assert_eq!(
            make_path_relative(Path::new("/home/nobody/test"), Path::new("/home/nobody")),
            Path::new("test")
        );
        assert_eq!(
            make_path_relative(Path::new("/home/nobody/test"), Path::new("/home/other/deep")),
            Path::new("../../nobody/test")
        );
        assert_eq!(
            make_path_relative(Path::new("/home"), Path::new("/home")),
            Path::new(".")
        );
    }

    #[test]
    fn prefix_map_first_match_wins() {
        let map = vec![
            (PathBuf::from("/hello/hi"), PathBuf::from("/hello")),
            (
                PathBuf::from("/usr/bin/system/bin/hello"),
                PathBuf::from("/usr/system"),
            ),
            (PathBuf::from("/bin"), PathBuf::from("/")),
        ];
        assert_eq!(
            resolve_with_prefix_map(Path::new("/hello/hi/file.txt"), &map),
            Path::new("/hello/file.txt")
        );
        assert_eq!(
            resolve_with_prefix_map(Path::new("/usr/bin/system/bin/hello/world/"), &map),
            Path::new("/usr/system/world")
        );
        assert_eq!(
            resolve_with_prefix_map(Path::new("/bin/hello/file.txt"), &map),
            Path::new("/hello/file.txt")
        );
        // Not segment-matched, not replaced.
        assert_eq!(
            resolve_with_prefix_map(Path::new("/hello/bin/x.txt"), &map),
            Path::new("/hello/bin/x.txt")
        );
        // Relative paths pass through.
        assert_eq!(
            resolve_with_prefix_map(Path::new("../hello/hi/hi.txt"), &map),
            Path::new("../hello/hi/hi.txt")
        );
    }

    #[test]
    fn modify_unmatched_stays_absolute() {
        let config = config_with("/home/nobody/", &[("/home", "/hi")]);
        assert_eq!(
            modify_for_remote(
                Path::new("/other/dir/nobody/test"),
                Path::new("/home"),
                true,
                &config
            ),
            Path::new("/other/dir/nobody/test")
        );
    }

    #[test]
    fn modify_prefix_match_outside_root_stays_absolute() {
        let config = config_with("/home/nobody/", &[("/home", "/hi")]);
        assert_eq!(
            modify_for_remote(
                Path::new("/home/nobody/test"),
                Path::new("/home"),
                true,
                &config
            ),
            Path::new("/hi/nobody/test")
        );
    }

    #[test]
    fn modify_made_relative_to_working_dir() {
        let config = config_with("/other", &[("/home", "/hi")]);
        assert_eq!(
            modify_for_remote(
                Path::new("/other/nobody/test"),
                Path::new("/other"),
                true,
                &config
            ),
            Path::new("nobody/test")
        );
    }

    #[test]
    fn modify_prefix_then_relative() {
        let config = config_with("/home/", &[("/home/nobody/", "/home")]);
        assert_eq!(
            modify_for_remote(
                Path::new("/home/nobody/test"),
                Path::new("/home"),
                true,
                &config
            ),
            Path::new("test")
        );
    }

    #[test]
    fn modify_no_rewrite_still_normalizes() {
        let mut config = config_with("/home/nobody/", &[("/home", "/hi")]);
        config.no_path_rewrite = true;
        assert_eq!(
            modify_for_remote(
                Path::new("//other/dir/nobody/test"),
                Path::new("/home"),
                true,
                &config
            ),
            Path::new("/other/dir/nobody/test")
        );
        assert_eq!(
            modify_for_remote(
                Path::new("//other/dir/nobody/test"),
                Path::new("/home"),
                false,
                &config
            ),
            Path::new("//other/dir/nobody/test")
        );
    }

    #[test]
    fn modify_is_idempotent() {
        let config = config_with("/home/", &[("/home/nobody/", "/home")]);
        let once = modify_for_remote(
            Path::new("/home/nobody/test"),
            Path::new("/home"),
            true,
            &config,
        );
        let twice = modify_for_remote(&once, Path::new("/home"), true, &config);
        assert_eq!(once, twice);
    }
}
