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

//! Compiler dialect detection and the parsed form of a compiler invocation.

use std::collections::BTreeSet;
use std::path::Path;
use tempfile::NamedTempFile;

pub mod parse;
pub mod rules;

pub use parse::parse_command;

/// A family of compilers sharing a flag grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    Gcc,
    Clang,
    SunCpp,
    Aix,
    #[default]
    Unknown,
}

const GCC_COMPILERS: &[&str] = &["gcc", "g++"];
const CLANG_COMPILERS: &[&str] = &["clang", "clang++"];
const SUN_CPP_COMPILERS: &[&str] = &["CC"];
const AIX_COMPILERS: &[&str] = &["xlc", "xlc++", "xlC", "xlCcore", "xlc++core"];
/// Basenames shared by several toolchains; resolved to the platform default.
const AMBIGUOUS_COMPILERS: &[&str] = &["cc", "c++"];

/// What an unqualified `cc` means on the build platform.
const PLATFORM_DEFAULT_DIALECT: Dialect = Dialect::Gcc;

/// Input languages `-x` may select for remote compilation.
pub const GCC_SUPPORTED_LANGUAGES: &[&str] = &["c", "c++", "c-header", "c++-header"];

impl Dialect {
    pub fn classify(basename: &str) -> Dialect {
        if GCC_COMPILERS.contains(&basename) {
            Dialect::Gcc
        } else if CLANG_COMPILERS.contains(&basename) {
            Dialect::Clang
        } else if SUN_CPP_COMPILERS.contains(&basename) {
            Dialect::SunCpp
        } else if AIX_COMPILERS.contains(&basename) {
            Dialect::Aix
        } else if AMBIGUOUS_COMPILERS.contains(&basename) {
            PLATFORM_DEFAULT_DIALECT
        } else {
            Dialect::Unknown
        }
    }

    pub fn is_gcc_family(&self) -> bool {
        matches!(self, Dialect::Gcc | Dialect::Clang)
    }

    /// Sun and AIX compilers emit one dependency per line with unescaped
    /// spaces instead of GNU make rules.
    pub fn produces_sun_make_rules(&self) -> bool {
        matches!(self, Dialect::SunCpp | Dialect::Aix)
    }
}

/// Convert a compiler path (e.g. `/usr/bin/gcc-4.7` or `./xlc++_r`) to a
/// bare compiler name (`gcc`, `xlc++`): strip the directory, a trailing
/// `_r`, and any trailing run of version characters `[0-9.-]`.
pub fn command_basename(path: &str) -> &str {
    let basename = match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    };
    let mut len = basename.len();

    if len > 2 && &basename[len - 2..] == "_r" {
        len -= 2;
    } else if len > 3 && &basename[len - 3..len - 1] == "_r" {
        len -= 3;
    }

    let is_version_char = |c: char| c.is_ascii_digit() || c == '.' || c == '-';
    while len > 0 && basename[..len].ends_with(is_version_char) {
        len -= 1;
    }

    &basename[..len]
}

/// The parsed form of one compiler invocation. Built once by
/// [`parse_command`], immutable afterwards. Owns the AIX dependency temp
/// file, which is removed when the `ParsedCommand` is dropped.
#[derive(Debug, Default)]
pub struct ParsedCommand {
    pub compiler_basename: String,
    pub dialect: Dialect,
    /// True only if a compile option was seen and nothing unsupported was.
    pub is_compiler_command: bool,
    /// The argv sent to the remote, with paths rewritten.
    pub command: Vec<String>,
    /// The argv run locally to emit make-style dependency rules.
    pub dependencies_command: Vec<String>,
    /// Positional inputs, in order, unrewritten.
    pub input_files: Vec<String>,
    /// Output artifacts named by `-o`-style flags (rewritten).
    pub products: BTreeSet<String>,
    /// Deps-output artifacts named by `-MF`-style flags (rewritten).
    pub deps_products: BTreeSet<String>,
    /// Include directories that exist locally (rewritten).
    pub include_dirs: BTreeSet<String>,
    pub md_option_set: bool,
    pub upload_all_include_dirs: bool,
    pub contains_unsupported_options: bool,
    pub produces_sun_make_rules: bool,
    pub(crate) default_deps_command: Vec<String>,
    pub(crate) aix_deps_file: Option<NamedTempFile>,
}

impl ParsedCommand {
    pub fn is_clang(&self) -> bool {
        self.dialect == Dialect::Clang
    }

    pub fn is_aix(&self) -> bool {
        self.aix_deps_file.is_some()
    }

    /// Path the AIX compiler writes dependency rules to, if this is an AIX
    /// command.
    pub fn aix_deps_file_path(&self) -> Option<&Path> {
        self.aix_deps_file.as_ref().map(|f| f.path())
    }
}
