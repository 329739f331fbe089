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

//! Dependency discovery: run the compiler's own deps command, parse its
//! make-rule output, and predict the products the compile will write.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;

use crate::compiler::ParsedCommand;
use crate::config::Config;
use crate::errors::*;
use crate::paths;
use crate::subprocess;

const HEADER_SUFFIXES: &[&str] = &["h", "hh", "H", "hp", "hxx", "hpp", "HPP", "h++", "tcc"];
const SOURCE_SUFFIXES: &[&str] = &["cc", "c", "cp", "cxx", "cpp", "CPP", "c++", "C"];

#[derive(Debug, Default)]
pub struct CommandFileInfo {
    pub dependencies: BTreeSet<String>,
    /// Normalized paths of everything the command may produce.
    pub products: BTreeSet<String>,
}

/// Extract the set of dependency paths from make-rule text.
///
/// The GNU variant understands `target: dep dep \` rules with backslash
/// continuations and `\<char>` escapes (so `\ ` is a literal space). The Sun
/// variant (`is_sun_format`) is one dependency per line with literal,
/// unescaped spaces.
pub fn dependencies_from_make_rules(rules: &str, is_sun_format: bool) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    let mut saw_colon_on_line = false;
    let mut saw_backslash = false;
    let mut current = String::new();

    for character in rules.chars() {
        if saw_backslash {
            saw_backslash = false;
            if character != '\n' && saw_colon_on_line {
                current.push(character);
            }
        } else if character == '\\' {
            saw_backslash = true;
        } else if character == ':' && !saw_colon_on_line {
            saw_colon_on_line = true;
        } else if character == '\n' {
            saw_colon_on_line = false;
            if !current.is_empty() {
                result.insert(std::mem::take(&mut current));
            }
        } else if character == ' ' {
            if is_sun_format {
                if !current.is_empty() && saw_colon_on_line {
                    current.push(character);
                }
            } else if !current.is_empty() {
                result.insert(std::mem::take(&mut current));
            }
        } else if saw_colon_on_line {
            current.push(character);
        }
    }

    if !current.is_empty() {
        result.insert(current);
    }
    result
}

/// Locate the crtbegin.o clang reports having selected under `-v`.
///
/// Clang adjusts its system include paths based on where it finds a GCC
/// installation, so that file has to travel with the inputs. A `.` multilib
/// is collapsed to avoid a redundant path segment.
pub fn crtbegin_from_clang_v(stderr: &str) -> Option<String> {
    static INSTALLATION: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?m)^Selected GCC installation: (.*)$").unwrap());
    static MULTILIB: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?m)^Selected multilib: ([^;\n]*)").unwrap());

    let installation = INSTALLATION.captures(stderr)?.get(1)?.as_str().to_string();
    let multilib = MULTILIB.captures(stderr)?.get(1)?.as_str();

    let crtbegin = if multilib == "." {
        format!("{}/crtbegin.o", installation)
    } else {
        format!("{}/{}/crtbegin.o", installation, multilib)
    };
    debug!("found crtbegin.o for clang: {}", crtbegin);
    Some(crtbegin)
}

/// Run the deps command locally and assemble the full file picture: the
/// dependency closure reported by the compiler plus the predicted products.
pub async fn get_file_info(parsed: &ParsedCommand, config: &Config) -> Result<CommandFileInfo> {
    let result = subprocess::execute(&parsed.dependencies_command, true, true, &config.deps_env)
        .await
        .context("failed to run dependencies command")?;

    if result.exit_code != 0 {
        error!(
            "dependencies command failed with status {}: {:?}",
            result.exit_code, parsed.dependencies_command
        );
        debug!("stdout: {}", String::from_utf8_lossy(&result.stdout));
        debug!("stderr: {}", String::from_utf8_lossy(&result.stderr));
        bail!(SubprocessError::Failed(result.exit_code));
    }

    // The AIX compiler writes its rules to the scoped temp file rather than
    // stdout.
    let rules = match parsed.aix_deps_file_path() {
        Some(path) => fs_err::read_to_string(path)?,
        None => String::from_utf8_lossy(&result.stdout).into_owned(),
    };

    let mut dependencies = dependencies_from_make_rules(&rules, parsed.produces_sun_make_rules);

    if config.deps_global_paths && parsed.is_clang() {
        if let Some(crtbegin) = crtbegin_from_clang_v(&String::from_utf8_lossy(&result.stderr)) {
            dependencies.insert(crtbegin);
        }
    }

    Ok(CommandFileInfo {
        dependencies,
        products: predict_products(parsed)?,
    })
}

/// The normalized set of everything the command will write: explicit
/// products (or predictions when there are none) plus the deps outputs
/// implied by -MD/-MMD without an explicit -MF.
pub fn predict_products(parsed: &ParsedCommand) -> Result<BTreeSet<String>> {
    let deps_products: BTreeSet<String> =
        if parsed.deps_products.is_empty() && parsed.md_option_set {
            parsed
                .products
                .iter()
                .map(|product| format!("{}.d", strip_extension(product)))
                .collect()
        } else {
            parsed.deps_products.clone()
        };

    let mut products = if !parsed.products.is_empty() {
        parsed.products.clone()
    } else {
        determine_products(parsed)?
    };
    products.extend(deps_products);

    Ok(products
        .iter()
        .map(|product| path_str(&paths::normalize_path(Path::new(product))))
        .collect())
}

/// Predict outputs when the command names none: `stem.o` for sources,
/// `file.gch` for precompiled headers, `a.out` for non-compile commands.
pub fn determine_products(parsed: &ParsedCommand) -> Result<BTreeSet<String>> {
    if !parsed.is_compiler_command {
        return Ok(["a.out".to_string()].into_iter().collect());
    }

    let mut result = BTreeSet::new();
    for input in &parsed.input_files {
        let file_name = match input.rfind('/') {
            Some(idx) => &input[idx + 1..],
            None => input.as_str(),
        };
        let stem = strip_extension(file_name);

        if parsed.md_option_set && parsed.deps_products.is_empty() {
            result.insert(format!("{}.d", stem));
        }

        if is_header_file(file_name) {
            result.insert(format!("{}.gch", file_name));
        } else if is_source_file(file_name) {
            result.insert(format!("{}.o", stem));
        } else {
            bail!(ParseError(format!(
                "file {} uses a file suffix unsupported for caching",
                file_name
            )));
        }
    }
    Ok(result)
}

fn is_header_file(file: &str) -> bool {
    suffix_of(file).is_some_and(|suffix| HEADER_SUFFIXES.contains(&suffix))
}

fn is_source_file(file: &str) -> bool {
    suffix_of(file).is_some_and(|suffix| SOURCE_SUFFIXES.contains(&suffix))
}

fn suffix_of(file: &str) -> Option<&str> {
    file.rfind('.').map(|idx| &file[idx + 1..])
}

fn strip_extension(file: &str) -> &str {
    match file.rfind('.') {
        Some(idx) => &file[..idx],
        None => file,
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
