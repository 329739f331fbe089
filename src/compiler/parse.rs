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

//! The dialect-dispatched argv parser.
//!
//! Walks the command as a work queue, dispatching each token on the
//! dialect's rule table. Produces both the rewritten remote command and the
//! locally-run dependencies command in one pass.

use std::collections::VecDeque;
use std::path::Path;
use tempfile::NamedTempFile;

use super::rules::{self, ParseRule, RuleTable};
use super::{command_basename, Dialect, ParsedCommand, GCC_SUPPORTED_LANGUAGES};
use crate::config::Config;
use crate::paths;

/// Parse `argv` into a [`ParsedCommand`]. Never fails: anything that cannot
/// be understood comes back with `is_compiler_command == false` so the
/// caller runs it locally.
pub fn parse_command(argv: &[String], working_dir: &Path, config: &Config) -> ParsedCommand {
    if argv.is_empty() || argv[0].is_empty() {
        return ParsedCommand::default();
    }

    let mut parsed = seed(argv, working_dir, config);
    let table = rules::rules_for_dialect(parsed.dialect);
    let mut queue: VecDeque<String> = argv[1..].to_vec().into();
    let mut preprocessor_options = Vec::new();

    run_parse(
        &mut parsed,
        &mut queue,
        table,
        working_dir,
        config,
        &mut preprocessor_options,
    );

    if parsed.contains_unsupported_options {
        parsed.is_compiler_command = false;
        return parsed;
    }

    // Tokens collected from -Wp,/-Xpreprocessor get a second parse under the
    // preprocessor table and are re-emitted one by one behind
    // -Xpreprocessor, which is the only spelling the remote compiler will
    // accept for them.
    if !preprocessor_options.is_empty() {
        let mut sub = ParsedCommand::default();
        let mut sub_queue: VecDeque<String> = preprocessor_options.into();
        let mut nested = Vec::new();
        run_parse(
            &mut sub,
            &mut sub_queue,
            rules::GCC_PREPROCESSOR_RULES,
            working_dir,
            config,
            &mut nested,
        );

        for token in sub.command {
            parsed.command.push("-Xpreprocessor".to_string());
            parsed.command.push(token);
        }
        for token in sub.dependencies_command {
            parsed.dependencies_command.push("-Xpreprocessor".to_string());
            parsed.dependencies_command.push(token);
        }
        parsed.products.extend(sub.products);
        parsed.deps_products.extend(sub.deps_products);
        parsed.md_option_set |= sub.md_option_set;
        if sub.contains_unsupported_options {
            parsed.contains_unsupported_options = true;
            parsed.is_compiler_command = false;
            return parsed;
        }
    }

    let tail = parsed.default_deps_command.clone();
    parsed.dependencies_command.extend(tail);
    parsed
}

/// Classify the compiler and seed both command vectors with it.
fn seed(argv: &[String], working_dir: &Path, config: &Config) -> ParsedCommand {
    let compiler = &argv[0];
    let basename = command_basename(compiler).to_string();
    let dialect = Dialect::classify(&basename);

    let mut parsed = ParsedCommand {
        compiler_basename: basename,
        dialect,
        ..Default::default()
    };

    match dialect {
        Dialect::Gcc | Dialect::Clang => {
            parsed.default_deps_command = vec!["-M".to_string()];
        }
        Dialect::SunCpp => {
            parsed.default_deps_command = vec!["-xM".to_string()];
            parsed.produces_sun_make_rules = true;
        }
        Dialect::Aix => {
            parsed.produces_sun_make_rules = true;
            // The AIX compiler writes dependency rules to a file, never to
            // stdout; give it one scoped to this invocation.
            match NamedTempFile::new() {
                Ok(file) => {
                    parsed.default_deps_command = vec![
                        "-qmakedep=gcc".to_string(),
                        "-MF".to_string(),
                        file.path().to_string_lossy().into_owned(),
                    ];
                    parsed.aix_deps_file = Some(file);
                }
                Err(e) => {
                    warn!("cannot create AIX dependency file: {}", e);
                    parsed.contains_unsupported_options = true;
                }
            }
        }
        Dialect::Unknown => {}
    }

    if dialect == Dialect::Clang && config.deps_global_paths {
        // Clang logs its selected GCC installation to stderr under -v; the
        // dependency discoverer scrapes crtbegin.o from there.
        parsed.default_deps_command.push("-v".to_string());
    }

    // The compiler path is rewritten for the remote but not normalized:
    // normalizing "./gcc" to "gcc" would turn a relative path into a PATH
    // lookup, which REAPI forbids.
    let remote_compiler = paths::modify_for_remote(Path::new(compiler), working_dir, false, config);
    parsed.command.push(path_str(&remote_compiler));
    parsed.dependencies_command.push(compiler.clone());

    parsed
}

fn run_parse(
    parsed: &mut ParsedCommand,
    queue: &mut VecDeque<String>,
    table: RuleTable,
    working_dir: &Path,
    config: &Config,
    preprocessor_options: &mut Vec<String>,
) {
    while let Some(token) = queue.front().cloned() {
        match rules::match_compiler_option(&token, table) {
            Some((flag, rule)) => apply_rule(
                parsed,
                queue,
                rule,
                flag,
                working_dir,
                config,
                preprocessor_options,
            ),
            None if token == "-" => {
                warn!("compiling from standard input is not supported");
                parsed.contains_unsupported_options = true;
                queue.pop_front();
            }
            None if token.starts_with('-') => {
                // No rule for this option: forward it to the remote
                // unchanged. It is withheld from the deps command, which
                // only needs enough of the original to produce make rules.
                parsed.command.push(token);
                queue.pop_front();
            }
            None => {
                let rewritten =
                    paths::modify_for_remote(Path::new(&token), working_dir, true, config);
                parsed.command.push(path_str(&rewritten));
                parsed.dependencies_command.push(token.clone());
                parsed.input_files.push(token);
                queue.pop_front();
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum PathDisposition {
    Input,
    Output,
    DepsOutput,
}

fn apply_rule(
    parsed: &mut ParsedCommand,
    queue: &mut VecDeque<String>,
    rule: ParseRule,
    flag: &str,
    working_dir: &Path,
    config: &Config,
    preprocessor_options: &mut Vec<String>,
) {
    match rule {
        ParseRule::InterferesWithDeps => {
            let token = queue.pop_front().unwrap();
            if token == "-MD" || token == "-MMD" {
                parsed.md_option_set = true;
            } else if token == "-Wmissing-include-dirs"
                || token == "-Werror=missing-include-dirs"
            {
                parsed.upload_all_include_dirs = true;
            }
            parsed.command.push(token);
        }
        ParseRule::Compile => {
            parsed.is_compiler_command = true;
            let token = queue.pop_front().unwrap();
            parsed.command.push(token.clone());
            parsed.dependencies_command.push(token);
        }
        ParseRule::Macro => {
            // -Dname, -Dname=def, -D name, -D name=def.
            let token = queue.pop_front().unwrap();
            parsed.command.push(token.clone());
            parsed.dependencies_command.push(token.clone());
            if token == flag {
                if let Some(arg) = queue.pop_front() {
                    parsed.command.push(arg.clone());
                    parsed.dependencies_command.push(arg);
                }
            }
        }
        ParseRule::RedirectsOutput => parse_path_option(
            parsed,
            queue,
            flag,
            working_dir,
            config,
            PathDisposition::Output,
        ),
        ParseRule::RedirectsDepsOutput => parse_path_option(
            parsed,
            queue,
            flag,
            working_dir,
            config,
            PathDisposition::DepsOutput,
        ),
        ParseRule::InputPath | ParseRule::EqInputPath => parse_path_option(
            parsed,
            queue,
            flag,
            working_dir,
            config,
            PathDisposition::Input,
        ),
        ParseRule::DepsRuleTarget => {
            // The argument is a make-rule target name, not a path; keep it
            // for the remote and leave the deps run alone.
            let token = queue.pop_front().unwrap();
            parsed.command.push(token.clone());
            if token == flag {
                if let Some(target) = queue.pop_front() {
                    parsed.command.push(target);
                }
            }
        }
        ParseRule::PreprocessorArg => {
            let token = queue.pop_front().unwrap();
            if flag == "-Wp," {
                parse_stage_option_list(&token[flag.len()..], preprocessor_options);
            } else if let Some(arg) = queue.pop_front() {
                preprocessor_options.push(arg);
            }
        }
        ParseRule::SetsGccLanguage => {
            let token = queue.pop_front().unwrap();
            let language = if token == flag {
                match queue.front() {
                    Some(lang) => lang.clone(),
                    None => {
                        warn!("\"{}\" requires a language argument", flag);
                        parsed.contains_unsupported_options = true;
                        return;
                    }
                }
            } else {
                // Glued, e.g. "-xassembler". gcc's -x has no equals form.
                token[flag.len()..].to_string()
            };

            if !GCC_SUPPORTED_LANGUAGES.contains(&language.as_str()) {
                warn!("language [{}] is not supported for remote builds", language);
                parsed.contains_unsupported_options = true;
            }

            parsed.command.push(token.clone());
            parsed.dependencies_command.push(token.clone());
            if token == flag {
                let lang = queue.pop_front().unwrap();
                parsed.command.push(lang.clone());
                parsed.dependencies_command.push(lang);
            }
        }
        ParseRule::Unsupported => {
            parsed.contains_unsupported_options = true;
            // Keep the remainder verbatim in both vectors and stop parsing;
            // the command will run locally in its original form.
            for token in queue.drain(..) {
                parsed.command.push(token.clone());
                parsed.dependencies_command.push(token);
            }
        }
    }
}

/// Shared handling for flags whose argument is a path, in split (`-I dir`),
/// glued (`-Idir`), and equals (`--sysroot=dir`) spellings.
fn parse_path_option(
    parsed: &mut ParsedCommand,
    queue: &mut VecDeque<String>,
    flag: &str,
    working_dir: &Path,
    config: &Config,
    disposition: PathDisposition,
) {
    let to_deps = disposition == PathDisposition::Input;
    let token = queue.pop_front().unwrap();

    if token == flag {
        parsed.command.push(token.clone());
        if to_deps {
            parsed.dependencies_command.push(token);
        }
        let Some(path) = queue.pop_front() else {
            return;
        };
        let replaced = path_str(&paths::modify_for_remote(
            Path::new(&path),
            working_dir,
            true,
            config,
        ));
        match disposition {
            PathDisposition::Input => {
                record_include_dir(parsed, &path, &replaced);
                parsed.command.push(replaced);
                parsed.dependencies_command.push(path);
            }
            PathDisposition::Output => {
                parsed.command.push(replaced.clone());
                parsed.products.insert(replaced);
            }
            PathDisposition::DepsOutput => {
                parsed.command.push(replaced.clone());
                parsed.deps_products.insert(replaced);
            }
        }
    } else {
        let (spelled_flag, local_path) = match token.find('=') {
            Some(eq) => (format!("{}=", flag), token[eq + 1..].to_string()),
            None => (flag.to_string(), token[flag.len()..].to_string()),
        };
        let replaced = path_str(&paths::modify_for_remote(
            Path::new(&local_path),
            working_dir,
            true,
            config,
        ));
        match disposition {
            PathDisposition::Input => {
                record_include_dir(parsed, &local_path, &replaced);
                parsed
                    .command
                    .push(format!("{}{}", spelled_flag, replaced));
                parsed
                    .dependencies_command
                    .push(format!("{}{}", spelled_flag, local_path));
            }
            PathDisposition::Output => {
                parsed
                    .command
                    .push(format!("{}{}", spelled_flag, replaced));
                parsed.products.insert(replaced);
            }
            PathDisposition::DepsOutput => {
                parsed
                    .command
                    .push(format!("{}{}", spelled_flag, replaced));
                parsed.deps_products.insert(replaced);
            }
        }
    }
}

fn record_include_dir(parsed: &mut ParsedCommand, local_path: &str, replaced: &str) {
    if paths::normalize_path(Path::new(local_path)).is_dir() {
        parsed.include_dirs.insert(replaced.to_string());
    }
}

/// Split a `-Wp,`-style comma list, honoring single quotes.
fn parse_stage_option_list(list: &str, out: &mut Vec<String>) {
    let mut quoted = false;
    let mut current = String::new();
    for c in list.chars() {
        match c {
            '\'' => quoted = !quoted,
            ',' if !quoted => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
