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

//! Per-dialect parse rule tables.
//!
//! Each table maps a flag to the [`ParseRule`] the parser dispatches on.
//! Tables are ordered slices: exact matches are tried first, then the first
//! entry whose flag is a prefix of the token wins, so specific flags must be
//! listed before the flags they extend (`-MF` before `-M`).

use super::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseRule {
    /// Kept in the remote command only; would corrupt the deps run.
    InterferesWithDeps,
    /// Marks the invocation as a compile (e.g. `-c`).
    Compile,
    /// `-D` macro definition, kept in both commands.
    Macro,
    /// The argument names an output product (`-o`).
    RedirectsOutput,
    /// The argument names a deps-output product (`-MF`).
    RedirectsDepsOutput,
    /// The argument is a make-rule target name, not a path (`-MT`, `-MQ`).
    DepsRuleTarget,
    /// The argument is an input path to rewrite (`-I`, `-include`, ...).
    InputPath,
    /// Like `InputPath` but spelled with `=` (`--sysroot=dir`).
    EqInputPath,
    /// Collected and reparsed under the preprocessor table (`-Wp,`,
    /// `-Xpreprocessor`).
    PreprocessorArg,
    /// `-x lang`; the language must be in the supported set.
    SetsGccLanguage,
    /// Cannot run remotely; parsing stops and the command goes local.
    Unsupported,
}

pub type RuleTable = &'static [(&'static str, ParseRule)];

pub static GCC_RULES: RuleTable = &[
    ("-MD", ParseRule::InterferesWithDeps),
    ("-MMD", ParseRule::InterferesWithDeps),
    ("-MG", ParseRule::InterferesWithDeps),
    ("-MP", ParseRule::InterferesWithDeps),
    ("-MV", ParseRule::InterferesWithDeps),
    ("-Wmissing-include-dirs", ParseRule::InterferesWithDeps),
    ("-Werror=missing-include-dirs", ParseRule::InterferesWithDeps),
    ("-c", ParseRule::Compile),
    ("-D", ParseRule::Macro),
    ("-o", ParseRule::RedirectsOutput),
    ("-MF", ParseRule::RedirectsDepsOutput),
    ("-MT", ParseRule::DepsRuleTarget),
    ("-MQ", ParseRule::DepsRuleTarget),
    ("-include", ParseRule::InputPath),
    ("-imacros", ParseRule::InputPath),
    ("-I", ParseRule::InputPath),
    ("-iquote", ParseRule::InputPath),
    ("-isystem", ParseRule::InputPath),
    ("-idirafter", ParseRule::InputPath),
    ("-iprefix", ParseRule::InputPath),
    ("-isysroot", ParseRule::InputPath),
    ("--sysroot", ParseRule::EqInputPath),
    ("-Wp,", ParseRule::PreprocessorArg),
    ("-Xpreprocessor", ParseRule::PreprocessorArg),
    ("-x", ParseRule::SetsGccLanguage),
    ("-fprofile-use", ParseRule::Unsupported),
    ("-fprofile-generate", ParseRule::Unsupported),
    ("-fauto-profile", ParseRule::Unsupported),
    ("-specs", ParseRule::Unsupported),
    ("-MM", ParseRule::Unsupported),
    ("-M", ParseRule::Unsupported),
    ("-E", ParseRule::Unsupported),
    ("-###", ParseRule::Unsupported),
];

/// Rules for tokens smuggled through `-Wp,`/`-Xpreprocessor`.
pub static GCC_PREPROCESSOR_RULES: RuleTable = &[
    ("-MD", ParseRule::InterferesWithDeps),
    ("-MMD", ParseRule::InterferesWithDeps),
    ("-MG", ParseRule::InterferesWithDeps),
    ("-MP", ParseRule::InterferesWithDeps),
    ("-MV", ParseRule::InterferesWithDeps),
    ("-o", ParseRule::RedirectsOutput),
    ("-MF", ParseRule::RedirectsDepsOutput),
    ("-MT", ParseRule::DepsRuleTarget),
    ("-MQ", ParseRule::DepsRuleTarget),
    ("-include", ParseRule::InputPath),
    ("-imacros", ParseRule::InputPath),
    ("-I", ParseRule::InputPath),
    ("-iquote", ParseRule::InputPath),
    ("-isystem", ParseRule::InputPath),
    ("-idirafter", ParseRule::InputPath),
    ("-iprefix", ParseRule::InputPath),
    ("-isysroot", ParseRule::InputPath),
    ("--sysroot", ParseRule::EqInputPath),
    ("-MM", ParseRule::Unsupported),
    ("-M", ParseRule::Unsupported),
];

pub static SUN_CPP_RULES: RuleTable = &[
    ("-xMD", ParseRule::InterferesWithDeps),
    ("-xMMD", ParseRule::InterferesWithDeps),
    ("-D", ParseRule::Macro),
    ("-o", ParseRule::RedirectsOutput),
    ("-xMF", ParseRule::RedirectsOutput),
    ("-I", ParseRule::InputPath),
    ("-include", ParseRule::InputPath),
    ("-c", ParseRule::Compile),
    ("-xpch", ParseRule::Unsupported),
    ("-xprofile", ParseRule::Unsupported),
    ("-###", ParseRule::Unsupported),
    ("-xM1", ParseRule::Unsupported),
    ("-xM", ParseRule::Unsupported),
    ("-E", ParseRule::Unsupported),
];

pub static AIX_RULES: RuleTable = &[
    ("-qsyntaxonly", ParseRule::InterferesWithDeps),
    ("-D", ParseRule::Macro),
    ("-o", ParseRule::RedirectsOutput),
    ("-MF", ParseRule::RedirectsOutput),
    ("-qexpfile", ParseRule::RedirectsOutput),
    ("-qinclude", ParseRule::InputPath),
    ("-qcinc", ParseRule::InputPath),
    ("-I", ParseRule::InputPath),
    ("-c", ParseRule::Compile),
    ("-#", ParseRule::Unsupported),
    ("-qshowpdf", ParseRule::Unsupported),
    ("-qdump_class_hierarchy", ParseRule::Unsupported),
    ("-E", ParseRule::Unsupported),
    ("-qmakedep", ParseRule::Unsupported),
    ("-M", ParseRule::Unsupported),
];

pub fn rules_for_dialect(dialect: Dialect) -> RuleTable {
    match dialect {
        Dialect::Gcc | Dialect::Clang => GCC_RULES,
        Dialect::SunCpp => SUN_CPP_RULES,
        Dialect::Aix => AIX_RULES,
        Dialect::Unknown => &[],
    }
}

/// Match one argv token against a rule table.
///
/// The token is stripped of any `=suffix` and whitespace and looked up
/// exactly; failing that, the first table entry whose flag is a prefix of
/// the raw token wins. Returns the matched flag and its rule.
pub fn match_compiler_option(token: &str, table: RuleTable) -> Option<(&'static str, ParseRule)> {
    if !token.starts_with('-') {
        return None;
    }

    let exact_key: String = token
        .split('=')
        .next()
        .unwrap_or(token)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if let Some((flag, rule)) = table.iter().find(|(flag, _)| *flag == exact_key) {
        return Some((*flag, *rule));
    }

    table
        .iter()
        .find(|(flag, _)| token.starts_with(flag))
        .map(|(flag, rule)| (*flag, *rule))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_matches() {
        assert_eq!(
            match_compiler_option("-c", GCC_RULES),
            Some(("-c", ParseRule::Compile))
        );
        assert_eq!(
            match_compiler_option("-MD", GCC_RULES),
            Some(("-MD", ParseRule::InterferesWithDeps))
        );
        assert_eq!(match_compiler_option("hello.c", GCC_RULES), None);
        assert_eq!(match_compiler_option("-notarule", GCC_RULES), None);
    }

    #[test]
    fn equals_forms_match_their_flag() {
        assert_eq!(
            match_compiler_option("--sysroot=/opt/sysroot", GCC_RULES),
            Some(("--sysroot", ParseRule::EqInputPath))
        );
        assert_eq!(
            match_compiler_option("-specs=custom.specs", GCC_RULES),
            Some(("-specs", ParseRule::Unsupported))
        );
        assert_eq!(
            match_compiler_option("-Werror=missing-include-dirs", GCC_RULES),
            Some(("-Werror=missing-include-dirs", ParseRule::InterferesWithDeps))
        );
    }

    #[test]
    fn glued_forms_prefix_match() {
        assert_eq!(
            match_compiler_option("-I/usr/include", GCC_RULES),
            Some(("-I", ParseRule::InputPath))
        );
        assert_eq!(
            match_compiler_option("-Dname=value", GCC_RULES),
            Some(("-D", ParseRule::Macro))
        );
        assert_eq!(
            match_compiler_option("-Wp,-MD,path", GCC_RULES),
            Some(("-Wp,", ParseRule::PreprocessorArg))
        );
        assert_eq!(
            match_compiler_option("-ooutput.o", GCC_RULES),
            Some(("-o", ParseRule::RedirectsOutput))
        );
        // Specific flags are listed before their prefixes.
        assert_eq!(
            match_compiler_option("-MFdeps.d", GCC_RULES),
            Some(("-MF", ParseRule::RedirectsDepsOutput))
        );
    }

    #[test]
    fn sun_and_aix_tables() {
        assert_eq!(
            match_compiler_option("-xM1", SUN_CPP_RULES),
            Some(("-xM1", ParseRule::Unsupported))
        );
        assert_eq!(
            match_compiler_option("-qexpfile=exports", AIX_RULES),
            Some(("-qexpfile", ParseRule::RedirectsOutput))
        );
        assert_eq!(
            match_compiler_option("-qmakedep=gcc", AIX_RULES),
            Some(("-qmakedep", ParseRule::Unsupported))
        );
    }
}
