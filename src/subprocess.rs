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

use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

use crate::errors::*;

#[derive(Debug)]
pub struct SubprocessResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `argv` to completion. Uncaptured streams are inherited from the
/// parent so compiler output reaches the terminal unchanged. The child sees
/// the parent environment merged with `extra_env` (extras win).
///
/// A non-zero exit is reported through `SubprocessResult`, not as an error;
/// only failure to launch at all is an error.
pub async fn execute(
    argv: &[String],
    capture_stdout: bool,
    capture_stderr: bool,
    extra_env: &BTreeMap<String, String>,
) -> Result<SubprocessResult> {
    let (executable, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("cannot execute an empty command"))?;

    let mut cmd = Command::new(executable);
    cmd.args(args)
        .envs(extra_env)
        .stdin(Stdio::inherit())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::inherit()
        })
        .stderr(if capture_stderr {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

    trace!("spawning {:?}", argv);
    let child = cmd
        .spawn()
        .map_err(|e| SubprocessError::Spawn(executable.clone(), e))?;

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed waiting for {}", executable))?;

    Ok(SubprocessResult {
        exit_code: exit_code_of(&output.status),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // A signal-terminated child is reported the way the shell would: 128+N.
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = execute(
            &["sh".into(), "-c".into(), "echo hello; exit 3".into()],
            true,
            true,
            &BTreeMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, b"hello\n");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn extra_env_wins_over_parent() {
        std::env::set_var("REXC_SUBPROCESS_TEST_VAR", "parent");
        let mut extra = BTreeMap::new();
        extra.insert("REXC_SUBPROCESS_TEST_VAR".to_string(), "extra".to_string());
        let result = execute(
            &[
                "sh".into(),
                "-c".into(),
                "printf %s \"$REXC_SUBPROCESS_TEST_VAR\"".into(),
            ],
            true,
            false,
            &extra,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, b"extra");
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let err = execute(
            &["rexc-definitely-not-a-real-binary".into()],
            true,
            true,
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<SubprocessError>().is_some());
    }
}
