//! Login-shell command building for the sidecar.
//!
//! The sidecar is usually a Node or Python script, so it must run inside the
//! user's login shell to see the same PATH an interactive terminal would.
//! Non-POSIX shells (fish, nushell) fall back to bash or sh.

use std::process::Command;

use serde::Serialize;

use crate::spawn::SpawnError;

/// How a child process terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildExit {
    pub code: i32,
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code().unwrap_or(-1),
            signal,
        }
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.signal {
            Some(signal) => write!(f, "killed by signal {signal}"),
            None => write!(f, "exit code {}", self.code),
        }
    }
}

/// Prepend the binary's parent directory to PATH so its interpreter is found.
pub fn prepare_path_env(cmd: &mut Command, binary_path: &str) {
    if !binary_path.contains('/') {
        return;
    }
    let Some(dir) = std::path::Path::new(binary_path)
        .parent()
        .and_then(|d| d.to_str())
    else {
        return;
    };

    let existing = std::env::var("PATH").unwrap_or_default();
    let combined = if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}:{existing}")
    };
    cmd.env("PATH", combined);
}

/// Build `<prefix> '<binary> <args...>'`, with every element shell-quoted.
///
/// The default prefix is `$SHELL -l -c`.
#[cfg(unix)]
pub fn build_login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, SpawnError> {
    let prefix = get_shell_prefix(shell_prefix);
    let mut prefix_parts = prefix.split_whitespace();
    let shell_program = prefix_parts.next().ok_or(SpawnError::EmptyShellPrefix)?;

    let quote = |value: &str| {
        shlex::try_quote(value)
            .map(|q| q.into_owned())
            .map_err(|_| SpawnError::InvalidCommand(value.to_string()))
    };

    let mut command_parts = Vec::with_capacity(args.len() + 1);
    command_parts.push(quote(binary_path)?);
    for arg in args {
        command_parts.push(quote(arg)?);
    }

    let mut cmd = Command::new(shell_program);
    cmd.args(prefix_parts).arg(command_parts.join(" "));

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, binary_path);

    Ok(cmd)
}

#[cfg(unix)]
fn get_shell_prefix(custom_prefix: Option<&str>) -> String {
    if let Some(prefix) = custom_prefix.filter(|p| !p.trim().is_empty()) {
        return prefix.to_string();
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let shell_name = std::path::Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    const NON_POSIX: [&str; 6] = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];
    let effective_shell = if NON_POSIX.contains(&shell_name) {
        if std::path::Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else {
            "/bin/sh"
        }
    } else {
        &shell
    };

    format!("{effective_shell} -l -c")
}

#[cfg(windows)]
pub fn build_login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    _shell_prefix: Option<&str>,
) -> Result<Command, SpawnError> {
    let mut cmd = Command::new(binary_path);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, binary_path);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_exit_serializes() {
        let exit = ChildExit {
            code: 1,
            signal: Some(9),
        };
        let json = serde_json::to_string(&exit).unwrap();
        assert_eq!(json, r#"{"code":1,"signal":9}"#);
        assert_eq!(exit.to_string(), "killed by signal 9");
    }

    #[test]
    fn child_exit_display_code() {
        let exit = ChildExit {
            code: 2,
            signal: None,
        };
        assert_eq!(exit.to_string(), "exit code 2");
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        #[test]
        fn custom_prefix_is_used_verbatim() {
            assert_eq!(get_shell_prefix(Some("/bin/zsh -l -c")), "/bin/zsh -l -c");
        }

        #[test]
        fn blank_prefix_falls_back_to_login_shell() {
            assert!(get_shell_prefix(Some("  ")).ends_with(" -l -c"));
            assert!(get_shell_prefix(None).ends_with(" -l -c"));
        }

        #[test]
        fn quotes_binary_and_args() {
            let cmd = build_login_shell_command(
                "/opt/my tools/sidecar.js",
                &["--mode".to_string(), "two words".to_string()],
                None,
                Some("/bin/sh -c"),
            )
            .unwrap();

            assert_eq!(cmd.get_program().to_str().unwrap(), "/bin/sh");
            let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
            assert_eq!(args[0], "-c");
            assert_eq!(
                shlex::split(args[1]).unwrap(),
                vec!["/opt/my tools/sidecar.js", "--mode", "two words"]
            );
        }

        #[test]
        fn working_dir_is_applied() {
            let cmd =
                build_login_shell_command("node", &[], Some("/tmp"), Some("/bin/sh -c")).unwrap();
            assert_eq!(cmd.get_current_dir(), Some(std::path::Path::new("/tmp")));
        }

        #[test]
        fn nul_byte_is_rejected() {
            let result = build_login_shell_command(
                "node",
                &["bad\0arg".to_string()],
                None,
                Some("/bin/sh -c"),
            );
            assert!(matches!(result, Err(SpawnError::InvalidCommand(_))));
        }
    }
}
