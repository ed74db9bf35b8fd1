//! Shell State Module
//!
//! Captures a shell's declarations and cwd into a [`ShellState`], diffs
//! snapshots and re-applies diffs. Dialect differences live in one table per
//! dialect (`bash`, `zsh`); [`ShellType`] selects the table.
//!
//! # Probe output
//!
//! ```text
//! OXIDETERM-SHELL-STATE \0 version \0 cwd \0
//! flags name value \0 ...            (one record per declaration)
//! --pvars-- \0
//! name value \0 ...                  (prompt variables, stored as PROMPTVAR_<name>)
//! ```

mod bash;
#[cfg(feature = "shell-capture")]
pub mod capture;
pub mod state;
mod zsh;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use state::{
    apply, diff, Declaration, ShellState, ShellStateDiff, ShellStateError, PROMPT_VAR_PREFIX,
};

/// Emitted first so PTY noise before the probe can be skipped
const STATE_MARKER: &[u8] = b"OXIDETERM-SHELL-STATE\0";
const PVARS_MARKER: &str = "--pvars--";

const MARKER_LINE: &str = r#"printf '%s%s\0' OXIDETERM- SHELL-STATE"#;

const PVARS_BODY: &str = r#"printf '%s\0' '--pvars--'
printf 'GITBRANCH %s\0' "$(git rev-parse --abbrev-ref HEAD 2>/dev/null)"
printf 'VIRTUAL_ENV %s\0' "$VIRTUAL_ENV""#;

/// Supported shell dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    Bash,
    Zsh,
}

impl fmt::Display for ShellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl ShellType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bash" => Some(ShellType::Bash),
            "zsh" => Some(ShellType::Zsh),
            _ => None,
        }
    }

    /// zsh when the file name starts with `zsh`, otherwise bash.
    pub fn from_shell_path(path: &str) -> Self {
        let file_name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if file_name.starts_with("zsh") {
            ShellType::Zsh
        } else {
            ShellType::Bash
        }
    }

    /// Dialect of the local user's login shell: the directory service on
    /// macOS, then `$SHELL`, then bash.
    pub async fn detect_local() -> Self {
        if let Some(path) = mac_user_shell().await {
            return Self::from_shell_path(&path);
        }
        std::env::var("SHELL")
            .map(|s| Self::from_shell_path(&s))
            .unwrap_or(ShellType::Bash)
    }

    /// True when the dialect's program is an executable on `PATH`.
    pub fn is_available(&self) -> bool {
        std::env::var_os("PATH")
            .is_some_and(|paths| find_in_path(self.program(), &paths).is_some())
    }

    pub fn program(&self) -> &'static str {
        match self {
            ShellType::Bash => bash::PROGRAM,
            ShellType::Zsh => zsh::PROGRAM,
        }
    }

    /// Script that writes the full state to stdout.
    pub fn state_dump(&self) -> String {
        let body = match self {
            ShellType::Bash => bash::STATE_BODY,
            ShellType::Zsh => zsh::STATE_BODY,
        };
        format!("{}\n{}\n{}", MARKER_LINE, body, PVARS_BODY)
    }

    /// Probe run inside a PTY; newline translation is switched off first.
    pub fn probe_script(&self) -> String {
        format!("stty -onlcr 2>/dev/null\n{}\n", self.state_dump())
    }

    /// Text installing an exit hook that dumps the state to `fd`.
    pub fn exit_trap(&self, fd: u32) -> String {
        let dump = self.state_dump();
        match self {
            ShellType::Bash => bash::exit_trap(&dump, fd),
            ShellType::Zsh => zsh::exit_trap(&dump, fd),
        }
    }

    /// Text restoring `state` (cwd and declarations) before a command runs.
    pub fn rc_text(&self, state: &ShellState) -> String {
        match self {
            ShellType::Bash => bash::rc_text(state),
            ShellType::Zsh => zsh::rc_text(state),
        }
    }

    fn portable_flags(&self, raw: &str) -> String {
        match self {
            ShellType::Bash => bash::portable_flags(raw),
            ShellType::Zsh => zsh::portable_flags(raw),
        }
    }
}

fn find_in_path(program: &str, paths: &std::ffi::OsStr) -> Option<std::path::PathBuf> {
    std::env::split_paths(paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Login shell from `dscl . -read /Users/<user> UserShell` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_dscl_user_shell(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("UserShell: "))
        .map(|shell| shell.trim().to_string())
        .filter(|shell| !shell.is_empty())
}

#[cfg(target_os = "macos")]
async fn mac_user_shell() -> Option<String> {
    static USER_SHELL: tokio::sync::OnceCell<String> = tokio::sync::OnceCell::const_new();
    const DEFAULT_MAC_SHELL: &str = "/bin/bash";

    let shell = USER_SHELL
        .get_or_init(|| async {
            let user = format!("/Users/{}", whoami::username());
            let output = tokio::process::Command::new("dscl")
                .args([".", "-read", user.as_str(), "UserShell"])
                .kill_on_drop(true)
                .output();
            match tokio::time::timeout(std::time::Duration::from_secs(2), output).await {
                Ok(Ok(out)) if out.status.success() => {
                    parse_dscl_user_shell(&String::from_utf8_lossy(&out.stdout))
                        .unwrap_or_else(|| DEFAULT_MAC_SHELL.to_string())
                }
                _ => {
                    tracing::debug!("[shell-state] dscl failed, using {}", DEFAULT_MAC_SHELL);
                    DEFAULT_MAC_SHELL.to_string()
                }
            }
        })
        .await;
    Some(shell.clone())
}

#[cfg(not(target_os = "macos"))]
async fn mac_user_shell() -> Option<String> {
    None
}

/// Single-quote a string for POSIX shells.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Declarations an rc file can set again.
fn restorable(state: &ShellState) -> impl Iterator<Item = &Declaration> {
    state
        .decls
        .values()
        .filter(|d| !d.is_prompt_var() && !d.is_readonly() && is_identifier(&d.name))
}

/// Parse probe output (anything before the start marker is ignored).
pub fn parse_probe_output(
    shell_type: ShellType,
    raw: &[u8],
) -> Result<ShellState, ShellStateError> {
    let start = raw
        .windows(STATE_MARKER.len())
        .position(|w| w == STATE_MARKER)
        .ok_or_else(|| ShellStateError::Parse("start marker not found".to_string()))?;
    let text = String::from_utf8_lossy(&raw[start + STATE_MARKER.len()..]);

    let mut fields: Vec<&str> = text.split('\0').collect();
    // bytes after the final separator are not a complete record
    fields.pop();

    if fields.len() < 2 {
        return Err(ShellStateError::Parse(
            "missing version or cwd".to_string(),
        ));
    }
    let version = fields[0];
    let cwd = fields[1];

    let mut decls = Vec::new();
    let mut in_pvars = false;
    for record in fields[2..].iter().copied() {
        if record == PVARS_MARKER {
            in_pvars = true;
            continue;
        }
        if in_pvars {
            let (name, value) = record.split_once(' ').unwrap_or((record, ""));
            if name.is_empty() {
                continue;
            }
            decls.push(Declaration::new(
                format!("{}{}", PROMPT_VAR_PREFIX, name),
                value,
                "",
            ));
        } else {
            let mut parts = record.splitn(3, ' ');
            let (Some(raw_flags), Some(name)) = (parts.next(), parts.next()) else {
                return Err(ShellStateError::Parse(format!(
                    "bad declaration record '{}'",
                    record
                )));
            };
            let value = parts.next().unwrap_or("");
            decls.push(Declaration {
                name: name.to_string(),
                value: value.to_string(),
                flags: shell_type.portable_flags(raw_flags),
                dialect_flags: raw_flags.to_string(),
            });
        }
    }

    Ok(ShellState::new(shell_type, version, cwd, decls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_from_path() {
        assert_eq!(ShellType::from_shell_path("/bin/zsh"), ShellType::Zsh);
        assert_eq!(ShellType::from_shell_path("/usr/local/bin/zsh-5.9"), ShellType::Zsh);
        assert_eq!(ShellType::from_shell_path("/bin/bash"), ShellType::Bash);
        assert_eq!(ShellType::from_shell_path("/bin/fish"), ShellType::Bash);
    }

    #[test]
    fn test_parse_dscl_output() {
        assert_eq!(
            parse_dscl_user_shell("UserShell: /bin/zsh\n").as_deref(),
            Some("/bin/zsh")
        );
        assert_eq!(parse_dscl_user_shell("No such key: UserShell\n"), None);
        assert_eq!(parse_dscl_user_shell("UserShell: \n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path_needs_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let plain = temp.path().join("plain");
        std::fs::create_dir(&plain).unwrap();
        std::fs::write(plain.join("zsh"), "").unwrap();
        let bin = temp.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        std::fs::write(bin.join("zsh"), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(bin.join("zsh"), std::fs::Permissions::from_mode(0o755)).unwrap();

        let only_plain = std::env::join_paths([&plain]).unwrap();
        assert!(find_in_path("zsh", &only_plain).is_none());
        let both = std::env::join_paths([&plain, &bin]).unwrap();
        assert_eq!(find_in_path("zsh", &both), Some(bin.join("zsh")));
        assert!(find_in_path("bash", &both).is_none());
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_detect_local_follows_shell_env() {
        let expected = std::env::var("SHELL")
            .map(|s| ShellType::from_shell_path(&s))
            .unwrap_or(ShellType::Bash);
        assert_eq!(ShellType::detect_local().await, expected);
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_parse_bash_output() {
        let mut raw = b"\x1b]0;noise\x07login banner\r\n".to_vec();
        raw.extend_from_slice(
            b"OXIDETERM-SHELL-STATE\x005.2.15(1)-release\x00/home/me\x00\
-x PATH /usr/bin:/bin\x00\
-- greeting hello world\x00\
-ix COUNT 3\x00\
-x EMPTY \x00\
--pvars--\x00\
GITBRANCH main\x00\
VIRTUAL_ENV \x00",
        );

        let state = parse_probe_output(ShellType::Bash, &raw).unwrap();
        assert_eq!(state.version, "5.2.15(1)-release");
        assert_eq!(state.cwd, "/home/me");
        assert_eq!(state.get("greeting").unwrap().value, "hello world");
        assert_eq!(state.get("greeting").unwrap().flags, "");
        let count = state.get("COUNT").unwrap();
        assert_eq!(count.flags, "xi");
        assert_eq!(count.dialect_flags, "-ix");
        assert_eq!(state.get("EMPTY").unwrap().value, "");
        assert_eq!(state.get("PROMPTVAR_GITBRANCH").unwrap().value, "main");
        assert_eq!(state.get("PROMPTVAR_VIRTUAL_ENV").unwrap().value, "");
        assert!(state.get("GITBRANCH").is_none());
        assert!(state.hash_is_valid());
    }

    #[test]
    fn test_parse_zsh_output_with_newline_value() {
        let raw = b"OXIDETERM-SHELL-STATE\x005.9\x00/tmp\x00\
                    scalar-export MSG line1\nline2\x00--pvars--\x00";
        let state = parse_probe_output(ShellType::Zsh, raw).unwrap();
        let msg = state.get("MSG").unwrap();
        assert_eq!(msg.value, "line1\nline2");
        assert_eq!(msg.flags, "x");
    }

    #[test]
    fn test_parse_requires_marker() {
        assert!(matches!(
            parse_probe_output(ShellType::Bash, b"5.2\x00/\x00"),
            Err(ShellStateError::Parse(_))
        ));
        assert!(matches!(
            parse_probe_output(ShellType::Bash, b"OXIDETERM-SHELL-STATE\x005.2\x00"),
            Err(ShellStateError::Parse(_))
        ));
    }

    #[test]
    fn test_scripts_per_dialect() {
        let bash = ShellType::Bash.probe_script();
        assert!(bash.starts_with("stty -onlcr"));
        assert!(bash.contains("compgen -v"));
        assert!(bash.contains("--pvars--"));
        let zsh = ShellType::Zsh.probe_script();
        assert!(zsh.contains("zsh/parameter"));
        // the marker literal never appears in the script itself
        assert!(!zsh.contains("OXIDETERM-SHELL-STATE"));
    }
}
