//! zsh dialect table

use super::shell_escape;
use super::state::ShellState;

pub const PROGRAM: &str = "zsh";

/// Uses the zsh/parameter module; `${parameters[name]}` gives the type string.
pub const STATE_BODY: &str = r#"zmodload zsh/parameter 2>/dev/null
printf '%s\0' "$ZSH_VERSION"
printf '%s\0' "$PWD"
for __oxt_n in ${(k)parameters}; do
  __oxt_f=${parameters[$__oxt_n]}
  case "$__oxt_f" in *special*|*array*|*association*|*local*|*hide*) continue ;; esac
  case "$__oxt_n" in __oxt_*|_|PWD|OLDPWD|SHLVL|RANDOM|SECONDS|LINENO|ZSH_*) continue ;; esac
  printf '%s %s %s\0' "$__oxt_f" "$__oxt_n" "${(P)__oxt_n}"
done"#;

/// `scalar-export`, `integer-readonly`, ... to portable flags
pub fn portable_flags(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('-').collect();
    let mut flags = String::new();
    if parts.contains(&"export") {
        flags.push('x');
    }
    if parts.contains(&"readonly") {
        flags.push('r');
    }
    if parts.first() == Some(&"integer") {
        flags.push('i');
    }
    flags
}

pub fn exit_trap(dump: &str, fd: u32) -> String {
    format!("TRAPEXIT() {{\n{{\n{}\n}} >&{}\n}}", dump, fd)
}

pub fn rc_text(state: &ShellState) -> String {
    let mut rc = format!("builtin cd -q {} 2>/dev/null\n", shell_escape(&state.cwd));
    for decl in super::restorable(state) {
        let mut opts = String::from("-g");
        if decl.is_integer() {
            opts.push('i');
        }
        if decl.is_exported() {
            opts.push('x');
        }
        rc.push_str(&format!(
            "typeset {} {}={}\n",
            opts,
            decl.name,
            shell_escape(&decl.value)
        ));
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::state::Declaration;
    use crate::shell::ShellType;

    #[test]
    fn test_portable_flags() {
        assert_eq!(portable_flags("scalar"), "");
        assert_eq!(portable_flags("scalar-export"), "x");
        assert_eq!(portable_flags("integer-export-readonly"), "xri");
    }

    #[test]
    fn test_rc_text_and_trap() {
        let state = ShellState::new(
            ShellType::Zsh,
            "5.9",
            "/tmp",
            vec![Declaration::new("LANG", "C.UTF-8", "x")],
        );
        let rc = rc_text(&state);
        assert!(rc.starts_with("builtin cd -q '/tmp'"));
        assert!(rc.contains("typeset -gx LANG='C.UTF-8'\n"));

        assert!(exit_trap("printf x", 4).starts_with("TRAPEXIT() {"));
    }
}
