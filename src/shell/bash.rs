//! bash dialect table

use super::shell_escape;
use super::state::ShellState;

pub const PROGRAM: &str = "bash";

/// Prints version, cwd, then one `flags name value` record per scalar variable.
pub const STATE_BODY: &str = r#"printf '%s\0' "$BASH_VERSION"
printf '%s\0' "$PWD"
for __oxt_n in $(compgen -v); do
  case "$__oxt_n" in
    __oxt_*|BASH*|COMP_*|FUNCNAME|GROUPS|HISTCMD|LINENO|PIPESTATUS|PPID|PWD|OLDPWD|RANDOM|SRANDOM|SECONDS|EPOCHSECONDS|EPOCHREALTIME|SHLVL|SHELLOPTS|EUID|UID|_) continue ;;
  esac
  __oxt_f=$(declare -p "$__oxt_n" 2>/dev/null)
  __oxt_f=${__oxt_f#declare }
  __oxt_f=${__oxt_f%% *}
  case "$__oxt_f" in *a*|*A*) continue ;; esac
  printf '%s %s %s\0' "$__oxt_f" "$__oxt_n" "${!__oxt_n}"
done"#;

/// `declare -p` attribute string (`-x`, `-ir`, `--`) to portable flags
pub fn portable_flags(raw: &str) -> String {
    let attrs = raw.trim_start_matches('-');
    ['x', 'r', 'i']
        .iter()
        .filter(|c| attrs.contains(**c))
        .collect()
}

pub fn exit_trap(dump: &str, fd: u32) -> String {
    format!("trap {} EXIT", shell_escape(&format!("{{\n{}\n}} >&{}", dump, fd)))
}

pub fn rc_text(state: &ShellState) -> String {
    let mut rc = format!("cd {} 2>/dev/null\n", shell_escape(&state.cwd));
    for decl in super::restorable(state) {
        let mut opts = String::from("-g");
        if decl.is_integer() {
            opts.push('i');
        }
        if decl.is_exported() {
            opts.push('x');
        }
        rc.push_str(&format!(
            "declare {} {}={}\n",
            opts,
            decl.name,
            shell_escape(&decl.value)
        ));
    }
    rc
}
