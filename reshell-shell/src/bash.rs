//! Bash init script for the interactive shell.
//!
//! The script sources the initial environment, the user's `~/.bashrc`, and
//! installs the reload hook: on every prompt, and on the reload key binding,
//! the file named by `RESHELL_RELOAD_FILE` is sourced and deleted if it
//! exists. Variables set by the previous environment are reverted first so
//! removed variables do not linger.

use crate::marker::READY_MARKER;
use std::borrow::Cow;
use std::path::Path;

/// Environment variable naming the reload file.
pub const RELOAD_FILE_ENV: &str = "RESHELL_RELOAD_FILE";
/// Environment variable overriding the manual reload key sequence.
pub const RELOAD_KEYBIND_ENV: &str = "RESHELL_RELOAD_KEYBIND";
/// Ctrl-Alt-R in readline notation.
pub const DEFAULT_RELOAD_KEYBIND: &str = "\\e\\C-r";

/// Arguments launching `bash` with `rcfile` as its init script.
pub fn interactive_args(rcfile: &Path) -> Vec<String> {
    // `-i` must come after `--rcfile`.
    vec![
        "--noprofile".into(),
        "--rcfile".into(),
        rcfile.to_string_lossy().into_owned(),
        "-i".into(),
    ]
}

fn quote(path: &Path) -> Cow<'_, str> {
    shell_escape::unix::escape(path.to_string_lossy())
}

/// Inputs for [`rcfile_content`].
pub struct RcfileOptions<'a> {
    /// Script holding the initial environment.
    pub env_script: &'a Path,
    /// Install the reload hook and key binding.
    pub reload: bool,
    /// Setup tasks will run in the shell before the user takes over; the
    /// script then announces readiness and leaves history disabled for the
    /// task runner to re-enable.
    pub tasks_in_shell: bool,
    /// Directory removed once the script has been sourced, for shells that
    /// outlive the process that wrote it.
    pub cleanup_dir: Option<&'a Path>,
}

/// Tracks which exported variables an environment script changed so the
/// next reload can undo them.
const ENV_TRACKING: &str = r#"
declare -gA __reshell_snap=()
__reshell_undo=""

__reshell_ignored_var() {
    case "$1" in
        _*|PWD|OLDPWD|SHLVL|SHELL|SHELLOPTS|BASHOPTS|BASH_*|HISTCMD|HISTFILE) return 0 ;;
        PS1|PS2|PS4|PROMPT_COMMAND|COLUMNS|LINES|RANDOM|SECONDS|LINENO) return 0 ;;
        RESHELL_*|DIRENV_*) return 0 ;;
        *) return 1 ;;
    esac
}

__reshell_env_snapshot() {
    local name
    __reshell_snap=()
    for name in $(compgen -e); do
        __reshell_ignored_var "$name" && continue
        __reshell_snap[$name]="${!name}"
    done
}

__reshell_env_record() {
    local name
    __reshell_undo=""
    for name in $(compgen -e); do
        __reshell_ignored_var "$name" && continue
        if [[ -z "${__reshell_snap[$name]+x}" ]]; then
            __reshell_undo+="unset $name;"
        elif [[ "${__reshell_snap[$name]}" != "${!name}" ]]; then
            __reshell_undo+="export $name=$(printf '%q' "${__reshell_snap[$name]}");"
        fi
    done
    for name in "${!__reshell_snap[@]}"; do
        if ! [[ -v $name ]]; then
            __reshell_undo+="export $name=$(printf '%q' "${__reshell_snap[$name]}");"
        fi
    done
    __reshell_snap=()
}

__reshell_env_revert() {
    eval "$__reshell_undo"
    __reshell_undo=""
}
"#;

/// Reload hook and key binding.
fn reload_hook() -> String {
    format!(
        r#"
__reshell_reload_apply() {{
    local file="${{{RELOAD_FILE_ENV}:-}}"
    [ -n "$file" ] && [ -f "$file" ] || return 0
    __reshell_env_revert
    __reshell_env_snapshot
    source "$file"
    rm -f "$file"
    __reshell_env_record
    export _RESHELL_PATH="$PATH"
}}

__reshell_restore_path() {{
    export PATH="$_RESHELL_PATH"
}}

__reshell_prompt_hook() {{
    __reshell_reload_apply
    __reshell_restore_path
}}

if [[ $- == *i* ]] && command -v bind >/dev/null 2>&1; then
    bind -x "\"${{{RELOAD_KEYBIND_ENV}:-{DEFAULT_RELOAD_KEYBIND}}}\":__reshell_prompt_hook"
fi

# Runs after any hooks already installed by ~/.bashrc (direnv and others).
if [[ "$PROMPT_COMMAND" != *"__reshell_prompt_hook"* ]]; then
    PROMPT_COMMAND="${{PROMPT_COMMAND:+$PROMPT_COMMAND;}}__reshell_prompt_hook"
fi
"#
    )
}

/// Content of the `--rcfile` script.
pub fn rcfile_content(options: &RcfileOptions) -> String {
    let mut script = String::from(
        "# Internal commands stay out of the user's history.\nset +o history\n",
    );
    script.push_str(ENV_TRACKING);
    script.push_str(&format!(
        r#"
__reshell_env_snapshot
source {env_script}
__reshell_env_record

# ~/.bashrc may rewrite PATH; the managed one wins.
export _RESHELL_PATH="$PATH"
if [ -e "$HOME/.bashrc" ]; then
    source "$HOME/.bashrc"
fi
export PATH="$_RESHELL_PATH"
"#,
        env_script = quote(options.env_script),
    ));

    if options.reload {
        script.push_str(&reload_hook());
    }

    if let Some(dir) = options.cleanup_dir {
        script.push_str(&format!("\nrm -rf -- {}\n", quote(dir)));
    }

    if options.tasks_in_shell {
        script.push_str(&format!("\necho \"{READY_MARKER}\"\n"));
    } else {
        script.push_str("\nset -o history\n");
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn options(env_script: &Path, reload: bool, tasks_in_shell: bool) -> RcfileOptions<'_> {
        RcfileOptions {
            env_script,
            reload,
            tasks_in_shell,
            cleanup_dir: None,
        }
    }

    #[test]
    fn test_interactive_args_order() {
        let args = interactive_args(Path::new("/tmp/rc"));
        assert_eq!(args, ["--noprofile", "--rcfile", "/tmp/rc", "-i"]);
    }

    #[test]
    fn test_rcfile_quotes_env_script() {
        let script = rcfile_content(&options(Path::new("/tmp/my env.sh"), false, false));
        assert!(script.contains("source '/tmp/my env.sh'"));
        assert!(!script.contains("__reshell_prompt_hook"));
        assert!(script.trim_end().ends_with("set -o history"));
    }

    #[test]
    fn test_rcfile_with_reload_and_tasks() {
        let script = rcfile_content(&options(Path::new("/tmp/env.sh"), true, true));
        assert!(script.contains("PROMPT_COMMAND=\"${PROMPT_COMMAND:+$PROMPT_COMMAND;}__reshell_prompt_hook\""));
        assert!(script.contains(
            r#"bind -x "\"${RESHELL_RELOAD_KEYBIND:-\e\C-r}\":__reshell_prompt_hook""#
        ));
        assert!(script.contains(r#"local file="${RESHELL_RELOAD_FILE:-}""#));
        assert!(script.trim_end().ends_with("echo \"__RESHELL_SHELL_READY__\""));
    }

    #[test]
    fn test_rcfile_cleanup_dir() {
        let mut opts = options(Path::new("/tmp/state/env.sh"), false, false);
        opts.cleanup_dir = Some(Path::new("/tmp/state dir"));
        let script = rcfile_content(&opts);
        assert!(script.contains("rm -rf -- '/tmp/state dir'"));
        assert!(script.trim_end().ends_with("set -o history"));
    }

    /// Source the rcfile non-interactively and run the prompt hook by hand.
    fn run_bash(rcfile: &Path, reload_file: &Path, after: &str) -> String {
        let output = Command::new("bash")
            .arg("--noprofile")
            .arg("--norc")
            .arg("-c")
            .arg(format!("source {}; {after}", rcfile.display()))
            .env("HOME", rcfile.parent().unwrap())
            .env(RELOAD_FILE_ENV, reload_file)
            .env_remove("PROMPT_COMMAND")
            .output()
            .expect("run bash");
        assert!(
            output.status.success(),
            "bash failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    #[test]
    fn test_reload_hook_sources_deletes_and_reverts() {
        let dir = TempDir::new().expect("tempdir");
        let env_script = dir.path().join("env.sh");
        let reload_file = dir.path().join("reload.sh");
        let rcfile = dir.path().join("rc.sh");

        std::fs::write(&env_script, "export OLD_ONLY=1\nexport SHARED=old\nexport PATH=/managed/old:$PATH\n")
            .expect("write env");
        std::fs::write(&rcfile, rcfile_content(&options(&env_script, true, false)))
            .expect("write rc");
        std::fs::write(&reload_file, "export SHARED=new\nexport NEW_ONLY=1\nexport PATH=/managed/new:$PATH\n")
            .expect("write reload");

        let out = run_bash(
            &rcfile,
            &reload_file,
            "export PATH=/clobbered:$PATH; __reshell_prompt_hook; \
             echo \"shared=$SHARED old=${OLD_ONLY:-unset} new=$NEW_ONLY\"; \
             echo \"path=${PATH%%:*}\"; \
             [ -e \"$RESHELL_RELOAD_FILE\" ] && echo present || echo consumed",
        );

        assert!(out.contains("shared=new old=unset new=1"), "{out}");
        assert!(out.contains("path=/managed/new"), "{out}");
        assert!(out.contains("consumed"), "{out}");
        assert!(!reload_file.exists());
    }

    #[test]
    fn test_prompt_hook_without_artifact_restores_path() {
        let dir = TempDir::new().expect("tempdir");
        let env_script = dir.path().join("env.sh");
        let rcfile = dir.path().join("rc.sh");
        std::fs::write(&env_script, "export PATH=/managed:$PATH\n").expect("write env");
        std::fs::write(&rcfile, rcfile_content(&options(&env_script, true, false)))
            .expect("write rc");

        let out = run_bash(
            &rcfile,
            &dir.path().join("missing.sh"),
            "export PATH=/direnv:$PATH; __reshell_prompt_hook; echo \"path=${PATH%%:*}\"",
        );
        assert!(out.contains("path=/managed"), "{out}");
    }
}
