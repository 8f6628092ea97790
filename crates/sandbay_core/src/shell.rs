//! Logical shell.
//!
//! Container execs are stateless, so a session's working directory is
//! tracked here. A command line is split on top-level `&&`; `cd` steps are
//! resolved in path space without touching the container, and every other
//! step is wrapped with a `pwd` probe so a directory change made inside the
//! step (a script that `cd`s, `cd x; make`) is still observed.

use std::sync::OnceLock;

use regex::Regex;

/// Mount point of the session's project content.
pub const WORKSPACE_ROOT: &str = "/workspace";

/// Marker preceding the probed working directory in exec output.
pub const PWD_SENTINEL: &str = "__SANDBAY_PWD__";

/// One `&&`-separated piece of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// `cd` with an optional target
    Cd(Option<String>),
    /// Anything else, run inside the container
    Run(String),
}

/// Split `input` on `&&` outside of quotes.
pub fn split_chain(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quote != Some('\'') => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' | '"' => {
                match quote {
                    None => quote = Some(c),
                    Some(q) if q == c => quote = None,
                    _ => {}
                }
                current.push(c);
            }
            '&' if quote.is_none() && chars.peek() == Some(&'&') => {
                chars.next();
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Classify a single step.
///
/// Only a bare `cd [target]` is resolved locally; anything with further
/// shell syntax after the target runs in the container.
pub fn parse_step(step: &str) -> Step {
    let step = step.trim();
    if step == "cd" {
        return Step::Cd(None);
    }
    let Some(rest) = step.strip_prefix("cd ").or_else(|| step.strip_prefix("cd\t")) else {
        return Step::Run(step.to_string());
    };

    let target = rest.trim();
    let quoted = target.starts_with('\'') || target.starts_with('"');
    let has_syntax = target.contains([';', '|', '&', '<', '>', '`', '$', '(', ')']);
    let has_spaces = !quoted && target.contains(char::is_whitespace);
    if has_syntax || has_spaces {
        return Step::Run(step.to_string());
    }

    let target = unquote(target);
    if target.is_empty() {
        Step::Cd(None)
    } else {
        Step::Cd(Some(target))
    }
}

/// Collapse `.` and `..` segments of an absolute path.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Resolve a `cd` target against `current`.
pub fn resolve_cd(current: &str, target: Option<&str>) -> String {
    match target {
        None | Some("") | Some("~") => WORKSPACE_ROOT.to_string(),
        Some(t) if t.starts_with("~/") => normalize(&format!("{}/{}", WORKSPACE_ROOT, &t[2..])),
        Some(t) if t.starts_with('/') => normalize(t),
        Some(t) => normalize(&format!("{}/{}", current, t)),
    }
}

/// Wrap a user command so its final working directory is printed last.
pub fn wrap_with_probe(command: &str) -> String {
    format!(
        "{command}\n__sandbay_rc=$?\nprintf '\\n%s%s\\n' '{PWD_SENTINEL}' \"$(pwd)\"\nexit $__sandbay_rc"
    )
}

/// Remove the probe from captured stdout, returning the visible output and
/// the probed directory.
pub fn strip_probe(stdout: &str) -> (String, Option<String>) {
    let Some(index) = stdout.rfind(PWD_SENTINEL) else {
        return (stdout.to_string(), None);
    };

    let mut visible = stdout[..index].to_string();
    // The probe starts on a fresh line of its own
    if visible.ends_with('\n') {
        visible.pop();
    }

    let after = &stdout[index + PWD_SENTINEL.len()..];
    let (dir, rest) = after.split_once('\n').unwrap_or((after, ""));
    visible.push_str(rest);

    let dir = dir.trim();
    let dir = if dir.starts_with('/') {
        Some(dir.to_string())
    } else {
        None
    };
    (visible, dir)
}

/// Visible part of a streamed stdout line, or `None` for a pure probe line.
pub fn filter_probe_line(line: &str) -> Option<&str> {
    match line.find(PWD_SENTINEL) {
        None => Some(line),
        Some(0) => None,
        Some(index) => Some(&line[..index]),
    }
}

fn mutating_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?:^|[\s;&|(])(?:mkdir|rm|rmdir|mv|cp|touch|ln|tee|truncate|unzip|tar|vi|vim|nvim|nano|emacs|pico|sed\s+-i|git\s+(?:clone|checkout|pull|reset|init)|npm\s+(?:i|install|init|uninstall)|yarn\s+(?:add|remove|install)|pip3?\s+install)(?:\s|$)",
            )
            .ok()
        })
        .as_ref()
}

fn redirect_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:^|[^<>&])\d?>>?\s*([^\s&|;<>]+)").ok())
        .as_ref()
}

/// Whether a command may change the project's file tree.
pub fn is_mutating(command: &str) -> bool {
    if mutating_pattern().map(|re| re.is_match(command)).unwrap_or(false) {
        return true;
    }
    let Some(redirect) = redirect_pattern() else {
        return false;
    };
    redirect
        .captures_iter(command)
        .filter_map(|c| c.get(1))
        .any(|target| target.as_str() != "/dev/null")
}

/// Per-command view of a session's working directory.
#[derive(Debug, Clone)]
pub struct LogicalShell {
    cwd: String,
}

impl LogicalShell {
    pub fn new(cwd: impl Into<String>) -> Self {
        let cwd = cwd.into();
        let cwd = if cwd.starts_with('/') {
            normalize(&cwd)
        } else {
            resolve_cd(WORKSPACE_ROOT, Some(&cwd))
        };
        Self { cwd }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Break a command line into steps.
    pub fn plan(&self, command: &str) -> Vec<Step> {
        split_chain(command).iter().map(|s| parse_step(s)).collect()
    }

    /// Apply a `cd` step.
    pub fn cd(&mut self, target: Option<&str>) {
        self.cwd = resolve_cd(&self.cwd, target);
    }

    /// Script for a `Run` step, rooted at the current directory by the exec.
    pub fn script(&self, command: &str) -> String {
        wrap_with_probe(command)
    }

    /// Consume captured stdout, adopting the probed directory.
    pub fn observe(&mut self, stdout: &str) -> String {
        let (visible, dir) = strip_probe(stdout);
        if let Some(dir) = dir {
            self.cwd = normalize(&dir);
        }
        visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chain_respects_quotes() {
        assert_eq!(split_chain("cd a && cd b && pwd"), vec!["cd a", "cd b", "pwd"]);
        assert_eq!(
            split_chain("echo 'a && b' && ls"),
            vec!["echo 'a && b'", "ls"]
        );
        assert_eq!(split_chain("echo \"x&&y\""), vec!["echo \"x&&y\""]);
        assert_eq!(split_chain("a & b"), vec!["a & b"]);
        assert_eq!(split_chain("  && ls &&"), vec!["ls"]);
    }

    #[test]
    fn test_parse_step() {
        assert_eq!(parse_step("cd"), Step::Cd(None));
        assert_eq!(parse_step("cd src"), Step::Cd(Some("src".into())));
        assert_eq!(parse_step("cd 'my dir'"), Step::Cd(Some("my dir".into())));
        assert_eq!(parse_step("cd src; ls"), Step::Run("cd src; ls".into()));
        assert_eq!(parse_step("cd $HOME"), Step::Run("cd $HOME".into()));
        assert_eq!(parse_step("cdk deploy"), Step::Run("cdk deploy".into()));
    }

    #[test]
    fn test_resolve_cd() {
        assert_eq!(resolve_cd("/workspace/a", None), "/workspace");
        assert_eq!(resolve_cd("/workspace/a", Some("~")), "/workspace");
        assert_eq!(resolve_cd("/workspace", Some("~/x")), "/workspace/x");
        assert_eq!(resolve_cd("/workspace/a", Some("/tmp")), "/tmp");
        assert_eq!(resolve_cd("/workspace/a", Some("b")), "/workspace/a/b");
        assert_eq!(resolve_cd("/workspace/a", Some("../c/./d")), "/workspace/c/d");
        assert_eq!(resolve_cd("/", Some("../../..")), "/");
    }

    #[test]
    fn test_chain_of_cds() {
        let mut shell = LogicalShell::new(WORKSPACE_ROOT);
        for step in shell.plan("cd a && cd b") {
            if let Step::Cd(target) = step {
                shell.cd(target.as_deref());
            }
        }
        assert_eq!(shell.cwd(), "/workspace/a/b");
    }

    #[test]
    fn test_strip_probe() {
        let stdout = format!("hello\nworld\n\n{}/workspace/sub\n", PWD_SENTINEL);
        let (visible, dir) = strip_probe(&stdout);
        assert_eq!(visible, "hello\nworld\n");
        assert_eq!(dir.as_deref(), Some("/workspace/sub"));
    }

    #[test]
    fn test_strip_probe_without_trailing_newline_in_output() {
        let stdout = format!("no-newline\n{}/workspace\n", PWD_SENTINEL);
        let (visible, dir) = strip_probe(&stdout);
        assert_eq!(visible, "no-newline");
        assert_eq!(dir.as_deref(), Some("/workspace"));
    }

    #[test]
    fn test_strip_probe_uses_last_marker() {
        let stdout = format!(
            "echo {0}/fake\n\n{0}/workspace/real\n",
            PWD_SENTINEL
        );
        let (visible, dir) = strip_probe(&stdout);
        assert_eq!(dir.as_deref(), Some("/workspace/real"));
        assert!(visible.contains("/fake"));
    }

    #[test]
    fn test_strip_probe_absent() {
        let (visible, dir) = strip_probe("plain");
        assert_eq!(visible, "plain");
        assert!(dir.is_none());
    }

    #[test]
    fn test_filter_probe_line() {
        assert_eq!(filter_probe_line("output"), Some("output"));
        assert_eq!(filter_probe_line(&format!("{}/workspace", PWD_SENTINEL)), None);
        assert_eq!(
            filter_probe_line(&format!("tail{}/workspace", PWD_SENTINEL)),
            Some("tail")
        );
    }

    #[test]
    fn test_wrap_preserves_exit_code() {
        let script = wrap_with_probe("false");
        assert!(script.starts_with("false\n"));
        assert!(script.ends_with("exit $__sandbay_rc"));
        assert!(script.contains(PWD_SENTINEL));
    }

    #[test]
    fn test_is_mutating() {
        assert!(is_mutating("mkdir sub"));
        assert!(is_mutating("ls && rm -rf build"));
        assert!(is_mutating("echo hi > out.txt"));
        assert!(is_mutating("echo hi>>log"));
        assert!(is_mutating("npm install express"));
        assert!(is_mutating("vim index.html"));
        assert!(!is_mutating("ls -la"));
        assert!(!is_mutating("cat file 2>&1"));
        assert!(!is_mutating("node app.js > /dev/null"));
        assert!(!is_mutating("pwd"));
        assert!(!is_mutating("echo firmware"));
    }

    #[test]
    fn test_observe_adopts_probe() {
        let mut shell = LogicalShell::new("/workspace");
        let visible = shell.observe(&format!("ok\n{}/workspace/x/../y\n", PWD_SENTINEL));
        assert_eq!(visible, "ok");
        assert_eq!(shell.cwd(), "/workspace/y");
    }

    #[test]
    fn test_relative_initial_cwd() {
        assert_eq!(LogicalShell::new("src").cwd(), "/workspace/src");
    }
}
