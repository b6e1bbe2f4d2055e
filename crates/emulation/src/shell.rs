//! Shell command rendering.
//!
//! Commands are assembled from words and only turned into text at the very
//! end, so quoting is applied in exactly one place.

use std::fmt;
use std::path::Path;

/// Quote `word` for a POSIX shell.
///
/// Words made only of characters with no special meaning are returned as is.
/// A leading `~/` is kept outside the quotes so the node's shell still
/// expands it.
pub fn quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    if word.bytes().all(is_plain) {
        return word.to_string();
    }
    if let Some(rest) = word.strip_prefix("~/") {
        return format!("~/{}", quote(rest));
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"_-./=:,+@%~".contains(&b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Word {
    Literal(String),
    /// Left for the shell to expand, e.g. `$MAHIMAHI_BASE`.
    Expand(String),
}

impl Word {
    fn render(&self) -> String {
        match self {
            Word::Literal(s) => quote(s),
            Word::Expand(s) => s.clone(),
        }
    }
}

/// A single program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    sudo: bool,
    program: String,
    args: Vec<Word>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            sudo: false,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn from_path(program: &Path) -> Self {
        Self::new(program.to_string_lossy())
    }

    /// Prefix the invocation with `sudo`.
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(Word::Literal(arg.to_string()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args
            .extend(args.into_iter().map(|a| Word::Literal(a.to_string())));
        self
    }

    /// `--name=value` as one word.
    pub fn opt(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{name}={value}"))
    }

    /// An argument the shell must expand rather than receive literally.
    pub fn expand(mut self, raw: impl Into<String>) -> Self {
        self.args.push(Word::Expand(raw.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.sudo {
            out.push_str("sudo ");
        }
        out.push_str(&quote(&self.program));
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.render());
        }
        out
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Steps joined with `&&`, with the last step's output optionally sent to a
/// log file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    steps: Vec<String>,
    log: Option<String>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleep(mut self, secs: impl fmt::Display) -> Self {
        self.steps.push(format!("sleep {secs}"));
        self
    }

    pub fn cd(mut self, dir: &Path) -> Self {
        self.steps.push(format!("cd {}", quote(&dir.to_string_lossy())));
        self
    }

    pub fn then(mut self, cmd: ShellCommand) -> Self {
        self.steps.push(cmd.render());
        self
    }

    /// Send stdout and stderr of the final step to `path`.
    pub fn log_to(mut self, path: &Path) -> Self {
        self.log = Some(quote(&path.to_string_lossy()));
        self
    }

    pub fn render(&self) -> String {
        let mut out = self.steps.join(" && ");
        if let Some(log) = &self.log {
            out.push_str(&format!(" > {log} 2>&1"));
        }
        out
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A generated bash script that tracks the pids of the processes it spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    body: String,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl Script {
    pub fn new() -> Self {
        Self {
            body: "#!/bin/bash\nset -x\n\npids=()\n".to_string(),
        }
    }

    pub fn line(&mut self, line: impl AsRef<str>) -> &mut Self {
        self.body.push_str(line.as_ref());
        self.body.push('\n');
        self
    }

    /// Background `fragment` without waiting for it.
    pub fn detach(&mut self, fragment: impl AsRef<str>) -> &mut Self {
        self.line(format!("{} &", fragment.as_ref()))
    }

    /// Background `fragment` in a subshell and add it to the wait-list.
    pub fn spawn(&mut self, fragment: impl AsRef<str>) -> &mut Self {
        self.line(format!("({}) &", fragment.as_ref()));
        self.line("pids+=($!)")
    }

    /// Block until every spawned process has exited.
    pub fn wait_all(&mut self) -> &mut Self {
        self.line("");
        self.line("for pid in ${pids[*]}; do");
        self.line("    wait $pid");
        self.line("done")
    }

    pub fn as_str(&self) -> &str {
        &self.body
    }

    pub fn into_string(self) -> String {
        self.body
    }
}
