//! Bakefile parser.
//!
//! A Bakefile is a Dockerfile-like recipe. Supports line continuations
//! (`\`), comments, quoted arguments, and both shell and JSON (exec) forms
//! for CMD/ENTRYPOINT:
//!
//! ```text
//! FROM base-os:20.04
//! ENV DEBIAN_FRONTEND=noninteractive
//! INSTALL httpd phpRuntime devTools
//! PATCH --lines-containing=Listen ports.conf 80 8080
//! PATCH vhost.conf ":80>" ":8080>"
//! COPY index.php register.php /srv/www/
//! WORKDIR /srv/www
//! EXPOSE 8080
//! CMD ["httpd-ctl", "-D", "FOREGROUND"]
//! LISTEN /ports.conf
//! ```

use std::path::Path;

use a3s_bake_core::directive::{BuildDirective, ListenConfig, PatchScope, Step};
use a3s_bake_core::error::{BakeError, Result};

/// Parse Bakefile text into a directive.
pub fn parse(content: &str) -> Result<BuildDirective> {
    let mut parser = Parser::default();

    for (line_num, line) in join_continuation_lines(content) {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        parser.instruction(trimmed, line_num)?;
    }

    parser.finish()
}

/// Parse a Bakefile from a file path.
pub fn from_file(path: &Path) -> Result<BuildDirective> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BakeError::ConfigError(format!("Failed to read recipe at {}: {}", path.display(), e))
    })?;
    parse(&content)
}

/// Load a directive from `path`: `.json` and `.yaml`/`.yml` files hold the
/// serialized form, anything else is a Bakefile.
pub fn load_directive(path: &Path) -> Result<BuildDirective> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("json") | Some("yaml") | Some("yml") => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                BakeError::ConfigError(format!(
                    "Failed to read directive at {}: {}",
                    path.display(),
                    e
                ))
            })?;
            if extension.as_deref() == Some("json") {
                BuildDirective::from_json(&content)
            } else {
                BuildDirective::from_yaml(&content)
            }
        }
        _ => from_file(path),
    }
}

#[derive(Default)]
struct Parser {
    steps: Vec<Step>,
    listen: Option<ListenConfig>,
    /// Slot of the combined entrypoint step, once CMD or ENTRYPOINT is seen
    entry_slot: Option<usize>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
}

impl Parser {
    fn instruction(&mut self, line: &str, line_num: usize) -> Result<()> {
        let (keyword, rest) = split_first_word(line);
        let keyword_upper = keyword.to_uppercase();

        match keyword_upper.as_str() {
            "FROM" => {
                let args = expect_args(rest, line_num, "FROM", 1, Some(1))?;
                self.steps.push(Step::fetch_base(args[0].clone()));
            }
            "ENV" => self.env(rest, line_num)?,
            "INSTALL" => self.install(rest, line_num)?,
            "PATCH" => self.patch(rest, line_num)?,
            "WRITE" => {
                let mut args = expect_args(rest, line_num, "WRITE", 2, Some(2))?;
                let content = args.pop().unwrap_or_default();
                let path = args.pop().unwrap_or_default();
                self.steps.push(Step::WriteFile { path, content });
            }
            "COPY" => self.copy(rest, line_num)?,
            "WORKDIR" => {
                let args = expect_args(rest, line_num, "WORKDIR", 1, Some(1))?;
                self.steps.push(Step::workdir(args[0].clone()));
            }
            "EXPOSE" => {
                for port in expect_args(rest, line_num, "EXPOSE", 1, None)? {
                    self.steps.push(Step::expose(parse_port(&port, line_num)?));
                }
            }
            "ENTRYPOINT" => {
                let exec = parse_exec(rest, line_num, "ENTRYPOINT")?;
                self.entrypoint = Some(exec);
                self.reserve_entry_slot();
            }
            "CMD" => {
                let exec = parse_exec(rest, line_num, "CMD")?;
                if self.cmd.is_some() {
                    tracing::warn!(line = line_num, "CMD given more than once, the last one wins");
                }
                self.cmd = Some(exec);
                self.reserve_entry_slot();
            }
            "LISTEN" => {
                let mut args = expect_args(rest, line_num, "LISTEN", 1, Some(2))?.into_iter();
                let mut listen = ListenConfig::new(args.next().unwrap_or_default());
                if let Some(keyword) = args.next() {
                    listen.keyword = keyword;
                }
                self.listen = Some(listen);
            }
            "RUN" | "ADD" => {
                return Err(recipe_error(
                    line_num,
                    format!(
                        "{} is not supported; use INSTALL, PATCH, WRITE or COPY",
                        keyword_upper
                    ),
                ))
            }
            "LABEL" | "MAINTAINER" | "USER" | "STOPSIGNAL" | "HEALTHCHECK" => {
                tracing::warn!(
                    line = line_num,
                    instruction = keyword_upper.as_str(),
                    "Unsupported Bakefile instruction, skipping"
                );
            }
            _ => {
                return Err(recipe_error(
                    line_num,
                    format!("Unknown instruction '{}'", keyword),
                ))
            }
        }
        Ok(())
    }

    fn env(&mut self, rest: &str, line_num: usize) -> Result<()> {
        let args = expect_args(rest, line_num, "ENV", 1, None)?;

        // ENV KEY=VALUE [KEY=VALUE...]
        if args[0].contains('=') {
            for pair in args {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    recipe_error(line_num, format!("ENV expects KEY=VALUE, found '{}'", pair))
                })?;
                self.steps.push(Step::SetEnv {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
            return Ok(());
        }

        // Legacy form: ENV KEY VALUE
        let (key, value) = split_first_word(rest);
        if value.is_empty() {
            return Err(recipe_error(line_num, "ENV requires a key and value"));
        }
        self.steps.push(Step::SetEnv {
            key: key.to_string(),
            value: unquote(value),
        });
        Ok(())
    }

    fn install(&mut self, rest: &str, line_num: usize) -> Result<()> {
        let mut interactive = false;
        let mut packages = Vec::new();
        for arg in expect_args(rest, line_num, "INSTALL", 1, None)? {
            match arg.as_str() {
                "--interactive" => interactive = true,
                "--non-interactive" | "-y" => interactive = false,
                flag if flag.starts_with('-') => {
                    return Err(recipe_error(
                        line_num,
                        format!("INSTALL does not understand '{}'", flag),
                    ))
                }
                _ => packages.push(arg),
            }
        }
        if packages.is_empty() {
            return Err(recipe_error(line_num, "INSTALL requires at least one package"));
        }
        self.steps.push(Step::install(packages, interactive));
        Ok(())
    }

    fn patch(&mut self, rest: &str, line_num: usize) -> Result<()> {
        let mut scope = PatchScope::All;
        let mut operands = Vec::new();
        for arg in split_args(rest, line_num)? {
            if !operands.is_empty() || !arg.starts_with("--") {
                operands.push(arg);
                continue;
            }
            if arg == "--first" {
                scope = PatchScope::First;
            } else if let Some(filter) = arg.strip_prefix("--lines-containing=") {
                scope = PatchScope::LinesContaining(filter.to_string());
            } else {
                return Err(recipe_error(
                    line_num,
                    format!("PATCH does not understand '{}'", arg),
                ));
            }
        }

        let [path, pattern, replacement]: [String; 3] = operands.try_into().map_err(|_| {
            recipe_error(line_num, "PATCH requires a path, a pattern and a replacement")
        })?;
        self.steps.push(Step::PatchFile {
            path,
            pattern,
            replacement,
            scope,
        });
        Ok(())
    }

    fn copy(&mut self, rest: &str, line_num: usize) -> Result<()> {
        let mut parts = expect_args(rest, line_num, "COPY", 2, None)?;
        if parts[0].starts_with("--") {
            return Err(recipe_error(
                line_num,
                format!("COPY does not support '{}'", parts[0]),
            ));
        }

        let dest = parts.pop().unwrap_or_default();
        if parts.len() > 1 && !dest.ends_with('/') {
            return Err(recipe_error(
                line_num,
                "COPY with several sources requires a destination ending in '/'",
            ));
        }
        for source in parts {
            self.steps.push(Step::copy(source, dest.clone()));
        }
        Ok(())
    }

    fn reserve_entry_slot(&mut self) {
        if self.entry_slot.is_none() {
            self.entry_slot = Some(self.steps.len());
            self.steps.push(Step::SetEntrypoint {
                command: Vec::new(),
                args: Vec::new(),
            });
        }
    }

    fn finish(mut self) -> Result<BuildDirective> {
        if self.steps.is_empty() {
            return Err(BakeError::InvalidDirective(
                "Bakefile is empty or contains no instructions".to_string(),
            ));
        }

        if let Some(slot) = self.entry_slot {
            // ENTRYPOINT is the program, CMD its default arguments.
            let (command, args) = match (self.entrypoint.take(), self.cmd.take()) {
                (Some(entrypoint), cmd) => (entrypoint, cmd.unwrap_or_default()),
                (None, Some(cmd)) => (cmd, Vec::new()),
                (None, None) => (Vec::new(), Vec::new()),
            };
            self.steps[slot] = Step::SetEntrypoint { command, args };
        }

        Ok(BuildDirective {
            steps: self.steps,
            listen: self.listen,
        })
    }
}

/// Join lines ending with `\` into single logical lines, keeping the
/// number of the line each one starts on.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start, std::mem::take(&mut current)));
        }
    }

    if !current.is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Split arguments on whitespace, honouring single and double quotes.
/// Inside double quotes `\n`, `\t`, `\"` and `\\` are escapes.
fn split_args(s: &str, line_num: usize) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(recipe_error(line_num, "Unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => current.push('\n'),
                            Some('t') => current.push('\t'),
                            Some(other) => current.push(other),
                            None => {
                                return Err(recipe_error(line_num, "Unterminated double quote"))
                            }
                        },
                        Some(c) => current.push(c),
                        None => return Err(recipe_error(line_num, "Unterminated double quote")),
                    }
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

fn expect_args(
    rest: &str,
    line_num: usize,
    instruction: &str,
    min: usize,
    max: Option<usize>,
) -> Result<Vec<String>> {
    let args = split_args(rest, line_num)?;
    if args.len() < min {
        return Err(recipe_error(
            line_num,
            format!("{} requires at least {} argument(s)", instruction, min),
        ));
    }
    if let Some(max) = max {
        if args.len() > max {
            return Err(recipe_error(
                line_num,
                format!("{} takes at most {} argument(s)", instruction, max),
            ));
        }
    }
    Ok(args)
}

fn parse_port(spec: &str, line_num: usize) -> Result<u16> {
    let (port, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
    if !proto.eq_ignore_ascii_case("tcp") {
        return Err(recipe_error(
            line_num,
            format!("Only TCP ports can be exposed, found '{}'", spec),
        ));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(recipe_error(line_num, format!("Invalid port '{}'", spec))),
    }
}

/// Exec form (`["a", "b"]`) or shell form (wrapped in `/bin/sh -c`).
fn parse_exec(rest: &str, line_num: usize, instruction: &str) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(recipe_error(
            line_num,
            format!("{} requires an argument", instruction),
        ));
    }
    if rest.starts_with('[') {
        return parse_json_array(rest, line_num);
    }
    Ok(vec!["/bin/sh".to_string(), "-c".to_string(), rest.to_string()])
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        recipe_error(line_num, format!("Invalid JSON array '{}': {}", s, e))
    })
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn recipe_error(line: usize, message: impl Into<String>) -> BakeError {
    BakeError::Recipe {
        line,
        message: message.into(),
    }
}
