//! Dockerfile parser for the tessera build system.
//!
//! Turns a Dockerfile into an ordered list of stages, each a FROM directive
//! followed by the directives of that stage. Supports:
//! - Line continuations and full-line comments
//! - Trailing `#!COMMIT` annotations marking layer boundaries
//! - Global ARGs (usable in FROM lines), stage ARGs and ENV substitution
//!   (`$VAR`, `${VAR}`, `${VAR:-default}`)
//! - JSON (exec) and shell forms

use super::directive::{Directive, DirectiveKind, HealthcheckConfig, RunCommand};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

const COMMIT_ANNOTATION: &str = "#!COMMIT";

/// One build stage: its FROM directive and everything up to the next FROM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStage {
    pub from: Directive,
    pub directives: Vec<Directive>,
}

impl ParsedStage {
    /// The `AS` alias, if one was given.
    pub fn alias(&self) -> Option<&str> {
        match &self.from.kind {
            DirectiveKind::From { alias, .. } => alias.as_deref(),
            _ => None,
        }
    }
}

/// Dockerfile parse error.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
    pub hint: Option<String>,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into(), hint: None }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  Hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Parses a Dockerfile from a string.
///
/// `build_args` override ARG defaults, both global and per stage.
///
/// # Examples
/// ```
/// use std::collections::HashMap;
/// use tessera_core::builder::parser::parse_dockerfile;
///
/// let dockerfile = r#"
/// FROM alpine:3.19
/// RUN apk add --no-cache nginx #!COMMIT
/// CMD ["nginx", "-g", "daemon off;"]
/// "#;
///
/// let stages = parse_dockerfile(dockerfile, &HashMap::new()).unwrap();
/// assert_eq!(stages.len(), 1);
/// assert!(stages[0].directives[0].commit);
/// ```
pub fn parse_dockerfile(
    content: &str,
    build_args: &HashMap<String, String>,
) -> Result<Vec<ParsedStage>, ParseError> {
    let mut parser = DockerfileParser::new(content, build_args);
    parser.parse()
}

/// Parses a Dockerfile from a file.
pub fn parse_dockerfile_file(
    path: &Path,
    build_args: &HashMap<String, String>,
) -> Result<Vec<ParsedStage>, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ParseError::new(0, format!("Failed to read Dockerfile: {}", e))
            .with_hint(format!("Check that {} exists and is readable", path.display()))
    })?;

    parse_dockerfile(&content, build_args)
}

/// A logical line after joining continuations.
struct Line {
    number: usize,
    text: String,
    commit: bool,
}

/// Internal parser state.
struct DockerfileParser<'a> {
    lines: Vec<Line>,
    pos: usize,
    build_args: &'a HashMap<String, String>,
    global_args: HashMap<String, String>,
    // ARG and ENV values visible in the current stage.
    stage_vars: HashMap<String, String>,
}

impl<'a> DockerfileParser<'a> {
    fn new(content: &str, build_args: &'a HashMap<String, String>) -> Self {
        Self {
            lines: Self::preprocess(content),
            pos: 0,
            build_args,
            global_args: HashMap::new(),
            stage_vars: HashMap::new(),
        }
    }

    /// Joins continuation lines, drops comment lines and strips commit
    /// annotations.
    fn preprocess(content: &str) -> Vec<Line> {
        let mut result = Vec::new();
        let mut current: Option<Line> = None;

        for (idx, raw) in content.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.starts_with('#') && !trimmed.starts_with(COMMIT_ANNOTATION) {
                continue;
            }
            if trimmed.is_empty() && current.is_none() {
                continue;
            }

            let (text, commit) = match trimmed.strip_suffix(COMMIT_ANNOTATION) {
                Some(rest) => (rest.trim_end(), true),
                None => (trimmed, false),
            };
            let (text, continued) = match text.strip_suffix('\\') {
                Some(rest) => (rest.trim_end(), true),
                None => (text, false),
            };

            let line = current.get_or_insert_with(|| Line {
                number: idx + 1,
                text: String::new(),
                commit: false,
            });
            if !line.text.is_empty() && !text.is_empty() {
                line.text.push(' ');
            }
            line.text.push_str(text);
            line.commit |= commit;

            if !continued {
                if let Some(line) = current.take() {
                    if !line.text.is_empty() {
                        result.push(line);
                    }
                }
            }
        }

        if let Some(line) = current {
            if !line.text.is_empty() {
                result.push(line);
            }
        }
        result
    }

    fn parse(&mut self) -> Result<Vec<ParsedStage>, ParseError> {
        // Global ARGs (before first FROM)
        while !self.is_eof() {
            let line = &self.lines[self.pos];
            let instruction = Self::extract_instruction(&line.text);
            if instruction == "FROM" {
                break;
            }
            if instruction != "ARG" {
                return Err(ParseError::new(
                    line.number,
                    format!("Expected ARG or FROM, found {}", instruction),
                )
                .with_hint("Dockerfile must start with ARG or FROM instruction"));
            }

            let (number, raw) = (line.number, Self::extract_args(&line.text).to_string());
            let raw = substitute(&raw, &self.global_args);
            let (name, default) = Self::parse_arg_spec(number, &raw)?;
            if let Some(value) = self.build_args.get(&name).cloned().or(default) {
                self.global_args.insert(name, value);
            }
            self.pos += 1;
        }

        let mut stages = Vec::new();
        while !self.is_eof() {
            stages.push(self.parse_stage()?);
        }

        if stages.is_empty() {
            return Err(ParseError::new(1, "Dockerfile must contain at least one FROM instruction"));
        }
        Ok(stages)
    }

    fn parse_stage(&mut self) -> Result<ParsedStage, ParseError> {
        let (number, text, commit) = {
            let line = self.current_line()?;
            (line.number, line.text.clone(), line.commit)
        };
        let instruction = Self::extract_instruction(&text);
        if instruction != "FROM" {
            return Err(ParseError::new(number, format!("Expected FROM, found {}", instruction))
                .with_hint("Each build stage must start with FROM"));
        }

        self.stage_vars.clear();
        let mut from = self.parse_from(number, Self::extract_args(&text))?;
        from.line = number;
        from.commit = commit;
        self.pos += 1;

        let mut directives = Vec::new();
        while !self.is_eof() {
            let line = &self.lines[self.pos];
            if Self::extract_instruction(&line.text) == "FROM" {
                break;
            }
            let (number, text, commit) = (line.number, line.text.clone(), line.commit);
            let mut directive = self.parse_instruction(number, &text)?;
            directive.line = number;
            directive.commit = commit;
            directives.push(directive);
            self.pos += 1;
        }

        Ok(ParsedStage { from, directives })
    }

    fn parse_instruction(&mut self, line_num: usize, line: &str) -> Result<Directive, ParseError> {
        let instruction = Self::extract_instruction(line);
        let raw = Self::extract_args(line);

        // Commands are left for the shell to expand.
        let args = match instruction.as_str() {
            "RUN" | "CMD" | "ENTRYPOINT" | "HEALTHCHECK" => raw.to_string(),
            _ => substitute(raw, &self.stage_vars),
        };

        let kind = match instruction.as_str() {
            "RUN" => self.parse_run(line_num, &args)?,
            "COPY" => self.parse_copy(line_num, &args, true)?,
            "ADD" => self.parse_copy(line_num, &args, false)?,
            "ENV" => self.parse_env(line_num, &args)?,
            "ARG" => self.parse_arg(line_num, &args)?,
            "LABEL" => self.parse_label(line_num, &args)?,
            "EXPOSE" => self.parse_expose(line_num, &args)?,
            "WORKDIR" => DirectiveKind::Workdir { path: self.single_value(line_num, "WORKDIR", &args)? },
            "USER" => DirectiveKind::User { user: self.single_value(line_num, "USER", &args)? },
            "VOLUME" => self.parse_volume(line_num, &args)?,
            "ENTRYPOINT" => DirectiveKind::Entrypoint { command: self.parse_run_command(line_num, &args)? },
            "CMD" => DirectiveKind::Cmd { command: self.parse_run_command(line_num, &args)? },
            "HEALTHCHECK" => self.parse_healthcheck(line_num, &args)?,
            "STOPSIGNAL" => DirectiveKind::StopSignal {
                signal: self.single_value(line_num, "STOPSIGNAL", &args)?,
            },
            "MAINTAINER" => DirectiveKind::Maintainer { author: args.clone() },
            "SHELL" => {
                return Err(ParseError::new(line_num, "SHELL is not supported")
                    .with_hint("Use RUN [\"executable\", \"arg\"] for a different interpreter"))
            }
            _ => return Err(ParseError::new(line_num, format!("Unknown instruction: {}", instruction))),
        };

        Ok(Directive::new(kind, args))
    }

    fn parse_from(&mut self, line_num: usize, raw: &str) -> Result<Directive, ParseError> {
        // FROM [--platform=<platform>] <image> [AS <name>]
        let args = substitute(raw, &self.global_args);
        let mut tokens: Vec<String> = tokenize(&args)
            .into_iter()
            .filter(|t| !t.starts_with("--platform="))
            .collect();

        let usage = "Usage: FROM <image> [AS <name>]";
        let alias = match tokens.len() {
            1 => None,
            3 if tokens[1].eq_ignore_ascii_case("AS") => tokens.pop(),
            0 => {
                return Err(ParseError::new(line_num, "FROM instruction requires an image reference")
                    .with_hint(usage))
            }
            _ => return Err(ParseError::new(line_num, "Malformed FROM instruction").with_hint(usage)),
        };

        Ok(Directive::new(DirectiveKind::From { image: tokens.swap_remove(0), alias }, args))
    }

    fn parse_run(&self, line_num: usize, args: &str) -> Result<DirectiveKind, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "RUN instruction requires a command")
                .with_hint("Usage: RUN <command> or RUN [\"executable\", \"arg1\"]"));
        }
        Ok(DirectiveKind::Run { command: self.parse_run_command(line_num, args)? })
    }

    fn parse_run_command(&self, line_num: usize, args: &str) -> Result<RunCommand, ParseError> {
        if let Some(argv) = parse_json_array(args) {
            if argv.is_empty() {
                return Err(ParseError::new(line_num, "Exec form requires at least one argument"));
            }
            return Ok(RunCommand::Exec(argv));
        }
        Ok(RunCommand::Shell(args.to_string()))
    }

    fn parse_copy(&self, line_num: usize, args: &str, is_copy: bool) -> Result<DirectiveKind, ParseError> {
        // COPY [--from=<stage>] [--chown=<user>:<group>] <src>... <dest>
        let name = if is_copy { "COPY" } else { "ADD" };
        let mut from_stage = None;
        let mut chown = None;

        let mut rest = args.trim_start();
        while rest.starts_with("--") {
            let (flag, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if let (true, Some(stage)) = (is_copy, flag.strip_prefix("--from=")) {
                from_stage = Some(stage.to_string());
            } else if let Some(owner) = flag.strip_prefix("--chown=") {
                chown = Some(owner.to_string());
            } else {
                return Err(ParseError::new(line_num, format!("Unsupported {} flag: {}", name, flag)));
            }
            rest = tail.trim_start();
        }

        let mut paths = parse_json_array(rest).unwrap_or_else(|| tokenize(rest));
        if paths.len() < 2 {
            return Err(ParseError::new(line_num, format!("{} requires at least source and destination", name))
                .with_hint(format!("Usage: {} <src>... <dest>", name)));
        }
        let destination = paths.pop().unwrap_or_default();
        if !is_copy && paths.iter().any(|p| p.starts_with("http://") || p.starts_with("https://")) {
            return Err(ParseError::new(line_num, "ADD from a remote URL is not supported")
                .with_hint("Download the file in a RUN step instead"));
        }

        Ok(if is_copy {
            DirectiveKind::Copy { from_stage, chown, sources: paths, destination }
        } else {
            DirectiveKind::Add { chown, sources: paths, destination }
        })
    }

    fn parse_env(&mut self, line_num: usize, args: &str) -> Result<DirectiveKind, ParseError> {
        // ENV key=value... or ENV key value
        let vars = Self::parse_pairs(line_num, "ENV", args)?;
        for (key, value) in &vars {
            self.stage_vars.insert(key.clone(), value.clone());
        }
        Ok(DirectiveKind::Env { vars })
    }

    fn parse_arg(&mut self, line_num: usize, args: &str) -> Result<DirectiveKind, ParseError> {
        let (name, default) = Self::parse_arg_spec(line_num, args)?;

        let value = self
            .build_args
            .get(&name)
            .cloned()
            .or(default)
            .or_else(|| self.global_args.get(&name).cloned());
        if let Some(value) = &value {
            self.stage_vars.insert(name.clone(), value.clone());
        }
        Ok(DirectiveKind::Arg { name, value })
    }

    fn parse_arg_spec(line_num: usize, args: &str) -> Result<(String, Option<String>), ParseError> {
        let tokens = tokenize(args);
        let spec = match tokens.as_slice() {
            [spec] => spec,
            _ => {
                return Err(ParseError::new(line_num, "ARG requires exactly one name")
                    .with_hint("Usage: ARG <name>[=<default>]"))
            }
        };
        Ok(match spec.split_once('=') {
            Some((name, default)) => (name.to_string(), Some(default.to_string())),
            None => (spec.clone(), None),
        })
    }

    fn parse_label(&self, line_num: usize, args: &str) -> Result<DirectiveKind, ParseError> {
        Ok(DirectiveKind::Label { labels: Self::parse_pairs(line_num, "LABEL", args)? })
    }

    /// `key=value...` pairs, or the legacy `key value with spaces` form.
    fn parse_pairs(line_num: usize, name: &str, args: &str) -> Result<Vec<(String, String)>, ParseError> {
        let tokens = tokenize(args);
        let first = tokens.first().ok_or_else(|| {
            ParseError::new(line_num, format!("{} requires at least one key=value pair", name))
        })?;

        if !first.contains('=') {
            if tokens.len() < 2 {
                return Err(ParseError::new(line_num, format!("{} requires a value", name)));
            }
            return Ok(vec![(first.clone(), tokens[1..].join(" "))]);
        }

        tokens
            .iter()
            .map(|token| match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(ParseError::new(line_num, format!("Invalid {} pair: {}", name, token))
                    .with_hint(format!("Usage: {} <key>=<value> ...", name))),
            })
            .collect()
    }

    fn parse_expose(&self, line_num: usize, args: &str) -> Result<DirectiveKind, ParseError> {
        let mut ports = Vec::new();

        for arg in tokenize(args) {
            let (port_str, protocol) = arg.split_once('/').unwrap_or((arg.as_str(), "tcp"));
            port_str
                .parse::<u16>()
                .map_err(|_| ParseError::new(line_num, format!("Invalid port number: {}", port_str)))?;

            let protocol = protocol.to_lowercase();
            if protocol != "tcp" && protocol != "udp" {
                return Err(ParseError::new(line_num, format!("Unknown protocol: {}", protocol))
                    .with_hint("Protocol must be 'tcp' or 'udp'"));
            }
            ports.push(format!("{}/{}", port_str, protocol));
        }

        if ports.is_empty() {
            return Err(ParseError::new(line_num, "EXPOSE requires at least one port"));
        }
        Ok(DirectiveKind::Expose { ports })
    }

    fn parse_volume(&self, line_num: usize, args: &str) -> Result<DirectiveKind, ParseError> {
        // VOLUME ["/data"] or VOLUME /data /var/log
        let paths = parse_json_array(args).unwrap_or_else(|| tokenize(args));
        if paths.is_empty() {
            return Err(ParseError::new(line_num, "VOLUME requires at least one path"));
        }
        Ok(DirectiveKind::Volume { paths })
    }

    fn parse_healthcheck(&self, line_num: usize, args: &str) -> Result<DirectiveKind, ParseError> {
        // HEALTHCHECK [OPTIONS] CMD command | HEALTHCHECK NONE
        let mut config = HealthcheckConfig::default();
        let mut rest = args.trim_start();

        while rest.starts_with("--") {
            let (flag, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let (name, value) = flag.split_once('=').unwrap_or((flag, ""));
            let duration = || {
                parse_duration(value).ok_or_else(|| {
                    ParseError::new(line_num, format!("Invalid duration for {}: {}", name, value))
                })
            };
            match name {
                "--interval" => config.interval = duration()?,
                "--timeout" => config.timeout = duration()?,
                "--start-period" => config.start_period = duration()?,
                "--retries" => {
                    config.retries = value.parse().map_err(|_| {
                        ParseError::new(line_num, format!("Invalid retries value: {}", value))
                    })?
                }
                _ => return Err(ParseError::new(line_num, format!("Unsupported HEALTHCHECK flag: {}", flag))),
            }
            rest = tail.trim_start();
        }

        let (keyword, command) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        config.test = match keyword.to_uppercase().as_str() {
            "NONE" => vec!["NONE".to_string()],
            "CMD" => match self.parse_run_command(line_num, command.trim())? {
                RunCommand::Exec(argv) => std::iter::once("CMD".to_string()).chain(argv).collect(),
                RunCommand::Shell(cmd) if !cmd.is_empty() => vec!["CMD-SHELL".to_string(), cmd],
                RunCommand::Shell(_) => {
                    return Err(ParseError::new(line_num, "HEALTHCHECK CMD requires a command"))
                }
            },
            _ => {
                return Err(ParseError::new(line_num, "HEALTHCHECK requires CMD or NONE")
                    .with_hint("Usage: HEALTHCHECK [OPTIONS] CMD <command>"))
            }
        };

        Ok(DirectiveKind::Healthcheck { config })
    }

    fn single_value(&self, line_num: usize, name: &str, args: &str) -> Result<String, ParseError> {
        let tokens = tokenize(args);
        if tokens.is_empty() {
            return Err(ParseError::new(line_num, format!("{} requires a value", name)));
        }
        Ok(tokens.join(" "))
    }

    fn extract_instruction(line: &str) -> String {
        line.split_whitespace().next().unwrap_or("").to_uppercase()
    }

    fn extract_args(line: &str) -> &str {
        line.split_once(char::is_whitespace).map(|(_, rest)| rest.trim()).unwrap_or("")
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.lines.len()
    }

    fn current_line(&self) -> Result<&Line, ParseError> {
        self.lines.get(self.pos).ok_or_else(|| {
            ParseError::new(self.lines.last().map(|l| l.number).unwrap_or(0), "Unexpected end of file")
        })
    }
}

/// A JSON string array, if `s` is one.
fn parse_json_array(s: &str) -> Option<Vec<String>> {
    if !s.trim_start().starts_with('[') {
        return None;
    }
    serde_json::from_str(s).ok()
}

/// Splits words on whitespace, honouring single and double quotes (which
/// are removed) and backslash escapes.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_token = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Expands `$NAME`, `${NAME}` and `${NAME:-default}`. Unknown names expand
/// to nothing; `\$` is a literal dollar sign.
fn substitute(s: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut expr = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    expr.push(c);
                }
                let (name, fallback) = match expr.split_once(":-") {
                    Some((name, fallback)) => (name, Some(fallback)),
                    None => (expr.as_str(), None),
                };
                match (vars.get(name), fallback) {
                    (Some(value), _) if !value.is_empty() || fallback.is_none() => out.push_str(value),
                    (_, Some(fallback)) => out.push_str(fallback),
                    _ => {}
                }
            }
            '$' if chars.peek().is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_') => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if !(c.is_ascii_alphanumeric() || c == '_') {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                if let Some(value) = vars.get(&name) {
                    out.push_str(value);
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Parses durations such as `30s`, `1m30s` or `500ms` into nanoseconds.
fn parse_duration(s: &str) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let mut total = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total += value * scale;
        rest = &rest[unit_end..];
    }
    Some(total as i64)
}
