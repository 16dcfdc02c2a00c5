//! Stratafile parser.
//!
//! Parses a build manifest into an ordered sequence of instructions.
//! One `DIRECTIVE arg...` per line; directive keywords are
//! case-insensitive and order is significant. Supports `#` comments,
//! trailing-`\` line continuations, and JSON (exec) form for
//! ENTRYPOINT/CMD.

use strata_core::error::{Result, StrataError};

/// A single build instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image>`: base image reference, or `scratch` for an empty base
    From { image: String },
    /// `RUN <command>`: shell command executed against the rootfs
    Run { command: String },
    /// `COPY <pattern>... <dest>`: glob patterns resolved in the build context
    Copy { sources: Vec<String>, dest: String },
    /// `USER <name|uid>`: identity for subsequent RUN steps and the entrypoint
    User { user: String },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value>` or `ENV <key> <value>`
    Env { key: String, value: String },
    /// `EXPOSE <port>`: metadata only, never binds a host port
    Expose { port: u16 },
    /// `ENTRYPOINT ["exec", "form"]` or shell form
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]` or shell form
    Cmd { exec: Vec<String> },
}

impl Instruction {
    /// Canonical single-line rendering, used as the hash-chain input.
    ///
    /// Two instructions with the same canonical form are the same build
    /// step for caching purposes.
    pub fn canonical(&self) -> String {
        match self {
            Instruction::From { image } => format!("FROM {image}"),
            Instruction::Run { command } => format!("RUN {command}"),
            Instruction::Copy { sources, dest } => {
                format!("COPY {} {}", sources.join(" "), dest)
            }
            Instruction::User { user } => format!("USER {user}"),
            Instruction::Workdir { path } => format!("WORKDIR {path}"),
            Instruction::Env { key, value } => format!("ENV {key}={value}"),
            Instruction::Expose { port } => format!("EXPOSE {port}"),
            Instruction::Entrypoint { exec } => {
                format!("ENTRYPOINT {}", render_exec(exec))
            }
            Instruction::Cmd { exec } => format!("CMD {}", render_exec(exec)),
        }
    }

    /// Whether this instruction changes the filesystem (produces a layer
    /// payload) rather than only manifest metadata.
    pub fn produces_layer(&self) -> bool {
        matches!(
            self,
            Instruction::Run { .. } | Instruction::Copy { .. }
        )
    }
}

fn render_exec(exec: &[String]) -> String {
    serde_json::to_string(exec).unwrap_or_else(|_| exec.join(" "))
}

/// Parsed Stratafile: instructions in file order.
#[derive(Debug, Clone)]
pub struct Buildfile {
    pub instructions: Vec<Instruction>,
}

impl Buildfile {
    /// Parse a Stratafile from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();

        for (line_num, line) in logical_lines(content).into_iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            instructions.push(parse_line(trimmed, line_num + 1)?);
        }

        if instructions.is_empty() {
            return Err(StrataError::BuildfileError(
                "Buildfile is empty or contains no instructions".to_string(),
            ));
        }

        if !matches!(instructions[0], Instruction::From { .. }) {
            return Err(StrataError::BuildfileError(
                "First instruction must be FROM".to_string(),
            ));
        }

        if instructions[1..]
            .iter()
            .any(|i| matches!(i, Instruction::From { .. }))
        {
            return Err(StrataError::BuildfileError(
                "Only one FROM instruction is allowed".to_string(),
            ));
        }

        Ok(Buildfile { instructions })
    }

    /// Parse a Stratafile from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::BuildfileError(format!(
                "Failed to read Stratafile at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

/// Join lines ending with `\` into single logical lines.
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending = String::new();

    for raw in content.lines() {
        match raw.strip_suffix('\\') {
            Some(head) => {
                pending.push_str(head.trim_end());
                pending.push(' ');
            }
            None => {
                pending.push_str(raw);
                lines.push(std::mem::take(&mut pending));
            }
        }
    }

    if !pending.is_empty() {
        lines.push(pending);
    }

    lines
}

/// Parse one logical line into an Instruction.
fn parse_line(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim()),
        None => (line, ""),
    };

    let directive = keyword.to_uppercase();
    if rest.is_empty() {
        return Err(StrataError::BuildfileError(format!(
            "Line {line_num}: {directive} requires an argument"
        )));
    }

    match directive.as_str() {
        "FROM" => Ok(Instruction::From {
            image: first_word(rest).to_string(),
        }),
        "RUN" => {
            // JSON array form collapses to a shell command
            let command = if rest.starts_with('[') {
                parse_exec_array(rest, line_num)?.join(" ")
            } else {
                rest.to_string()
            };
            Ok(Instruction::Run { command })
        }
        "COPY" => parse_copy(rest, line_num),
        "USER" => Ok(Instruction::User {
            user: first_word(rest).to_string(),
        }),
        "WORKDIR" => Ok(Instruction::Workdir {
            path: rest.to_string(),
        }),
        "ENV" => parse_env(rest),
        "EXPOSE" => parse_expose(rest, line_num),
        "ENTRYPOINT" => Ok(Instruction::Entrypoint {
            exec: parse_exec(rest, line_num)?,
        }),
        "CMD" => Ok(Instruction::Cmd {
            exec: parse_exec(rest, line_num)?,
        }),
        _ => Err(StrataError::BuildfileError(format!(
            "Line {line_num}: Unknown directive '{keyword}'"
        ))),
    }
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or(s)
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(StrataError::BuildfileError(format!(
            "Line {line_num}: COPY requires at least one source pattern and a destination"
        )));
    }
    let (dest, sources) = parts.split_last().unwrap();
    Ok(Instruction::Copy {
        sources: sources.iter().map(|s| s.to_string()).collect(),
        dest: dest.to_string(),
    })
}

fn parse_env(rest: &str) -> Result<Instruction> {
    // ENV KEY=VALUE, falling back to the legacy `ENV KEY VALUE` form
    let (key, value) = match rest.split_once('=') {
        Some((k, v)) if !k.contains(char::is_whitespace) => (k, v),
        _ => rest.split_once(char::is_whitespace).unwrap_or((rest, "")),
    };
    Ok(Instruction::Env {
        key: key.trim().to_string(),
        value: unquote(value.trim()),
    })
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    // Accept `PORT` or `PORT/tcp`
    let spec = first_word(rest);
    let port_str = spec.split('/').next().unwrap_or(spec);
    let port: u16 = port_str.parse().map_err(|_| {
        StrataError::BuildfileError(format!(
            "Line {line_num}: EXPOSE requires a port number, got '{spec}'"
        ))
    })?;
    Ok(Instruction::Expose { port })
}

/// Parse ENTRYPOINT/CMD argument: JSON exec form, or shell form wrapped
/// in `/bin/sh -c`.
fn parse_exec(rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.starts_with('[') {
        parse_exec_array(rest, line_num)
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_exec_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        StrataError::BuildfileError(format!("Line {line_num}: Invalid JSON array '{s}': {e}"))
    })
}

/// Remove one matching pair of surrounding quotes.
fn unquote(s: &str) -> String {
    let stripped = s
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
    stripped.unwrap_or(s).to_string()
}
