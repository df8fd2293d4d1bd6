//! Boundary to the embedded scripting host.
//!
//! The host application is opaque: it takes script source and eventually
//! hands back a result. Everything here is about producing that source
//! safely and shipping it to an executor.
//!
//! Script text only comes from [`HostScript::render`] (or its
//! [`HostScript::call`] shorthand), whose templates are `&'static str` and
//! whose string arguments always go through [`escape_script_literal`]. There
//! is no way to splice an unescaped runtime string into a script.

use std::fmt;
use std::process::Stdio;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::InterpreterConfig;

/// Errors from the scripting host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The executor could not be started.
    #[error("Failed to start host interpreter: {0}")]
    Spawn(String),

    /// The script ran and reported failure.
    #[error("Host script failed: {0}")]
    Failed(String),

    /// The script ran but its result could not be used.
    #[error("Unexpected host output: {0}")]
    Output(String),

    /// A template and its arguments do not fit together.
    #[error("Invalid script template: {0}")]
    Template(String),
}

/// Executes scripts inside the host application.
///
/// Implementations must not block; a host that needs to wait does so inside
/// the returned future.
pub trait ScriptHost: Send + Sync + 'static {
    fn execute(&self, script: HostScript) -> BoxFuture<'_, Result<Value, HostError>>;
}

/// Escape `text` for use inside a quoted script string literal.
///
/// Backslash and both quote characters are escaped, as are newline and
/// carriage return so the literal stays on one line.
pub fn escape_script_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// A value interpolated into a script template.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptArg {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ScriptArg {
    fn render(&self) -> String {
        match self {
            ScriptArg::Str(text) => format!("\"{}\"", escape_script_literal(text)),
            ScriptArg::Int(n) => n.to_string(),
            ScriptArg::Float(x) if x.is_nan() => "NaN".to_string(),
            ScriptArg::Float(x) if x.is_infinite() && *x > 0.0 => "Infinity".to_string(),
            ScriptArg::Float(x) if x.is_infinite() => "-Infinity".to_string(),
            ScriptArg::Float(x) => x.to_string(),
            ScriptArg::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for ScriptArg {
    fn from(text: &str) -> Self {
        ScriptArg::Str(text.to_string())
    }
}

impl From<String> for ScriptArg {
    fn from(text: String) -> Self {
        ScriptArg::Str(text)
    }
}

impl From<i64> for ScriptArg {
    fn from(n: i64) -> Self {
        ScriptArg::Int(n)
    }
}

impl From<i32> for ScriptArg {
    fn from(n: i32) -> Self {
        ScriptArg::Int(n.into())
    }
}

impl From<u32> for ScriptArg {
    fn from(n: u32) -> Self {
        ScriptArg::Int(n.into())
    }
}

impl From<f64> for ScriptArg {
    fn from(x: f64) -> Self {
        ScriptArg::Float(x)
    }
}

impl From<bool> for ScriptArg {
    fn from(b: bool) -> Self {
        ScriptArg::Bool(b)
    }
}

/// Script source ready to hand to a [`ScriptHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostScript {
    source: String,
}

impl HostScript {
    /// Fill a template's `{}` placeholders with `args`, in order.
    ///
    /// `{{` and `}}` produce literal braces. The number of placeholders must
    /// match the number of arguments.
    pub fn render(template: &'static str, args: &[ScriptArg]) -> Result<Self, HostError> {
        let mut source = String::with_capacity(template.len());
        let mut remaining = args.iter();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match (c, chars.peek()) {
                ('{', Some('{')) => {
                    chars.next();
                    source.push('{');
                }
                ('}', Some('}')) => {
                    chars.next();
                    source.push('}');
                }
                ('{', Some('}')) => {
                    chars.next();
                    let arg = remaining.next().ok_or_else(|| {
                        HostError::Template(format!(
                            "'{}' needs more than {} argument(s)",
                            template,
                            args.len()
                        ))
                    })?;
                    source.push_str(&arg.render());
                }
                ('{', _) | ('}', _) => {
                    return Err(HostError::Template(format!(
                        "unbalanced brace in '{}'",
                        template
                    )));
                }
                (other, _) => source.push(other),
            }
        }

        if remaining.next().is_some() {
            return Err(HostError::Template(format!(
                "'{}' takes fewer than {} argument(s)",
                template,
                args.len()
            )));
        }

        Ok(Self { source })
    }

    /// A call of host-side `function` with `args`, e.g. `exportLayer(3, "out.png")`.
    pub fn call(function: &'static str, args: &[ScriptArg]) -> Self {
        let rendered: Vec<String> = args.iter().map(ScriptArg::render).collect();
        Self {
            source: format!("{}({})", function, rendered.join(", ")),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for HostScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Runs each script through an external interpreter process.
///
/// The script goes to the interpreter's stdin. Stdout is the result: JSON
/// when it parses as JSON, otherwise the trimmed text as a JSON string.
/// A non-zero exit status is a [`HostError::Failed`] carrying stderr.
#[derive(Debug, Clone)]
pub struct CommandHost {
    program: String,
    args: Vec<String>,
}

impl CommandHost {
    pub fn new(interpreter: InterpreterConfig) -> Self {
        Self {
            program: interpreter.program,
            args: interpreter.args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, script: HostScript) -> Result<Value, HostError> {
        debug!("Running host script via {}: {}", self.program, script);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::Spawn(format!("{}: {}", self.program, e)))?;

        // Feed the script while the output pipes drain, or a chatty
        // interpreter and a long script can block on each other.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(script.source().as_bytes()).await?;
                // Dropping stdin signals end of script
            }
            Ok::<(), std::io::Error>(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| HostError::Failed(format!("failed to wait for interpreter: {}", e)))?;

        // An interpreter may exit before reading the whole script; its exit
        // status decides then.
        if let Err(e) = fed {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(HostError::Spawn(format!("failed to write script: {}", e)));
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                format!("interpreter exited with {}", output.status)
            } else {
                stderr
            };
            return Err(HostError::Failed(detail));
        }

        parse_output(&output.stdout)
    }
}

impl ScriptHost for CommandHost {
    fn execute(&self, script: HostScript) -> BoxFuture<'_, Result<Value, HostError>> {
        Box::pin(self.run(script))
    }
}

/// Interpret interpreter stdout as a result value.
pub fn parse_output(stdout: &[u8]) -> Result<Value, HostError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|_| HostError::Output("output is not UTF-8".to_string()))?
        .trim();

    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}
