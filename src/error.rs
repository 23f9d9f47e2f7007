use std::fmt;

/// Error surfaced while parsing a single line of a crontab file.
///
/// Carries the 1-based line number so callers can report `path:line: message`
/// the way a shell would report a syntax error.
#[derive(Debug, thiserror::Error)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        ParseError {
            line,
            message: message.into(),
        }
    }
}

/// Error surfaced while compiling a schedule spec (5-field expression,
/// nickname, or `@every` duration).
#[derive(Debug, thiserror::Error)]
#[error("invalid schedule {spec:?}: {reason}")]
pub struct ScheduleError {
    pub spec: String,
    pub reason: String,
}

impl ScheduleError {
    pub fn new(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        ScheduleError {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}

/// Error surfaced when the Executor fails to spawn or wait on a child
/// process. Distinct from a non-zero exit code, which is not an error.
#[derive(Debug, thiserror::Error)]
#[error("spawn failed: {0}")]
pub struct SpawnError(pub String);

/// Fatal errors: anything that should terminate the process outright.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecognized log level {0:?}")]
    BadLogLevel(String),
    #[error("failed to parse inline crontab {source}: {error}")]
    InlineCrontab { source: String, error: ParseError },
}
