//! `Task` — a single executable unit parsed from one crontab line (part of C2),
//! including its CRC64 fingerprint and the stdin-escaping convention.

use crate::env::Environ;
use crate::error::ParseError;
use crate::schedule::Schedule;
use crc::{Crc, CRC_64_GO_ISO};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// An executable unit derived from one crontab line.
///
/// Never mutated after parsing — `id` is a fingerprint over every
/// observable field, so two tasks with the same id are behaviorally
/// identical and any change to any field changes the id.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub source: String,
    pub spec: String,
    pub schedule: Option<Schedule>,
    pub is_reboot: bool,
    pub user: String,
    pub command: String,
    pub stdin: String,
    pub env: Environ,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Task {
    /// Parses one already-trimmed, non-empty task line. `env` is the local
    /// environment captured at this point in the crontab (cloned in).
    pub fn parse(source: &str, line: &str, env: Environ) -> Result<Task, ParseError> {
        let (spec, user, command, stdin) = split_task_line(line, &env);

        let (schedule, is_reboot) = if spec == "@reboot" {
            (None, true)
        } else {
            let tz = env.get("CRON_TZ", &env.get("TZ", ""));
            let schedule = Schedule::parse(&spec, &tz)
                .map_err(|e| ParseError::new(0, format!("{e}")))?;
            (Some(schedule), false)
        };

        let mut task = Task {
            id: 0,
            source: source.to_string(),
            spec,
            schedule,
            is_reboot,
            user,
            command,
            stdin,
            env,
        };
        task.id = task.fingerprint();
        Ok(task)
    }

    fn fingerprint(&self) -> u64 {
        let mut digest = CRC64.digest();
        digest.update(self.source.as_bytes());
        digest.update(b"\n");
        digest.update(self.spec.as_bytes());
        digest.update(b"\n");
        digest.update(self.user.as_bytes());
        digest.update(b"\n");
        digest.update(self.command.as_bytes());
        digest.update(b"\n");
        digest.update(self.stdin.as_bytes());
        digest.update(b"\n");
        for entry in self.env.iter() {
            digest.update(entry.as_bytes());
            digest.update(b"\n");
        }
        digest.finalize()
    }

    /// Stdin with `%` and newlines escaped back into the `%`-separated wire
    /// form (inverse of the decoding done while parsing).
    pub fn escaped_stdin(&self) -> String {
        self.stdin.replace('%', "\\%").replace('\n', "%")
    }

    /// The command with its stdin re-attached, as it would appear in a
    /// crontab line.
    pub fn command_with_stdin(&self) -> String {
        let cmd = self.command.replace('%', "\\%");
        if self.stdin.is_empty() {
            cmd
        } else {
            format!("{cmd}%{}", self.escaped_stdin())
        }
    }

    /// Canonical crontab-line form. Round-tripping this back through
    /// `Task::parse` with the same env must produce an identical `id`.
    pub fn string(&self) -> String {
        format!("{}  {}  {}", self.spec, self.user, self.command_with_stdin())
    }
}

/// Splits a task line into (spec, user, command, stdin).
///
/// The user column is only present when `ENABLE_USER_COLUMN` is truthy;
/// otherwise `user` is always the sentinel `"*"`.
fn split_task_line(s: &str, env: &Environ) -> (String, String, String, String) {
    let fields: Vec<&str> = s.split_whitespace().collect();
    let has_user_column = env.get_bool("ENABLE_USER_COLUMN");

    let (spec_fields, rest_start) = if s.starts_with('@') {
        if s.starts_with("@every") {
            (2, 2)
        } else {
            (1, 1)
        }
    } else {
        (5, 5)
    };

    let spec = fields[..spec_fields.min(fields.len())].join(" ");

    let (user, command_start) = if has_user_column {
        let user = fields.get(rest_start).copied().unwrap_or("*").to_string();
        (user, rest_start + 1)
    } else {
        ("*".to_string(), rest_start)
    };

    // Fields beyond the schedule/user columns are rejoined with single
    // spaces, matching the canonical form produced by `Task::string`.
    let command_part = fields[command_start.min(fields.len())..].join(" ");
    let (command, stdin) = parse_command(&command_part);

    (spec, user, command, stdin)
}

/// Splits `command%stdin` on the first unescaped `%`.
/// `\%` decodes to a literal `%` in both halves; unescaped `%` inside the
/// stdin half becomes a newline.
fn parse_command(s: &str) -> (String, String) {
    let bytes = s.as_bytes();
    let mut split_at = None;
    for i in 0..bytes.len() {
        if bytes[i] == b'%' && (i == 0 || bytes[i - 1] != b'\\') {
            split_at = Some(i);
            break;
        }
    }

    let (command_raw, stdin_raw) = match split_at {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    };

    let command = command_raw.replace("\\%", "%");
    // `\%` -> sentinel -> literal `%`; remaining `%` -> newline; restore sentinel.
    let stdin = stdin_raw
        .replace("\\%", "\r")
        .replace('%', "\n")
        .replace('\r', "%");

    (command, stdin)
}
