//! Crontab file parsing (C2): line classification and the task/env split.

use crate::env::Environ;
use crate::error::ParseError;
use crate::task::Task;

/// An ordered set of Tasks parsed from one crontab file (or virtual
/// source, e.g. `CONCRON_CRONTAB`).
#[derive(Debug, Clone, Default)]
pub struct Crontab {
    pub tasks: Vec<Task>,
}

impl Crontab {
    pub fn has(&self, task: &Task) -> bool {
        self.tasks.iter().any(|t| t.id == task.id)
    }

    fn add(&mut self, task: Task) {
        if !self.has(&task) {
            self.tasks.push(task);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineType {
    Invalid,
    Task,
    Env,
    Empty,
}

fn detect_line_type(s: &str) -> LineType {
    if s.is_empty() || s.starts_with('#') {
        return LineType::Empty;
    }
    let first = s.as_bytes()[0];
    if first == b'@' || first.is_ascii_digit() || first == b'*' {
        return LineType::Task;
    }
    if s.contains('=') {
        return LineType::Env;
    }
    LineType::Invalid
}

/// Parses a whole crontab file's contents. `env` seeds the local
/// environment; env lines mutate a copy of it as parsing proceeds, and each
/// task line captures a snapshot at the point it appears.
pub fn parse_crontab(path: &str, content: &str, env: Environ) -> Result<Crontab, ParseError> {
    let mut ct = Crontab::default();
    let mut local_env = env;

    for (idx, raw_line) in content.lines().enumerate() {
        let line_number = idx + 1;
        let line = raw_line.trim();

        match detect_line_type(line) {
            LineType::Empty => continue,
            LineType::Task => {
                let task = Task::parse(path, line, local_env.clone())
                    .map_err(|e| ParseError::new(line_number, e.message))?;
                ct.add(task);
            }
            LineType::Env => {
                local_env.set(line);
            }
            LineType::Invalid => {
                return Err(ParseError::new(line_number, "invalid line"));
            }
        }
    }

    Ok(ct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_blank_lines() {
        let ct = parse_crontab("t", "# hello\n\n  \n", Environ::new()).unwrap();
        assert!(ct.tasks.is_empty());
    }

    #[test]
    fn parses_env_then_task_capturing_snapshot() {
        let content = "FOO=bar\n@daily echo $FOO\nFOO=baz\n@hourly echo $FOO\n";
        let ct = parse_crontab("t", content, Environ::new()).unwrap();
        assert_eq!(ct.tasks.len(), 2);
        assert_eq!(ct.tasks[0].env.get("FOO", ""), "bar");
        assert_eq!(ct.tasks[1].env.get("FOO", ""), "baz");
    }

    #[test]
    fn invalid_line_fails_whole_file() {
        let content = "@daily echo ok\nthis is not valid\n";
        let err = parse_crontab("t", content, Environ::new()).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn duplicate_tasks_collapse() {
        let content = "@daily echo ok\n@daily echo ok\n";
        let ct = parse_crontab("t", content, Environ::new()).unwrap();
        assert_eq!(ct.tasks.len(), 1);
    }

    #[test]
    fn bad_schedule_reports_line_number() {
        let content = "not a valid sched * here\n";
        let err = parse_crontab("t", content, Environ::new());
        assert!(err.is_err());
    }

    #[test]
    fn reboot_line_does_not_require_schedule_compile() {
        let mut env = Environ::new();
        env.set("ENABLE_USER_COLUMN=yes");
        let ct = parse_crontab("t", "@reboot root echo hi\n", env).unwrap();
        assert_eq!(ct.tasks.len(), 1);
        assert!(ct.tasks[0].is_reboot);
    }
}
