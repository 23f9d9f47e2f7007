//! Executor (C7): runs a [`Task`]'s command as a child process, feeding
//! stdin, streaming stdout/stderr into the structured logger and the run's
//! captured log, and switching execution user on Unix.

use crate::status::StatusAggregator;
use crate::task::Task;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::error;

const DEFAULT_SHELL_OPTS: &str = "-c";

#[cfg(unix)]
const DEFAULT_SHELL: &str = "/bin/sh";

#[cfg(not(unix))]
const DEFAULT_SHELL: &str = "cmd.exe";

/// Splits `env.get("SHELL_OPTS", ...)` with POSIX word-splitting. Falls
/// back to treating the whole string as one argument if it isn't valid
/// shell-quoted text, mirroring `google/shlex`'s permissive behavior.
fn shell_opts(task: &Task) -> Vec<String> {
    let raw = task.env.get("SHELL_OPTS", DEFAULT_SHELL_OPTS);
    shlex::split(&raw).unwrap_or_else(|| vec![raw])
}

/// Runs `task` to completion, reporting start/finish through `status`.
/// Never returns an error: a failure to spawn is reported as exit code
/// `-1`, matching how a shell reports an unexecutable command. If `cancel`
/// fires before the child exits, it is killed and reported with exit code
/// `-1` rather than left to run past shutdown.
pub async fn run(task: &Task, status: &StatusAggregator, cancel: &CancellationToken) {
    let finisher = status.start_task(task);

    let shell = task.env.get("SHELL", DEFAULT_SHELL);

    let mut cmd = Command::new(&shell);
    cmd.args(shell_opts(task));
    if task.env.get_bool("PARSE_COMMAND") {
        match shlex::split(&task.command) {
            Some(words) => {
                cmd.args(words);
            }
            None => {
                cmd.arg(&task.command);
            }
        }
    } else {
        cmd.arg(&task.command);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.env_clear();
    for entry in task.env.iter() {
        if let Some((k, v)) = entry.split_once('=') {
            cmd.env(k, v);
        }
    }

    if let Err(e) = apply_user(&mut cmd, task) {
        finisher.finish(-1, e.to_string());
        return;
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let spawn_err = crate::error::SpawnError(e.to_string());
            error!(command = %task.command, error = %spawn_err, "failed to spawn");
            finisher.finish(-1, spawn_err.to_string());
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let payload = task.stdin.clone();
        tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
        });
    }

    // Streamed independently of the wait/cancel race below: they own their
    // reader and a clone of the labeling fields, so they keep draining
    // output even if the child is killed out from under `child.wait()`.
    let fields = LogFields::from(task);
    let stdout_task = tokio::spawn(stream_lines(child.stdout.take(), fields.clone(), "stdout"));
    let stderr_task = tokio::spawn(stream_lines(child.stderr.take(), fields, "stderr"));

    let (exit_code, wait_err) = tokio::select! {
        result = child.wait() => match result {
            Ok(exit_status) => (exit_status.code().unwrap_or(-1), None),
            Err(e) => (-1, Some(e.to_string())),
        },
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            (-1, Some("cancelled: shutting down".to_string()))
        }
    };

    let stdout_log = stdout_task.await.unwrap_or_default();
    let stderr_log = stderr_task.await.unwrap_or_default();

    let mut log = String::new();
    log.push_str(&stdout_log);
    log.push_str(&stderr_log);
    if log.is_empty() {
        if let Some(e) = wait_err {
            log = e;
        }
    }

    finisher.finish(exit_code, log);
}

/// The subset of a [`Task`]'s fields needed to label a streamed output
/// line, cloned out so the streaming task can be `'static`.
#[derive(Clone)]
struct LogFields {
    source: String,
    spec: String,
    user: String,
    command: String,
}

impl From<&Task> for LogFields {
    fn from(t: &Task) -> Self {
        LogFields {
            source: t.source.clone(),
            spec: t.spec.clone(),
            user: t.user.clone(),
            command: t.command.clone(),
        }
    }
}

/// Reads `reader` line by line, emitting one structured log event per line
/// (labeled stdout/stderr) and accumulating the text for the run's log.
async fn stream_lines<R: AsyncRead + Unpin + Send + 'static>(
    reader: Option<R>,
    fields: LogFields,
    label: &str,
) -> String {
    let Some(reader) = reader else { return String::new() };
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        if label == "stdout" {
            tracing::info!(
                target: "concron::stdout",
                source = %fields.source,
                schedule = %fields.spec,
                user = %fields.user,
                command = %fields.command,
                stdout = %line,
                "output"
            );
        } else {
            tracing::error!(
                target: "concron::stderr",
                source = %fields.source,
                schedule = %fields.spec,
                user = %fields.user,
                command = %fields.command,
                stderr = %line,
                "output"
            );
        }
        captured.push_str(&line);
        captured.push('\n');
    }

    captured
}

#[cfg(unix)]
fn apply_user(cmd: &mut Command, task: &Task) -> Result<(), std::io::Error> {
    use std::os::unix::process::CommandExt;

    let passwd = if task.user == "*" { lookup_current_user()? } else { lookup_user(&task.user)? };

    if task.user != "*" {
        let current_uid = unsafe { libc::getuid() };
        if current_uid != passwd.uid {
            let uid = passwd.uid;
            let gid = passwd.gid;
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
    }

    let home = task.env.get("HOME", &passwd.home_dir);
    cmd.env("USER", &passwd.name);
    cmd.env("LOGNAME", &passwd.name);
    cmd.env("HOME", &home);
    cmd.current_dir(&home);
    Ok(())
}

#[cfg(not(unix))]
fn apply_user(_cmd: &mut Command, task: &Task) -> Result<(), std::io::Error> {
    tracing::warn!(username = %task.user, "changing the execution user is not supported on this platform");
    Ok(())
}

#[cfg(unix)]
struct Passwd {
    name: String,
    uid: u32,
    gid: u32,
    home_dir: String,
}

/// Resolves a named user's uid/gid/home via `getpwnam_r`; the user must
/// exist in the container's passwd database. Not used for `"*"`, which
/// resolves via [`lookup_current_user`] instead.
#[cfg(unix)]
fn lookup_user(username: &str) -> Result<Passwd, std::io::Error> {
    use std::ffi::{CStr, CString};

    let cname = CString::new(username)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid username"))?;

    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0_i8; 16384];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("unknown user {username:?}"),
        ));
    }

    let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned();
    let home_dir = unsafe { CStr::from_ptr(pwd.pw_dir) }.to_string_lossy().into_owned();

    Ok(Passwd { name, uid: pwd.pw_uid, gid: pwd.pw_gid, home_dir })
}

/// Resolves the supervisor's own uid via `getpwuid_r`, for a task whose
/// user is `"*"` — mirrors `os/user.Current()`.
#[cfg(unix)]
fn lookup_current_user() -> Result<Passwd, std::io::Error> {
    use std::ffi::CStr;

    let uid = unsafe { libc::getuid() };

    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0_i8; 16384];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };

    if rc != 0 || result.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no passwd entry for uid {uid}"),
        ));
    }

    let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned();
    let home_dir = unsafe { CStr::from_ptr(pwd.pw_dir) }.to_string_lossy().into_owned();

    Ok(Passwd { name, uid: pwd.pw_uid, gid: pwd.pw_gid, home_dir })
}
