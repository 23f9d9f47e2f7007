//! Configuration loading (A3): environment-variable driven, validated at
//! start-up per the documented exit codes.

pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;
pub const EXIT_INLINE_CRONTAB_FAILURE: i32 = 2;

#[cfg(unix)]
const DEFAULT_PATH: &str = "/etc/crontab:/etc/cron.d";
#[cfg(not(unix))]
const DEFAULT_PATH: &str = r"C:\concron\crontab";

#[cfg(unix)]
const PATH_SEPARATOR: char = ':';
#[cfg(not(unix))]
const PATH_SEPARATOR: char = ';';

const DEFAULT_LISTEN: &str = ":8000";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    pub paths: Vec<String>,
    pub listen: String,
    pub log_level: String,
    pub inline_crontab: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let paths_raw = std::env::var("CONCRON_PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let paths = paths_raw
            .split(PATH_SEPARATOR)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .collect();

        Config {
            paths,
            listen: std::env::var("CONCRON_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string()),
            log_level: std::env::var("CONCRON_LOGLEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
            inline_crontab: std::env::var("CONCRON_CRONTAB").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_list() {
        let paths_raw = "/etc/crontab:/etc/cron.d".to_string();
        let paths: Vec<String> = paths_raw.split(PATH_SEPARATOR).map(str::to_string).collect();
        assert_eq!(paths, vec!["/etc/crontab", "/etc/cron.d"]);
    }
}
