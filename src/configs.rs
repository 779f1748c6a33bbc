use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use globwalk::GlobWalkerBuilder;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const DEFAULT_SUPERVISOR_CONFIG: &str = "/etc/supervisor/supervisord.conf";
pub const DEFAULT_DATABASE: &str = "/var/lib/joblogger.db";
const LISTENER_SECTION: &str = "eventlistener:joblogger";

#[derive(Debug, Clone, PartialEq)]
pub struct JobLoggerConfig {
    pub database: PathBuf,
    /// Abort pending runtime timers when the job they guard ends.
    pub cancel_timers_on_exit: bool,
    pub runtime_limits: RuntimeLimits,
}

/// Maximum running time per program name. Not scoped by group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeLimits(HashMap<String, Duration>);

impl RuntimeLimits {
    pub fn get(&self, job: &str) -> Option<Duration> {
        self.0.get(job).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.0.iter().map(|(job, limit)| (job.as_str(), *limit))
    }
}

impl FromIterator<(String, Duration)> for RuntimeLimits {
    fn from_iter<T: IntoIterator<Item = (String, Duration)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Default for JobLoggerConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.into(),
            cancel_timers_on_exit: false,
            runtime_limits: Default::default(),
        }
    }
}

impl JobLoggerConfig {
    /// Reads the supervisord configuration and every file it includes.
    /// A missing main file yields the defaults.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        if !path.exists() {
            warn!("Supervisor config not found, using defaults");
            return Ok(config);
        }
        let mut visited = HashSet::new();
        config.read_file(path, &mut visited)?;
        Ok(config)
    }

    fn read_file(&mut self, path: &Path, visited: &mut HashSet<PathBuf>) -> Result<()> {
        let canonical = path
            .canonicalize()
            .wrap_err_with(|| format!("Failed to resolve {}", path.display()))?;
        if !visited.insert(canonical) {
            debug!(path = %path.display(), "Already read, skipping");
            return Ok(());
        }
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        self.apply(&parse_ini(&text), base_dir, visited)
            .wrap_err_with(|| format!("Invalid config {}", path.display()))
    }

    fn apply(
        &mut self,
        sections: &[Section],
        base_dir: &Path,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        for section in sections {
            match section.name.split_once(':') {
                _ if section.name == "include" => {
                    let Some(files) = section.get("files") else {
                        continue;
                    };
                    for pattern in files.split_whitespace() {
                        for file in expand_include(base_dir, pattern)? {
                            self.read_file(&file, visited)?;
                        }
                    }
                }
                Some(("program", name)) => {
                    if let Some(limit) = section.get("maxruntime") {
                        let limit = parse_duration(limit)
                            .wrap_err_with(|| format!("Invalid maxruntime for {name}"))?;
                        self.runtime_limits.0.insert(name.to_string(), limit);
                    }
                }
                _ if section.name == LISTENER_SECTION => {
                    if let Some(dbpath) = section.get("dbpath") {
                        self.database = parse_database_url(dbpath)?;
                    }
                    if let Some(flag) = section.get("cancel_timers_on_exit") {
                        self.cancel_timers_on_exit = parse_bool(flag)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Parses `<integer><unit>` where unit is one of `s`, `m`, `h`, `d`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let Some(unit) = text.chars().last() else {
        bail!("Empty duration");
    };
    let seconds_per_unit: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => bail!("Invalid duration {text:?}: unit must be one of s, m, h, d"),
    };
    let count: u64 = text[..text.len() - 1]
        .parse()
        .wrap_err_with(|| format!("Invalid duration {text:?}"))?;
    count
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| eyre!("Duration {text:?} is too large"))
}

/// Accepts plain paths and `sqlite:///` URLs (`sqlite:////abs/path.db`).
fn parse_database_url(url: &str) -> Result<PathBuf> {
    match url.split_once("://") {
        None => Ok(PathBuf::from(url)),
        Some(("sqlite", rest)) => match rest.strip_prefix('/') {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => bail!("Database URL {url:?} has no file path"),
        },
        Some((scheme, _)) => bail!("Unsupported database scheme {scheme:?}"),
    }
}

fn parse_bool(text: &str) -> Result<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => bail!("Invalid boolean {text:?}"),
    }
}

/// Files matching an include pattern, sorted. Relative patterns resolve
/// against the including file's directory.
fn expand_include(base_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = base_dir.join(pattern);
    let mut root = PathBuf::new();
    let mut glob = Vec::new();
    for component in full.components() {
        let text = component.as_os_str().to_string_lossy();
        if glob.is_empty() && !text.contains(['*', '?', '[']) {
            root.push(component);
        } else {
            glob.push(text.into_owned());
        }
    }
    if glob.is_empty() {
        return Ok(if root.is_file() { vec![root] } else { vec![] });
    }
    if !root.is_dir() {
        return Ok(vec![]);
    }

    let mut files: Vec<PathBuf> = GlobWalkerBuilder::from_patterns(&root, &[glob.join("/")])
        .max_depth(glob.len())
        .follow_links(true)
        .build()
        .wrap_err_with(|| format!("Invalid include pattern {pattern:?}"))?
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    Ok(files)
}

#[derive(Debug, Default)]
struct Section {
    name: String,
    values: Vec<(String, String)>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal reader for the supervisord INI dialect: `[section]` headers,
/// `key = value` or `key: value`, indented continuation lines, and `;`/`#`
/// comments.
fn parse_ini(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    for raw in text.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            sections.push(Section {
                name: name.trim().to_string(),
                ..Default::default()
            });
            continue;
        }
        let Some(section) = sections.last_mut() else {
            continue;
        };
        let value = strip_inline_comment(trimmed);
        if raw.starts_with(char::is_whitespace) {
            if let Some((_, previous)) = section.values.last_mut() {
                if !previous.is_empty() {
                    previous.push('\n');
                }
                previous.push_str(value);
                continue;
            }
        }
        let split_at = value.find(['=', ':']);
        if let Some(index) = split_at {
            let (key, rest) = value.split_at(index);
            section
                .values
                .push((key.trim().to_string(), rest[1..].trim().to_string()));
        }
    }
    sections
}

fn strip_inline_comment(line: &str) -> &str {
    match line.find(" ;") {
        Some(index) => line[..index].trim_end(),
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(30 * 60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86400));
        assert_eq!(parse_duration(" 0s ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_bad_durations() {
        for text in ["", "h", "10", "10w", "1.5h", "-1h", "1hh"] {
            assert!(parse_duration(text).is_err(), "{text:?} should be rejected");
        }
    }

    #[test]
    fn parses_database_urls() {
        assert_eq!(
            parse_database_url("sqlite:////var/lib/joblogger.db").unwrap(),
            PathBuf::from("/var/lib/joblogger.db")
        );
        assert_eq!(
            parse_database_url("sqlite:///jobs.db").unwrap(),
            PathBuf::from("jobs.db")
        );
        assert_eq!(
            parse_database_url("/tmp/jobs.db").unwrap(),
            PathBuf::from("/tmp/jobs.db")
        );
        assert!(parse_database_url("sqlite://").is_err());
        assert!(parse_database_url("postgres://localhost/jobs").is_err());
    }

    #[test]
    fn reads_ini_sections() {
        let sections = parse_ini(
            "; comment\n\
             [program:backup]\n\
             command = /usr/bin/backup ; inline\n\
             maxruntime: 2h\n\
             \n\
             [include]\n\
             files = a.conf\n\
             \x20   b/*.conf\n",
        );
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "program:backup");
        assert_eq!(sections[0].get("command"), Some("/usr/bin/backup"));
        assert_eq!(sections[0].get("maxruntime"), Some("2h"));
        assert_eq!(sections[1].get("files"), Some("a.conf\nb/*.conf"));
    }

    #[test]
    fn missing_config_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = JobLoggerConfig::load(&dir.path().join("absent.conf")).unwrap();
        assert_eq!(config, JobLoggerConfig::default());
    }

    #[test]
    fn loads_limits_listener_settings_and_includes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("conf.d")).unwrap();
        fs::write(
            dir.path().join("supervisord.conf"),
            "[supervisord]\nlogfile=/tmp/supervisord.log\n\n\
             [eventlistener:joblogger]\n\
             command=joblogger\n\
             events=PROCESS_STATE\n\
             dbpath=sqlite:////srv/jobs.db\n\n\
             [program:nightly]\n\
             command=/bin/nightly\n\
             maxruntime=1h\n\n\
             [program:web]\n\
             command=/bin/web\n\n\
             [include]\n\
             files = conf.d/*.conf\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("conf.d").join("report.conf"),
            "[program:report]\nmaxruntime=15m\n\n\
             [eventlistener:joblogger]\ncancel_timers_on_exit=true\n",
        )
        .unwrap();
        fs::write(dir.path().join("conf.d").join("ignored.ini"), "[program:x]\nmaxruntime=1s\n").unwrap();

        let config = JobLoggerConfig::load(&dir.path().join("supervisord.conf")).unwrap();
        assert_eq!(config.database, PathBuf::from("/srv/jobs.db"));
        assert!(config.cancel_timers_on_exit);
        assert_eq!(config.runtime_limits.iter().count(), 2);
        assert_eq!(config.runtime_limits.get("nightly"), Some(Duration::from_secs(3600)));
        assert_eq!(config.runtime_limits.get("report"), Some(Duration::from_secs(900)));
        assert_eq!(config.runtime_limits.get("web"), None);
        assert_eq!(config.runtime_limits.get("x"), None);
    }

    #[test]
    fn include_cycles_are_read_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.conf"),
            "[include]\nfiles=b.conf\n[program:a]\nmaxruntime=1m\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.conf"),
            "[include]\nfiles=a.conf\n[program:b]\nmaxruntime=2m\n",
        )
        .unwrap();

        let config = JobLoggerConfig::load(&dir.path().join("a.conf")).unwrap();
        assert_eq!(config.runtime_limits.iter().count(), 2);
    }

    #[test]
    fn invalid_maxruntime_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisord.conf");
        fs::write(&path, "[program:bad]\nmaxruntime=soon\n").unwrap();
        assert!(JobLoggerConfig::load(&path).is_err());
    }
}
