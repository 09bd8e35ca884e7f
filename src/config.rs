use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ini::{Ini, Properties};
use lazy_static::lazy_static;
use regex::Regex;

pub const DEFAULT_CONFIG_FILE: &str = "spiderd.conf";

const SCRAPYD_SECTION: &str = "scrapyd";
const JOBLOGS_SECTION: &str = "joblogs";

lazy_static! {
    // a project section is exactly `project.<id>`, resource sections have more dots
    static ref PROJECT_SECTION: Regex = Regex::new(r"^project\.[^.]+$").unwrap();
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file `{path}`: {source}")]
    Read { path: PathBuf, source: ini::Error },

    #[error("missing `[{0}]` section in configuration")]
    MissingSection(String),

    #[error("missing `{key}` in `[{section}]` section")]
    MissingKey { section: String, key: String },

    #[error("invalid value `{value}` for `{key}` in `[{section}]`: {message}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        message: String,
    },
}

impl ConfigError {
    fn invalid(section: &str, key: &str, value: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }
}

/// Service configuration, read from one or more INI files. Later files
/// override keys from earlier ones.
pub struct Config {
    ini: Ini,
    projects: Vec<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Config, ConfigError> {
        let mut merged = Ini::new();
        for path in paths {
            let path: &Path = path.as_ref();
            let file = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            for (section, props) in file.iter() {
                for (key, value) in props.iter() {
                    merged.set_to(section, key.to_string(), value.to_string());
                }
            }
        }
        Self::from_ini(merged)
    }

    pub fn from_ini(ini: Ini) -> Result<Config, ConfigError> {
        if ini.section(Some(SCRAPYD_SECTION)).is_none() {
            return Err(ConfigError::MissingSection(SCRAPYD_SECTION.to_string()));
        }

        let projects = ini
            .iter()
            .filter_map(|(section, _)| section)
            .filter(|section| PROJECT_SECTION.is_match(section))
            .map(|section| section["project.".len()..].to_string())
            .collect();

        Ok(Config { ini, projects })
    }

    fn scrapyd(&self) -> &Properties {
        // presence is checked in from_ini
        self.ini
            .section(Some(SCRAPYD_SECTION))
            .unwrap_or_else(|| unreachable!("[scrapyd] section checked at load time"))
    }

    pub fn bind_address(&self) -> &str {
        self.scrapyd().get("bind_address").unwrap_or("127.0.0.1")
    }

    pub fn http_port(&self) -> Result<u16, ConfigError> {
        let raw = self.scrapyd().get("http_port").unwrap_or("6800");
        raw.parse()
            .map_err(|_| ConfigError::invalid(SCRAPYD_SECTION, "http_port", raw, "expected a port number"))
    }

    pub fn username(&self) -> Option<&str> {
        self.scrapyd().get("username")
    }

    pub fn password(&self) -> Option<&str> {
        self.scrapyd().get("password")
    }

    pub fn namespace(&self) -> &str {
        self.scrapyd().get("namespace").unwrap_or("default")
    }

    /// Maximum number of concurrently running jobs. `None` means unlimited,
    /// `Some(0)` means jobs are created suspended and never started.
    pub fn max_proc(&self) -> Result<Option<u32>, ConfigError> {
        match self.scrapyd().get("max_proc") {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::invalid(SCRAPYD_SECTION, "max_proc", raw, "expected a non-negative integer")),
        }
    }

    pub fn repository_id(&self) -> &str {
        self.scrapyd().get("repository").unwrap_or("remote")
    }

    pub fn launcher_id(&self) -> &str {
        self.scrapyd().get("launcher").unwrap_or("k8s")
    }

    pub fn pull_secret(&self) -> Option<&str> {
        self.scrapyd().get("pull_secret")
    }

    pub fn backoff_time_secs(&self) -> Result<u64, ConfigError> {
        let raw = self.scrapyd().get("backoff_time").unwrap_or("5");
        raw.parse()
            .map_err(|_| ConfigError::invalid(SCRAPYD_SECTION, "backoff_time", raw, "expected seconds"))
    }

    pub fn backoff_coefficient(&self) -> Result<u32, ConfigError> {
        let raw = self.scrapyd().get("backoff_coefficient").unwrap_or("2");
        raw.parse()
            .map_err(|_| ConfigError::invalid(SCRAPYD_SECTION, "backoff_coefficient", raw, "expected an integer"))
    }

    pub fn log_level(&self) -> &str {
        self.scrapyd().get("log_level").unwrap_or("INFO")
    }

    pub fn node_name(&self) -> Option<&str> {
        self.scrapyd().get("node_name")
    }

    pub fn listprojects(&self) -> &[String] {
        &self.projects
    }

    pub fn project(&self, id: &str) -> Option<ProjectConfig<'_>> {
        let id = self.projects.iter().find(|known| known.as_str() == id)?;
        Some(ProjectConfig { id, config: self })
    }

    pub fn joblogs(&self) -> Option<JobLogsConfig<'_>> {
        self.ini
            .section(Some(JOBLOGS_SECTION))
            .map(|props| JobLogsConfig { props })
    }

    /// Raw provider arguments from `[joblogs.storage.<provider>]`, before
    /// `${ENV}` placeholder substitution.
    pub fn joblogs_storage(&self, provider: &str) -> Option<BTreeMap<String, String>> {
        let section = format!("{JOBLOGS_SECTION}.storage.{provider}");
        self.ini.section(Some(section)).map(|props| {
            props
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect()
        })
    }

    fn resource_section(&self, section: &str, dest: &mut Resources) {
        if let Some(props) = self.ini.section(Some(section)) {
            for (key, value) in props.iter() {
                if let Some(name) = key.strip_prefix("requests_") {
                    dest.requests.insert(name.to_string(), value.to_string());
                } else if let Some(name) = key.strip_prefix("limits_") {
                    dest.limits.insert(name.to_string(), value.to_string());
                }
            }
        }
    }
}

/// View over a `[project.<id>]` section.
pub struct ProjectConfig<'a> {
    id: &'a str,
    config: &'a Config,
}

impl ProjectConfig<'_> {
    pub fn id(&self) -> &str {
        self.id
    }

    fn props(&self) -> Option<&Properties> {
        self.config.ini.section(Some(format!("project.{}", self.id)))
    }

    /// The image repository the project's versions are published to.
    pub fn repository(&self) -> Result<&str, ConfigError> {
        self.props()
            .and_then(|props| props.get("repository"))
            .ok_or_else(|| ConfigError::MissingKey {
                section: format!("project.{}", self.id),
                key: "repository".to_string(),
            })
    }

    pub fn env_config(&self) -> Option<&str> {
        self.props().and_then(|props| props.get("env_config"))
    }

    pub fn env_secret(&self) -> Option<&str> {
        self.props().and_then(|props| props.get("env_secret"))
    }

    /// Layered resource requirements: defaults, then project, then spider
    /// overrides, key by key.
    pub fn resources(&self, spider: Option<&str>) -> Resources {
        let mut resources = Resources::default();
        self.config.resource_section("default.resources", &mut resources);
        self.config
            .resource_section(&format!("project.{}.resources", self.id), &mut resources);
        if let Some(spider) = spider {
            self.config
                .resource_section(&format!("project.{}.{}.resources", self.id, spider), &mut resources);
        }
        resources
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resources {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// View over the `[joblogs]` section.
pub struct JobLogsConfig<'a> {
    props: &'a Properties,
}

impl JobLogsConfig<'_> {
    pub fn storage_provider(&self) -> Option<&str> {
        self.props.get("storage_provider")
    }

    pub fn container_name(&self) -> Option<&str> {
        self.props.get("container_name")
    }

    pub fn logs_dir(&self) -> Result<&str, ConfigError> {
        match self.props.get("logs_dir").map(str::trim) {
            Some(dir) if !dir.is_empty() => Ok(dir),
            _ => Err(ConfigError::MissingKey {
                section: JOBLOGS_SECTION.to_string(),
                key: "logs_dir".to_string(),
            }),
        }
    }

    pub fn num_lines_to_check(&self) -> Result<usize, ConfigError> {
        let raw = self.props.get("num_lines_to_check").unwrap_or("0");
        raw.parse().map_err(|_| {
            ConfigError::invalid(JOBLOGS_SECTION, "num_lines_to_check", raw, "expected a non-negative integer")
        })
    }

    pub fn compression_method(&self) -> Option<&str> {
        self.props.get("compression_method")
    }
}
