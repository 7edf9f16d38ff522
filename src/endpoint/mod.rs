//! Big-data cluster endpoints.
//!
//! An [`Endpoint`] is one configured cluster access point: where it lives,
//! which software stack it runs, and how many jobs it may hold at once.
//! Endpoints are loaded by the [`EndpointRegistry`] into immutable
//! [`EndpointSnapshot`]s that the control loops consume one cycle at a time.

pub mod registry;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::DriverKey;
use crate::transport::RemoteHost;

pub use registry::{EndpointRegistry, EndpointSnapshot};

/// Options every endpoint definition must carry.
pub const REQUIRED_OPTIONS: [&str; 10] = [
    "NameNode",
    "Port",
    "SiteName",
    "BigDataSoftware",
    "BigDataSoftwareVersion",
    "HighLevelLanguage/HLLName",
    "HighLevelLanguage/HLLVersion",
    "LimitQueueJobsEndPoint",
    "URL",
    "PublicIP",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointConfigError {
    #[error("missing option {0}")]
    MissingOption(&'static str),

    #[error("invalid value '{value}' for option {option}")]
    InvalidValue { option: &'static str, value: String },
}

/// High-level language binding of an endpoint (`none` when the endpoint
/// runs plain map/reduce jobs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    pub version: String,
}

/// Task-queue requirements an endpoint advertises when asking for work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    pub cpu_time: u64,
    /// Remaining requirement options, passed through untouched.
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// Submit pool this endpoint was configured under.
    pub pool: String,
    pub name_node: String,
    pub port: u16,
    pub site: String,
    pub software: String,
    pub software_version: String,
    pub language: Language,
    /// Maximum number of Submitted + Running jobs.
    pub capacity: u32,
    pub url: String,
    pub public_address: String,
    pub user: String,
    pub use_pilot: bool,
    pub interactive: bool,
    pub requirements: Requirements,
}

impl Endpoint {
    /// Build an endpoint from a flat option map.
    pub fn from_options(
        name: &str,
        pool: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Self, EndpointConfigError> {
        for option in REQUIRED_OPTIONS {
            if !options.contains_key(option) {
                return Err(EndpointConfigError::MissingOption(option));
            }
        }
        let get = |option: &'static str| options.get(option).cloned().unwrap_or_default();

        let port = parse_number::<u16>(options, "Port")?;
        let capacity = parse_number::<u32>(options, "LimitQueueJobsEndPoint")?;

        let mut requirements = Requirements::default();
        for (key, value) in options {
            let Some(requirement) = key.strip_prefix("Requirements/") else {
                continue;
            };
            if requirement == "CPUTime" {
                requirements.cpu_time =
                    value
                        .trim()
                        .parse()
                        .map_err(|_| EndpointConfigError::InvalidValue {
                            option: "Requirements/CPUTime",
                            value: value.clone(),
                        })?;
            } else {
                requirements
                    .extra
                    .insert(requirement.to_string(), value.clone());
            }
        }

        Ok(Self {
            name: name.to_string(),
            pool: pool.to_string(),
            name_node: get("NameNode"),
            port,
            site: get("SiteName"),
            software: get("BigDataSoftware"),
            software_version: get("BigDataSoftwareVersion"),
            language: Language {
                name: get("HighLevelLanguage/HLLName"),
                version: get("HighLevelLanguage/HLLVersion"),
            },
            capacity,
            url: get("URL"),
            public_address: get("PublicIP"),
            user: options.get("User").cloned().unwrap_or_default(),
            use_pilot: parse_flag(options.get("UsePilot")),
            interactive: parse_flag(options.get("IsInteractive")),
            requirements,
        })
    }

    /// String replica site labels are matched against.
    ///
    /// A replica site matches when it contains this identity as a substring.
    pub fn site_identity(&self) -> &str {
        &self.name
    }

    pub fn driver_key(&self) -> DriverKey {
        DriverKey::new(
            &self.software,
            &self.software_version,
            &self.language.name,
            self.interactive,
        )
    }

    pub fn remote_host(&self) -> RemoteHost {
        RemoteHost {
            user: self.user.clone(),
            address: self.public_address.clone(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    options: &BTreeMap<String, String>,
    option: &'static str,
) -> Result<T, EndpointConfigError> {
    let raw = options
        .get(option)
        .ok_or(EndpointConfigError::MissingOption(option))?;
    raw.trim()
        .parse()
        .map_err(|_| EndpointConfigError::InvalidValue {
            option,
            value: raw.clone(),
        })
}

fn parse_flag(value: Option<&String>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Tokens a job may use to select software, version and language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    pub software: Vec<String>,
    pub versions: Vec<String>,
    pub languages: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            software: vec!["hadoop".to_string(), "twister".to_string()],
            versions: vec!["hdv1".to_string(), "hdv2".to_string()],
            languages: vec!["none".to_string(), "hive".to_string(), "pig".to_string()],
        }
    }
}

impl Vocabulary {
    pub fn accepts_software(&self, token: &str) -> bool {
        self.software.iter().any(|s| s == token)
    }

    pub fn accepts_version(&self, token: &str) -> bool {
        self.versions.iter().any(|v| v == token)
    }

    pub fn accepts_language(&self, token: &str) -> bool {
        self.languages.iter().any(|l| l == token)
    }
}
