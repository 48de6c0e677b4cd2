use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Account region, forwarded to the remote on login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Global,
    China,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Global => "global",
            Region::China => "china",
        }
    }
}

/// Photo renditions a remote item may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeVariant {
    Original,
    OriginalAlt,
    Medium,
    Thumb,
}

impl SizeVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeVariant::Original => "original",
            SizeVariant::OriginalAlt => "original_alt",
            SizeVariant::Medium => "medium",
            SizeVariant::Thumb => "thumb",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(SizeVariant::Original),
            "original_alt" => Some(SizeVariant::OriginalAlt),
            "medium" => Some(SizeVariant::Medium),
            "thumb" => Some(SizeVariant::Thumb),
            _ => None,
        }
    }
}

/// One of the two independently scheduled sync domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Drive,
    Photos,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Drive => f.write_str("drive"),
            Resource::Photos => f.write_str("photos"),
        }
    }
}
