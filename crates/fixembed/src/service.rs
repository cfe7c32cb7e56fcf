use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ServiceSetError;

/// Settings key under which the enabled-services set is stored.
pub const ENABLED_SERVICES_KEY: &str = "enabled_services";

/// Current version of the on-disk `ServiceSet` encoding.
const ENCODING_VERSION: u32 = 1;

/// Link sources the rewrite engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Service {
    Twitter,
    TikTok,
    Instagram,
    Reddit,
}

impl Service {
    pub const ALL: [Service; 4] = [
        Service::Twitter,
        Service::TikTok,
        Service::Instagram,
        Service::Reddit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Twitter => "Twitter",
            Service::TikTok => "TikTok",
            Service::Instagram => "Instagram",
            Service::Reddit => "Reddit",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = ServiceSetError;

    /// Case-insensitive; `x` is accepted as an alias for Twitter.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twitter" | "x" => Ok(Service::Twitter),
            "tiktok" => Ok(Service::TikTok),
            "instagram" => Ok(Service::Instagram),
            "reddit" => Ok(Service::Reddit),
            _ => Err(ServiceSetError::UnknownService(s.trim().to_string())),
        }
    }
}

/// Subset of [`Service::ALL`]. Ordering is canonical, so two sets with the
/// same members always compare and encode identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSet(BTreeSet<Service>);

#[derive(Serialize, Deserialize)]
struct EncodedServiceSet {
    version: u32,
    services: Vec<Service>,
}

impl Default for ServiceSet {
    fn default() -> Self {
        Self::all()
    }
}

impl ServiceSet {
    pub fn all() -> Self {
        Self(Service::ALL.into_iter().collect())
    }

    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, service: Service) -> bool {
        self.0.contains(&service)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Service> + '_ {
        self.0.iter().copied()
    }

    /// Parse user-supplied names, rejecting anything outside the enumeration.
    pub fn from_names<'a, I>(names: I) -> Result<Self, ServiceSetError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .map(str::parse)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Serialize to the versioned JSON form stored in the `settings` table.
    pub fn encode(&self) -> String {
        let encoded = EncodedServiceSet {
            version: ENCODING_VERSION,
            services: self.iter().collect(),
        };
        // A struct of a u32 and a Vec of unit variants always serializes.
        serde_json::to_string(&encoded).unwrap_or_default()
    }

    /// Parse a stored value. Accepts the versioned JSON form and the bare list
    /// literal written by older deployments (`['Twitter', 'Reddit']`).
    pub fn decode(raw: &str) -> Result<Self, ServiceSetError> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            let encoded: EncodedServiceSet = serde_json::from_str(trimmed)
                .map_err(|e| ServiceSetError::Malformed(e.to_string()))?;
            if encoded.version != ENCODING_VERSION {
                return Err(ServiceSetError::UnsupportedVersion(encoded.version));
            }
            return Ok(Self(encoded.services.into_iter().collect()));
        }
        decode_list_literal(trimmed)
    }
}

impl FromIterator<Service> for ServiceSet {
    fn from_iter<T: IntoIterator<Item = Service>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|s| s.as_str()).collect();
        f.write_str(&names.join(", "))
    }
}

/// Strict parser for `['A', "B"]`: every element must be a quoted, exact
/// service name. Nothing else is interpreted.
fn decode_list_literal(raw: &str) -> Result<ServiceSet, ServiceSetError> {
    let inner = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| ServiceSetError::Malformed(raw.to_string()))?;

    let mut services = BTreeSet::new();
    for item in inner.split(',').map(str::trim) {
        if item.is_empty() {
            continue;
        }
        let name = unquote(item).ok_or_else(|| ServiceSetError::Malformed(raw.to_string()))?;
        let service = Service::ALL
            .into_iter()
            .find(|s| s.as_str() == name)
            .ok_or_else(|| ServiceSetError::UnknownService(name.to_string()))?;
        services.insert(service);
    }
    Ok(ServiceSet(services))
}

fn unquote(item: &str) -> Option<&str> {
    ['\'', '"'].into_iter().find_map(|q| {
        item.strip_prefix(q)
            .and_then(|s| s.strip_suffix(q))
            .filter(|s| !s.contains(q))
    })
}
