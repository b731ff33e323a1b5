//! Message version resolution and conversion.
//!
//! This module contains:
//! - `Version`: major.minor.patch with major-compatibility semantics
//! - `VersionRegistry`: declared/self-reported version metadata per type,
//!   built from explicit registrations at configuration time
//! - `ConverterRegistry`: converter graph with shortest-path discovery
//! - Target-version validation (property-level errors/warnings)

mod converter;

pub use converter::{
    ConversionPath, ConversionStep, ConvertFn, ConvertPayload, ConverterRegistry,
};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::message::Message;

/// Result type for versioning operations.
pub type Result<T> = std::result::Result<T, VersionError>;

/// Errors raised by version resolution and conversion.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("Invalid version string '{0}'")]
    Parse(String),

    #[error("No conversion path for '{message_type}' from {from} to {to}")]
    NoPath {
        message_type: String,
        from: Version,
        to: Version,
    },

    #[error("Converter failed at step {from} -> {to}: {message}")]
    ConversionFailed {
        from: Version,
        to: Version,
        message: String,
    },

    #[error("Payload type mismatch during conversion")]
    PayloadType,
}

/// Semantic message version. Two versions are compatible iff they share
/// the same major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Default version for types with no declared metadata.
    pub const fn initial() -> Self {
        Self::new(1, 0, 0)
    }

    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| VersionError::Parse(s.to_string()))?
                .parse()
                .map_err(|_| VersionError::Parse(s.to_string()))
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(VersionError::Parse(s.to_string()));
        }
        Ok(version)
    }
}

/// Deprecation record attached to a property.
#[derive(Debug, Clone)]
pub struct Deprecation {
    pub version: Version,
    pub reason: String,
    pub replaced_by: Option<String>,
}

/// Probe deciding whether a property carries a non-default value.
pub type PropertyProbe = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Version metadata for one property of a message type.
#[derive(Clone)]
pub struct PropertyVersioning {
    pub name: String,
    pub added_in: Option<Version>,
    pub deprecated: Option<Deprecation>,
    /// Returns true when the property is set to a non-default value.
    pub is_set: PropertyProbe,
}

impl PropertyVersioning {
    pub fn new(name: impl Into<String>, is_set: PropertyProbe) -> Self {
        Self {
            name: name.into(),
            added_in: None,
            deprecated: None,
            is_set,
        }
    }

    pub fn added_in(mut self, version: Version) -> Self {
        self.added_in = Some(version);
        self
    }

    pub fn deprecated_in(
        mut self,
        version: Version,
        reason: impl Into<String>,
        replaced_by: Option<String>,
    ) -> Self {
        self.deprecated = Some(Deprecation {
            version,
            reason: reason.into(),
            replaced_by,
        });
        self
    }
}

/// Self-reported version closure for types that declare their version
/// per instance rather than per type.
pub type SelfReportedVersion = Arc<dyn Fn() -> Version + Send + Sync>;

#[derive(Default)]
struct TypeVersionInfo {
    declared: Option<Version>,
    self_reported: Option<SelfReportedVersion>,
    properties: Vec<PropertyVersioning>,
}

/// Severity of a version validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingSeverity {
    /// Property set but introduced after the target version.
    Error,
    /// Deprecated property in use.
    Warning,
}

/// One finding from target-version validation.
#[derive(Debug, Clone)]
pub struct VersionFinding {
    pub severity: FindingSeverity,
    pub property: String,
    pub message: String,
}

/// Report from validating a message against a target version.
#[derive(Debug, Clone, Default)]
pub struct VersionValidationReport {
    pub findings: Vec<VersionFinding>,
}

impl VersionValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &VersionFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &VersionFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Warning)
    }

    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Registration table of version metadata, keyed by type token.
///
/// Replaces attribute scanning: declarations are made explicitly at
/// configuration time and resolution results are cached per type.
#[derive(Default)]
pub struct VersionRegistry {
    types: RwLock<HashMap<TypeId, TypeVersionInfo>>,
    cache: RwLock<HashMap<TypeId, Version>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a fixed version for a message type.
    pub fn declare<M: Message>(&self, version: Version) -> &Self {
        self.entry::<M>(|info| info.declared = Some(version));
        self
    }

    /// Register a self-reported version closure for a message type.
    /// Consulted only when no declared version exists.
    pub fn declare_self_reported<M: Message>(&self, report: SelfReportedVersion) -> &Self {
        self.entry::<M>(|info| info.self_reported = Some(report));
        self
    }

    /// Attach property version metadata to a message type. The probe
    /// receives the message as `&dyn Any` and downcasts internally.
    pub fn declare_property<M: Message>(&self, property: PropertyVersioning) -> &Self {
        self.entry::<M>(|info| info.properties.push(property));
        self
    }

    /// Resolve the version for a message type.
    ///
    /// Resolution order: declared annotation, then self-reported
    /// closure, then `1.0.0`. Results are cached per type.
    pub fn resolve<M: Message>(&self) -> Version {
        let type_id = TypeId::of::<M>();
        if let Some(version) = self.cache.read().expect("version cache poisoned").get(&type_id) {
            return *version;
        }

        let resolved = {
            let types = self.types.read().expect("version table poisoned");
            match types.get(&type_id) {
                Some(info) => info
                    .declared
                    .or_else(|| info.self_reported.as_ref().map(|f| f()))
                    .unwrap_or(Version::initial()),
                None => Version::initial(),
            }
        };
        self.cache
            .write()
            .expect("version cache poisoned")
            .insert(type_id, resolved);
        resolved
    }

    /// Validate a message's set properties against a target version.
    ///
    /// Non-default properties introduced after the target are errors;
    /// deprecated properties in use are warnings.
    pub fn validate_for_target<M: Message>(
        &self,
        message: &M,
        target: Version,
    ) -> VersionValidationReport {
        let type_id = TypeId::of::<M>();
        let types = self.types.read().expect("version table poisoned");
        let mut report = VersionValidationReport::default();

        let Some(info) = types.get(&type_id) else {
            return report;
        };

        for property in &info.properties {
            if !(property.is_set)(message.as_any()) {
                continue;
            }
            if let Some(added_in) = property.added_in {
                if added_in > target {
                    report.findings.push(VersionFinding {
                        severity: FindingSeverity::Error,
                        property: property.name.clone(),
                        message: format!(
                            "'{}' was added in {} but the target version is {}",
                            property.name, added_in, target
                        ),
                    });
                    continue;
                }
            }
            if let Some(deprecation) = &property.deprecated {
                if deprecation.version <= target {
                    let replacement = deprecation
                        .replaced_by
                        .as_deref()
                        .map(|r| format!("; use '{}'", r))
                        .unwrap_or_default();
                    report.findings.push(VersionFinding {
                        severity: FindingSeverity::Warning,
                        property: property.name.clone(),
                        message: format!(
                            "'{}' is deprecated since {}: {}{}",
                            property.name, deprecation.version, deprecation.reason, replacement
                        ),
                    });
                }
            }
        }
        report
    }

    fn entry<M: Message>(&self, apply: impl FnOnce(&mut TypeVersionInfo)) {
        let mut types = self.types.write().expect("version table poisoned");
        let info = types.entry(TypeId::of::<M>()).or_default();
        apply(info);
        // Any declaration invalidates the resolution cache for the type.
        self.cache
            .write()
            .expect("version cache poisoned")
            .remove(&TypeId::of::<M>());
    }
}
