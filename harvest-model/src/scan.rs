use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error::ParseError;

pub const SCAN_TYPE_TAG: &str = "scan_type";
pub const PARTIAL_TAG: &str = "partial";
pub const HISTORICAL_TAG: &str = "historical";

/// Direction of a scan window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanType {
    /// Incremental window chasing the present.
    Forward,
    /// Bounded window sweeping history toward the present.
    Backward,
    /// Complete-coverage pass.
    Full,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Forward => "forward",
            ScanType::Backward => "backward",
            ScanType::Full => "full",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(ScanType::Forward),
            "backward" => Ok(ScanType::Backward),
            "full" => Ok(ScanType::Full),
            _ => Err(ParseError::new("scan type", raw)),
        }
    }
}

impl FromStr for ScanType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scan classification attached to every job a trigger produces.
///
/// Partial results are never authoritative snapshots of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanTags {
    pub scan_type: ScanType,
    pub partial: bool,
    /// Set for windows produced by an on-demand historical backfill.
    #[cfg_attr(feature = "serde", serde(default))]
    pub historical: bool,
}

impl ScanTags {
    pub fn full() -> Self {
        Self {
            scan_type: ScanType::Full,
            partial: false,
            historical: false,
        }
    }

    pub fn forward() -> Self {
        Self {
            scan_type: ScanType::Forward,
            partial: true,
            historical: false,
        }
    }

    pub fn backward() -> Self {
        Self {
            scan_type: ScanType::Backward,
            partial: true,
            historical: false,
        }
    }

    pub fn historical() -> Self {
        Self {
            historical: true,
            ..Self::backward()
        }
    }

    pub fn to_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(SCAN_TYPE_TAG.to_string(), self.scan_type.to_string());
        tags.insert(PARTIAL_TAG.to_string(), self.partial.to_string());
        if self.historical {
            tags.insert(HISTORICAL_TAG.to_string(), "true".to_string());
        }
        tags
    }

    /// Reads scan tags back out of a job's tag map. Missing `partial` is
    /// treated as partial.
    pub fn from_tags(tags: &BTreeMap<String, String>) -> Result<Self, ParseError> {
        let raw = tags
            .get(SCAN_TYPE_TAG)
            .ok_or_else(|| ParseError::new("scan type", ""))?;
        let scan_type = ScanType::parse(raw)?;
        let partial = tags
            .get(PARTIAL_TAG)
            .map(|value| !value.eq_ignore_ascii_case("false"))
            .unwrap_or(true);
        let historical = tags
            .get(HISTORICAL_TAG)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));
        Ok(Self {
            scan_type,
            partial,
            historical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_survive_the_job_tag_map() {
        let tags = ScanTags::historical();
        let parsed = ScanTags::from_tags(&tags.to_tags()).unwrap();
        assert_eq!(parsed, tags);
        assert!(parsed.partial);
        assert_eq!(parsed.scan_type, ScanType::Backward);
    }

    #[test]
    fn scan_type_rejects_unknown_direction() {
        assert!(ScanType::parse("sideways").is_err());
        assert_eq!(ScanType::parse("FULL").unwrap(), ScanType::Full);
    }
}
