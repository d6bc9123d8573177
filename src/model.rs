use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::bail;
use clap::ValueEnum;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::store::{Record, RecordId};

// store columns
pub const CODE: &str = "Code";
pub const NAME: &str = "Name";
pub const GEOMETRY: &str = "Geometry";
pub const COUNTRY_CODE: &str = "CountryCode";
pub const COUNTRY_ID: &str = "Country_id";
pub const TYPE: &str = "Type";
pub const MUNICIPALITIES: &str = "Municipalities";
pub const MUNICIPALITY_CODES: &str = "Municipality Codes";
pub const ACTOR_TABLE: &str = "Actor";
pub const ZONES: &str = "Zones";

pub const DISTRIBUTION_TYPE: &str = "Distribution";
pub const WATER_COMPANY_TYPE: &str = "Water Company";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
pub enum Level {
    Country,
    Municipality,
    DistributionZone,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Country" | "country" => Self::Country,
            "Municipality" | "municipality" => Self::Municipality,
            "DistributionZone" | "distribution-zone" => Self::DistributionZone,
            _ => bail!("Unknown level: {s}"),
        })
    }
}

impl Level {
    /// Table name in the record store, also the staging file prefix.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Country => "Country",
            Self::Municipality => "Municipality",
            Self::DistributionZone => "DistributionZone",
        }
    }

    pub fn parent(&self) -> Option<Level> {
        match self {
            Self::Country => None,
            Self::Municipality | Self::DistributionZone => Some(Self::Country),
        }
    }
}

/// GeoJSON geometry kept as text, the way the store and the staging files
/// carry it. Parsing is left to [`crate::geometry::parse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawGeometry(String);

impl RawGeometry {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Reads a store or staging cell. Null, missing and blank cells mean "no
    /// geometry yet".
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        let value = value?;
        match value {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(Self(s.clone())),
            Value::Object(_) => Some(Self(value.to_string())),
            _ => None,
        }
    }
}

impl Serialize for RawGeometry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RawGeometry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Self(s)),
            x @ Value::Object(_) => Ok(Self(x.to_string())),
            x => Err(de::Error::custom(format!(
                "expected a GeoJSON geometry, found {x}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeographicArea {
    pub id: Option<RecordId>,
    pub level: Level,
    pub code: String,
    pub name: String,
    pub geometry: Option<RawGeometry>,
    pub parent_code: Option<String>,
}

impl GeographicArea {
    /// `None` when the record has no code, which makes it unusable for
    /// matching.
    pub fn from_record(level: Level, record: &Record) -> Option<Self> {
        Some(Self {
            id: Some(record.id),
            level,
            code: record.text(CODE)?,
            name: record.text(NAME).unwrap_or_default(),
            geometry: RawGeometry::from_value(record.fields.get(GEOMETRY)),
            parent_code: record.text(COUNTRY_CODE),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DistributionZone {
    pub area: GeographicArea,
    /// Explicitly linked municipality codes, in link order.
    pub members: Vec<String>,
}

impl DistributionZone {
    pub fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            area: GeographicArea::from_record(Level::DistributionZone, record)?,
            members: record.list(MUNICIPALITY_CODES),
        })
    }

    pub fn code(&self) -> &str {
        &self.area.code
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub name: String,
    pub country: String,
    /// Remaining input columns, stored on the actor as-is.
    pub extra: BTreeMap<String, String>,
}
