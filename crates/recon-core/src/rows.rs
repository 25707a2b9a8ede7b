use crate::ContractError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Creative dimension of an output row.
///
/// `Ambiguous` is the NULL creative produced by within-partition conflicts. Unlike SQL
/// NULL it is a single equality class: two ambiguous keys for the same date and
/// partition identify the same logical row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Option<String>", into = "Option<String>")]
pub enum CreativeKey {
    Ambiguous,
    Creative(String),
}

impl CreativeKey {
    pub fn creative(id: impl Into<String>) -> Result<Self, ContractError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractError::EmptyCreativeKey);
        }
        Ok(Self::Creative(id))
    }

    pub fn from_column(value: Option<String>) -> Result<Self, ContractError> {
        match value {
            None => Ok(Self::Ambiguous),
            Some(id) => Self::creative(id),
        }
    }

    pub fn as_column(&self) -> Option<&str> {
        match self {
            CreativeKey::Ambiguous => None,
            CreativeKey::Creative(id) => Some(id.as_str()),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, CreativeKey::Ambiguous)
    }
}

impl TryFrom<Option<String>> for CreativeKey {
    type Error = ContractError;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        Self::from_column(value)
    }
}

impl From<CreativeKey> for Option<String> {
    fn from(value: CreativeKey) -> Self {
        match value {
            CreativeKey::Ambiguous => None,
            CreativeKey::Creative(id) => Some(id),
        }
    }
}

impl fmt::Display for CreativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreativeKey::Ambiguous => f.write_str("<ambiguous>"),
            CreativeKey::Creative(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct OutputKey {
    pub partition_key: String,
    pub date: NaiveDate,
    pub creative_key: CreativeKey,
}

impl OutputKey {
    pub fn new(partition_key: impl Into<String>, date: NaiveDate, creative_key: CreativeKey) -> Self {
        Self {
            partition_key: partition_key.into(),
            date,
            creative_key,
        }
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.partition_key, self.date, self.creative_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub import_batch_id: String,
    pub provider: String,
    pub time_zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFact {
    pub fact_id: i64,
    pub import_batch_id: String,
    pub vendor_placement_id: String,
    pub date: NaiveDate,
    pub impressions: i64,
    pub clicks: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorMapping {
    pub mapping_id: i64,
    pub vendor_placement_id: String,
    pub partition_key: String,
    pub creative_key: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub is_deleted: bool,
}

impl VendorMapping {
    pub fn covers(&self, date: NaiveDate) -> bool {
        !self.is_deleted && self.date_start <= date && date <= self.date_end
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    WithinPartition,
    CrossPartition,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::WithinPartition => "within_partition",
            ConflictKind::CrossPartition => "cross_partition",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "within_partition" => Ok(ConflictKind::WithinPartition),
            "cross_partition" => Ok(ConflictKind::CrossPartition),
            other => Err(ContractError::UnknownConflictKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentConflict {
    pub conflict_id: i64,
    pub partition_key: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub kind: ConflictKind,
}

impl AlignmentConflict {
    pub fn covers(&self, partition_key: &str, date: NaiveDate) -> bool {
        self.partition_key == partition_key && self.date_start <= date && date <= self.date_end
    }
}

pub fn validate_date_range(start: NaiveDate, end: NaiveDate) -> Result<(), ContractError> {
    if start > end {
        return Err(ContractError::InvalidDateRange { start, end });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedRow {
    pub date: NaiveDate,
    pub partition_key: String,
    pub creative_key: CreativeKey,
    pub impressions: i64,
    pub clicks: i64,
    pub provider: String,
    pub time_zone: String,
}

impl ExpectedRow {
    pub fn key(&self) -> OutputKey {
        OutputKey::new(self.partition_key.clone(), self.date, self.creative_key.clone())
    }

    pub fn into_output(self, updated_at: DateTime<Utc>) -> OutputRow {
        OutputRow {
            date: self.date,
            partition_key: self.partition_key,
            creative_key: self.creative_key,
            impressions: self.impressions,
            clicks: self.clicks,
            provider: self.provider,
            time_zone: self.time_zone,
            updated_at,
            is_deleted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRow {
    pub date: NaiveDate,
    pub partition_key: String,
    pub creative_key: CreativeKey,
    pub impressions: i64,
    pub clicks: i64,
    pub provider: String,
    pub time_zone: String,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl OutputRow {
    pub fn key(&self) -> OutputKey {
        OutputKey::new(self.partition_key.clone(), self.date, self.creative_key.clone())
    }

    // Live row already carrying the expected aggregate; replacing it would only bump updated_at.
    pub fn matches_expected(&self, expected: &ExpectedRow) -> bool {
        !self.is_deleted
            && self.date == expected.date
            && self.partition_key == expected.partition_key
            && self.creative_key == expected.creative_key
            && self.impressions == expected.impressions
            && self.clicks == expected.clicks
            && self.provider == expected.provider
            && self.time_zone == expected.time_zone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 5, d).expect("valid date")
    }

    #[test]
    fn ambiguous_creatives_share_one_equality_class() {
        let a = OutputKey::new("P1", day(1), CreativeKey::Ambiguous);
        let b = OutputKey::new("P1", day(1), CreativeKey::from_column(None).expect("null"));
        assert_eq!(a, b);
        assert_ne!(
            a,
            OutputKey::new("P1", day(1), CreativeKey::creative("c-1").expect("creative"))
        );
    }

    #[test]
    fn empty_creative_ids_are_rejected() {
        assert!(matches!(
            CreativeKey::creative("  "),
            Err(ContractError::EmptyCreativeKey)
        ));
        assert!(CreativeKey::from_column(Some(String::new())).is_err());
    }

    #[test]
    fn creative_key_serializes_as_nullable_string() {
        let json = serde_json::to_string(&CreativeKey::Ambiguous).expect("serialize");
        assert_eq!(json, "null");
        let parsed: CreativeKey = serde_json::from_str("\"c-9\"").expect("parse");
        assert_eq!(parsed.as_column(), Some("c-9"));
    }

    #[test]
    fn output_keys_order_by_partition_then_date_then_creative() {
        let mut keys = vec![
            OutputKey::new("P2", day(1), CreativeKey::Ambiguous),
            OutputKey::new("P1", day(2), CreativeKey::creative("b").expect("creative")),
            OutputKey::new("P1", day(2), CreativeKey::Ambiguous),
            OutputKey::new("P1", day(1), CreativeKey::creative("a").expect("creative")),
        ];
        keys.sort();
        let rendered = keys.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            rendered,
            vec![
                "P1/2018-05-01/a",
                "P1/2018-05-02/<ambiguous>",
                "P1/2018-05-02/b",
                "P2/2018-05-01/<ambiguous>",
            ]
        );
    }

    #[test]
    fn mapping_and_conflict_ranges_are_inclusive() {
        let mapping = VendorMapping {
            mapping_id: 1,
            vendor_placement_id: "v-1".to_string(),
            partition_key: "P1".to_string(),
            creative_key: "c-1".to_string(),
            date_start: day(1),
            date_end: day(3),
            is_deleted: false,
        };
        assert!(mapping.covers(day(1)));
        assert!(mapping.covers(day(3)));
        assert!(!mapping.covers(day(4)));
        assert!(!VendorMapping {
            is_deleted: true,
            ..mapping
        }
        .covers(day(2)));

        let conflict = AlignmentConflict {
            conflict_id: 1,
            partition_key: "P1".to_string(),
            date_start: day(2),
            date_end: day(2),
            kind: ConflictKind::CrossPartition,
        };
        assert!(conflict.covers("P1", day(2)));
        assert!(!conflict.covers("P2", day(2)));
        assert!(!conflict.covers("P1", day(1)));
    }

    #[test]
    fn matches_expected_requires_live_row_with_same_values() {
        let expected = ExpectedRow {
            date: day(1),
            partition_key: "P1".to_string(),
            creative_key: CreativeKey::Ambiguous,
            impressions: 100,
            clicks: 1,
            provider: "dcm".to_string(),
            time_zone: "America/New_York".to_string(),
        };
        let now = Utc.with_ymd_and_hms(2018, 5, 3, 0, 0, 0).single().expect("ts");
        let row = expected.clone().into_output(now);
        assert!(row.matches_expected(&expected));
        assert!(!OutputRow {
            is_deleted: true,
            ..row.clone()
        }
        .matches_expected(&expected));
        assert!(!OutputRow {
            clicks: 2,
            ..row
        }
        .matches_expected(&expected));
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        assert!(validate_date_range(day(1), day(1)).is_ok());
        assert!(matches!(
            validate_date_range(day(3), day(1)),
            Err(ContractError::InvalidDateRange { .. })
        ));
    }
}
