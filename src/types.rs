use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use strum::AsRefStr;
use strum::EnumIter;
use strum::EnumString;

/// Stable, opaque identifier of one account's profile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileKey(Arc<str>);

impl ProfileKey {
    pub fn new<S: AsRef<str>>(key: S) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ProfileKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// The fixed schema of a profile. Field names double as storage column names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProfileField {
    Balance,
    UnlockedItems,
    SelectedItem,
    UnlockedMessages,
    SelectedMessage,
    Kills,
    Deaths,
}

impl ProfileField {
    /// Stat counters have cached snapshots in the aggregate cache.
    pub fn stat_aggregate(&self) -> Option<AggregateKind> {
        match self {
            Self::Kills => Some(AggregateKind::Kills),
            Self::Deaths => Some(AggregateKind::Deaths),
            _ => None,
        }
    }
}

/// A single field value. List values are persisted as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// Buffered fields of one profile, last write wins per field.
pub type FieldSet = BTreeMap<ProfileField, FieldValue>;

/// Discrete economic event kinds recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LedgerKind {
    Earn,
    Spend,
}

/// One row of the append-only ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key:         ProfileKey,
    pub kind:        LedgerKind,
    pub amount:      f64,
    /// Unix timestamp, milliseconds.
    pub recorded_at: i64,
}

impl LedgerEntry {
    pub fn now(key: ProfileKey, kind: LedgerKind, amount: f64) -> Self {
        Self {
            key,
            kind,
            amount,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Derived statistics answered through the aggregate cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AggregateKind {
    /// Lifetime earnings, summed over `earn` ledger rows.
    Earnings,
    /// Lifetime spend, summed over `spend` ledger rows.
    Spending,
    Kills,
    Deaths,
}

impl AggregateKind {
    pub fn ledger_kind(&self) -> Option<LedgerKind> {
        match self {
            Self::Earnings => Some(LedgerKind::Earn),
            Self::Spending => Some(LedgerKind::Spend),
            Self::Kills | Self::Deaths => None,
        }
    }

    pub fn stat_field(&self) -> Option<ProfileField> {
        match self {
            Self::Kills => Some(ProfileField::Kills),
            Self::Deaths => Some(ProfileField::Deaths),
            Self::Earnings | Self::Spending => None,
        }
    }
}

impl From<LedgerKind> for AggregateKind {
    fn from(kind: LedgerKind) -> Self {
        match kind {
            LedgerKind::Earn => Self::Earnings,
            LedgerKind::Spend => Self::Spending,
        }
    }
}

pub type AggregateKey = (ProfileKey, AggregateKind);

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn field_names_are_column_names() {
        assert_eq!(ProfileField::UnlockedItems.to_string(), "unlocked_items");
        assert_eq!(ProfileField::from_str("selected_message").unwrap(), ProfileField::SelectedMessage);
        assert_eq!(LedgerKind::Spend.as_ref(), "spend");
    }

    #[test]
    fn profile_key_is_a_plain_json_string() {
        let key = ProfileKey::from("5f0c1e0a");
        assert_eq!(serde_json::to_string(&key).unwrap(), r#""5f0c1e0a""#);
        let back: ProfileKey = serde_json::from_str(r#""5f0c1e0a""#).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn field_value_json_shape() {
        let v: FieldValue = serde_json::from_str(r#"["WOOL","GLASS"]"#).unwrap();
        assert_eq!(v, FieldValue::List(vec!["WOOL".into(), "GLASS".into()]));
        let v: FieldValue = serde_json::from_str("150").unwrap();
        assert_eq!(v.as_integer(), Some(150));
    }
}
