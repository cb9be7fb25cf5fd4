use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::StoreError;
use crate::types::FieldSet;
use crate::types::FieldValue;
use crate::types::ProfileField;
use crate::types::ProfileKey;

pub const DEFAULT_SELECTED_ITEM: &str = "AIR";
pub const DEFAULT_SELECTED_MESSAGE: i64 = 1;

/// In-memory copy of one account's persisted attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub key:               ProfileKey,
    pub balance:           i64,
    pub unlocked_items:    Vec<String>,
    pub selected_item:     String,
    pub unlocked_messages: Vec<String>,
    pub selected_message:  i64,
    pub kills:             i64,
    pub deaths:            i64,
}

impl Profile {
    /// Profile of an account that has never been stored.
    pub fn new_default(key: ProfileKey) -> Self {
        Self {
            key,
            balance: 0,
            unlocked_items: Vec::new(),
            selected_item: DEFAULT_SELECTED_ITEM.to_string(),
            unlocked_messages: Vec::new(),
            selected_message: DEFAULT_SELECTED_MESSAGE,
            kills: 0,
            deaths: 0,
        }
    }

    pub fn field(&self, field: ProfileField) -> FieldValue {
        match field {
            ProfileField::Balance => FieldValue::Integer(self.balance),
            ProfileField::UnlockedItems => FieldValue::List(self.unlocked_items.clone()),
            ProfileField::SelectedItem => FieldValue::Text(self.selected_item.clone()),
            ProfileField::UnlockedMessages => FieldValue::List(self.unlocked_messages.clone()),
            ProfileField::SelectedMessage => FieldValue::Integer(self.selected_message),
            ProfileField::Kills => FieldValue::Integer(self.kills),
            ProfileField::Deaths => FieldValue::Integer(self.deaths),
        }
    }

    /// Set one field. The value must match the field's type; the profile is left untouched otherwise.
    pub fn apply(&mut self, field: ProfileField, value: &FieldValue) -> Result<()> {
        match field {
            ProfileField::Balance => self.balance = integer(field, value)?,
            ProfileField::SelectedMessage => self.selected_message = integer(field, value)?,
            ProfileField::Kills => self.kills = integer(field, value)?,
            ProfileField::Deaths => self.deaths = integer(field, value)?,
            ProfileField::SelectedItem => {
                self.selected_item = value
                    .as_text()
                    .ok_or(StoreError::FieldType {
                        field,
                        expected: "a text",
                    })?
                    .to_string()
            }
            ProfileField::UnlockedItems => self.unlocked_items = list(field, value)?,
            ProfileField::UnlockedMessages => self.unlocked_messages = list(field, value)?,
        }
        Ok(())
    }

    pub fn apply_all(&mut self, fields: &FieldSet) -> Result<()> {
        for (field, value) in fields {
            self.apply(*field, value)?;
        }
        Ok(())
    }
}

fn integer(field: ProfileField, value: &FieldValue) -> Result<i64> {
    value.as_integer().ok_or(StoreError::FieldType {
        field,
        expected: "an integer",
    })
}

fn list(field: ProfileField, value: &FieldValue) -> Result<Vec<String>> {
    value.as_list().map(<[String]>::to_vec).ok_or(StoreError::FieldType {
        field,
        expected: "a list",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_checks_types() {
        let mut profile = Profile::new_default("p1".into());
        profile.apply(ProfileField::Balance, &150.into()).unwrap();
        assert_eq!(profile.balance, 150);

        let err = profile.apply(ProfileField::Balance, &"lots".into()).unwrap_err();
        assert!(matches!(err, StoreError::FieldType { field: ProfileField::Balance, .. }));
        assert_eq!(profile.balance, 150);

        profile
            .apply(ProfileField::UnlockedItems, &vec!["WOOL".to_string()].into())
            .unwrap();
        assert_eq!(profile.field(ProfileField::UnlockedItems), FieldValue::List(vec!["WOOL".into()]));
    }

    #[test]
    fn defaults() {
        let profile = Profile::new_default("p2".into());
        assert_eq!(profile.selected_item, "AIR");
        assert_eq!(profile.selected_message, 1);
        assert!(profile.unlocked_items.is_empty());
    }
}
