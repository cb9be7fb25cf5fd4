use sea_orm::entity::prelude::*;

use crate::error::Result;
use crate::error::StoreError;
use crate::profile::Profile;
use crate::types::ProfileField;
use crate::types::ProfileKey;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "profiles")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub profile_key:       String,
    pub balance:           i64,
    /// JSON array of item names.
    #[sea_orm(column_type = "Text")]
    pub unlocked_items:    String,
    pub selected_item:     String,
    /// JSON array of message names.
    #[sea_orm(column_type = "Text")]
    pub unlocked_messages: String,
    pub selected_message:  i64,
    pub kills:             i64,
    pub deaths:            i64,
    /// Unix timestamp of the last write, milliseconds.
    pub updated_at:        i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Column {
    pub fn of(field: ProfileField) -> Self {
        match field {
            ProfileField::Balance => Self::Balance,
            ProfileField::UnlockedItems => Self::UnlockedItems,
            ProfileField::SelectedItem => Self::SelectedItem,
            ProfileField::UnlockedMessages => Self::UnlockedMessages,
            ProfileField::SelectedMessage => Self::SelectedMessage,
            ProfileField::Kills => Self::Kills,
            ProfileField::Deaths => Self::Deaths,
        }
    }
}

fn decode_list(field: ProfileField, json: &str) -> Result<Vec<String>> {
    serde_json::from_str(json).map_err(|e| StoreError::Codec {
        field,
        message: e.to_string(),
    })
}

impl TryFrom<Model> for Profile {
    type Error = StoreError;

    fn try_from(row: Model) -> Result<Self> {
        Ok(Profile {
            key:               ProfileKey::from(row.profile_key),
            balance:           row.balance,
            unlocked_items:    decode_list(ProfileField::UnlockedItems, &row.unlocked_items)?,
            selected_item:     row.selected_item,
            unlocked_messages: decode_list(ProfileField::UnlockedMessages, &row.unlocked_messages)?,
            selected_message:  row.selected_message,
            kills:             row.kills,
            deaths:            row.deaths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_decodes_lists() {
        let row = Model {
            profile_key:       "p".into(),
            balance:           10,
            unlocked_items:    r#"["WOOL","GLASS"]"#.into(),
            selected_item:     "WOOL".into(),
            unlocked_messages: "[]".into(),
            selected_message:  2,
            kills:             1,
            deaths:            0,
            updated_at:        0,
        };
        let profile = Profile::try_from(row.clone()).unwrap();
        assert_eq!(profile.unlocked_items, vec!["WOOL".to_string(), "GLASS".to_string()]);

        let broken = Model {
            unlocked_messages: "not json".into(),
            ..row
        };
        assert!(matches!(
            Profile::try_from(broken),
            Err(StoreError::Codec {
                field: ProfileField::UnlockedMessages,
                ..
            })
        ));
    }
}
