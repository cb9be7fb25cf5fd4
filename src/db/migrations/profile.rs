use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "profile_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Profiles::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Profiles::ProfileKey).string().not_null().primary_key())
                    .col(ColumnDef::new(Profiles::Balance).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Profiles::UnlockedItems).text().not_null().default("[]"))
                    .col(ColumnDef::new(Profiles::SelectedItem).string().not_null().default("AIR"))
                    .col(ColumnDef::new(Profiles::UnlockedMessages).text().not_null().default("[]"))
                    .col(ColumnDef::new(Profiles::SelectedMessage).big_integer().not_null().default(1))
                    .col(ColumnDef::new(Profiles::Kills).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Profiles::Deaths).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Profiles::UpdatedAt).big_integer().not_null().default(0))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Profiles::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Profiles {
    Table,
    ProfileKey,
    Balance,
    UnlockedItems,
    SelectedItem,
    UnlockedMessages,
    SelectedMessage,
    Kills,
    Deaths,
    UpdatedAt,
}
