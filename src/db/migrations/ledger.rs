use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "ledger_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Ledger::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Ledger::Id).integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(Ledger::ProfileKey).string().not_null())
                    .col(ColumnDef::new(Ledger::Kind).string().not_null())
                    .col(ColumnDef::new(Ledger::Amount).double().not_null())
                    .col(ColumnDef::new(Ledger::RecordedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-ledger-profile-kind")
                    .table(Ledger::Table)
                    .col(Ledger::ProfileKey)
                    .col(Ledger::Kind)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Ledger::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Ledger {
    Table,
    Id,
    ProfileKey,
    Kind,
    Amount,
    RecordedAt,
}
