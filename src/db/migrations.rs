pub mod ledger;
pub mod profile;

use sea_orm_migration::prelude::*;

pub struct Migrator;

impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(profile::Migration), Box::new(ledger::Migration)]
    }
}
