use sea_orm::entity::prelude::*;

/// Marks an earned entry as offset by an expiry entry.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "loyalty_expirations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub earned_transaction_id: Uuid,
    pub expired_transaction_id: Uuid,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
