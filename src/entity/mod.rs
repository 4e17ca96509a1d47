pub mod audit_logs;
pub mod cart_lines;
pub mod carts;
pub mod loyalty_expirations;
pub mod loyalty_transactions;
pub mod menu_items;
pub mod order_items;
pub mod orders;
pub mod promo_code_usages;
pub mod promo_codes;
pub mod restaurants;
pub mod users;

pub use audit_logs::Entity as AuditLogs;
pub use cart_lines::Entity as CartLines;
pub use carts::Entity as Carts;
pub use loyalty_expirations::Entity as LoyaltyExpirations;
pub use loyalty_transactions::Entity as LoyaltyTransactions;
pub use menu_items::Entity as MenuItems;
pub use order_items::Entity as OrderItems;
pub use orders::Entity as Orders;
pub use promo_code_usages::Entity as PromoCodeUsages;
pub use promo_codes::Entity as PromoCodes;
pub use restaurants::Entity as Restaurants;
pub use users::Entity as Users;
