pub mod cart;
pub mod loyalty;
pub mod orders;
pub mod promo;
