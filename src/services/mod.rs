pub mod cart_service;
pub mod checkout_service;
pub mod loyalty_service;
pub mod promo_service;
