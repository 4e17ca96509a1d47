use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        cart::{AddToCartRequest, ApplyPromoRequest, CartView, UpdateMode},
        loyalty::{AdjustPointsRequest, LoyaltySummary, TransactionList},
        orders::{
            CheckoutReceipt, CheckoutRequest, PaymentConfirmation, PaymentOutcome,
            UpdateOrderStatusRequest,
        },
        promo::{AppliedPromo, CreatePromoRequest, PromoValidation, ValidatePromoRequest},
    },
    models::{
        CartLine, DeliveryMethod, DiscountType, LoyaltyTransaction, Order, OrderLine,
        OrderStatus, PaymentMethod, PaymentStatus, PromoCode, TransactionType,
    },
    response::{ApiResponse, Meta},
    routes::{admin, cart, health::{self, HealthData}, loyalty, orders, params, payments, promo},
    services::{
        loyalty_service::ExpiryReport,
        promo_service::{Discount, PromoRejection},
    },
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        cart::get_cart,
        cart::add_to_cart,
        cart::remove_from_cart,
        cart::clear_cart,
        cart::apply_promo,
        cart::remove_promo,
        promo::validate_promo,
        loyalty::get_balance,
        loyalty::list_transactions,
        orders::checkout,
        orders::get_order,
        orders::start_payment,
        orders::update_order_status,
        payments::confirm_payment,
        admin::create_promo_code,
        admin::adjust_points,
        admin::expire_points
    ),
    components(
        schemas(
            CartLine,
            HealthData,
            CartView,
            UpdateMode,
            AddToCartRequest,
            ApplyPromoRequest,
            PromoCode,
            DiscountType,
            Discount,
            PromoRejection,
            PromoValidation,
            ValidatePromoRequest,
            CreatePromoRequest,
            AppliedPromo,
            LoyaltyTransaction,
            TransactionType,
            LoyaltySummary,
            TransactionList,
            AdjustPointsRequest,
            ExpiryReport,
            Order,
            OrderLine,
            OrderStatus,
            PaymentStatus,
            DeliveryMethod,
            PaymentMethod,
            CheckoutRequest,
            CheckoutReceipt,
            PaymentConfirmation,
            PaymentOutcome,
            UpdateOrderStatusRequest,
            params::Pagination,
            Meta,
            ApiResponse<CartView>,
            ApiResponse<Order>,
            ApiResponse<CheckoutReceipt>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Cart", description = "Session cart endpoints"),
        (name = "Promo Codes", description = "Promo code endpoints"),
        (name = "Loyalty", description = "Loyalty points endpoints"),
        (name = "Orders", description = "Checkout and order endpoints"),
        (name = "Payments", description = "Payment gateway callbacks"),
        (name = "Admin", description = "Admin endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
