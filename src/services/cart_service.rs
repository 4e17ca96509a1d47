use std::collections::BTreeMap;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    audit::audit_or_warn,
    dto::cart::{AddToCartRequest, UpdateMode},
    error::{AppError, AppResult},
    models::{Cart, CartLine, CatalogItem},
    state::AppState,
    store::StoreError,
};

pub const MAX_LINE_QUANTITY: u32 = 99;

impl Cart {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            lines: BTreeMap::new(),
            applied_promo_code_id: None,
            version: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn subtotal(&self) -> Decimal {
        self.lines.values().map(CartLine::line_subtotal).sum()
    }

    pub fn validate_version(&self, client_version: i64) -> bool {
        self.version == client_version
    }

    /// Adds or updates a line. `catalog` is only consulted when the item is
    /// new to the cart; `None` then means the catalog does not know it.
    /// Existing lines keep the price captured when they were first added.
    pub fn add(
        &mut self,
        item_id: Uuid,
        quantity: u32,
        mode: UpdateMode,
        catalog: Option<&CatalogItem>,
    ) -> AppResult<u32> {
        if quantity == 0 {
            return Err(AppError::Validation(
                "quantity must be greater than 0".to_string(),
            ));
        }

        let next = match self.lines.get(&item_id) {
            Some(line) => match mode {
                UpdateMode::Replace => quantity,
                UpdateMode::Increment => line.quantity.saturating_add(quantity),
            },
            None => quantity,
        };
        if next > MAX_LINE_QUANTITY {
            return Err(AppError::Validation(format!(
                "quantity must not exceed {MAX_LINE_QUANTITY}"
            )));
        }

        match self.lines.get_mut(&item_id) {
            Some(line) => line.quantity = next,
            None => {
                let item = match catalog {
                    Some(item) if item.is_orderable() => item,
                    Some(item) => {
                        return Err(AppError::ItemUnavailable {
                            items: vec![item.name.clone()],
                        });
                    }
                    None => {
                        return Err(AppError::ItemUnavailable {
                            items: vec![item_id.to_string()],
                        });
                    }
                };
                self.lines.insert(
                    item_id,
                    CartLine {
                        item_id,
                        name: item.name.clone(),
                        restaurant_id: item.restaurant_id,
                        quantity: next,
                        unit_price: item.unit_price,
                    },
                );
            }
        }

        self.version += 1;
        Ok(next)
    }

    pub fn remove(&mut self, item_id: Uuid) -> Option<CartLine> {
        let removed = self.lines.remove(&item_id);
        self.version += 1;
        removed
    }

    /// Removes several lines as a single mutation.
    pub fn drop_lines(&mut self, item_ids: &[Uuid]) {
        for item_id in item_ids {
            self.lines.remove(item_id);
        }
        self.version += 1;
    }

    /// Bumps the version without touching the lines, so that another
    /// request holding the same snapshot cannot check it out a second time.
    pub fn claim_for_checkout(&mut self) {
        self.version += 1;
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.applied_promo_code_id = None;
        self.version += 1;
    }

    pub fn attach_promo(&mut self, promo_code_id: Uuid) {
        self.applied_promo_code_id = Some(promo_code_id);
        self.version += 1;
    }

    pub fn detach_promo(&mut self) {
        self.applied_promo_code_id = None;
        self.version += 1;
    }

    /// Restaurants that own the cart's lines.
    pub fn restaurants(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.lines.values().map(|line| line.restaurant_id)
    }
}

pub async fn get_cart(state: &AppState, session_id: Uuid) -> AppResult<Cart> {
    Ok(state.carts.load(session_id).await?)
}

/// Loads the session's cart and rejects the request when the client's
/// version is stale.
pub async fn load_for_update(
    state: &AppState,
    session_id: Uuid,
    client_version: i64,
    affected: &[String],
) -> AppResult<Cart> {
    let cart = state.carts.load(session_id).await?;
    if !cart.validate_version(client_version) {
        tracing::info!(
            session_id = %session_id,
            client_version,
            current_version = cart.version,
            "stale cart mutation rejected"
        );
        return Err(AppError::StaleCart {
            current_version: cart.version,
            items: affected.to_vec(),
        });
    }
    Ok(cart)
}

/// Compare-and-swap save against the version the mutation started from.
pub async fn store_cart(
    state: &AppState,
    cart: &Cart,
    expected_version: i64,
    affected: &[String],
) -> AppResult<()> {
    match state.carts.save(cart, expected_version).await {
        Ok(()) => Ok(()),
        Err(StoreError::VersionConflict { current }) => Err(AppError::StaleCart {
            current_version: current,
            items: affected.to_vec(),
        }),
        Err(err) => Err(err.into()),
    }
}

pub async fn add_item(
    state: &AppState,
    session_id: Uuid,
    user_id: Option<Uuid>,
    payload: AddToCartRequest,
) -> AppResult<Cart> {
    let quantity = u32::try_from(payload.quantity)
        .ok()
        .filter(|q| *q > 0)
        .ok_or_else(|| AppError::Validation("quantity must be greater than 0".to_string()))?;

    let affected = vec![payload.item_id.to_string()];
    let mut cart = load_for_update(state, session_id, payload.version, &affected).await?;
    let expected = cart.version;

    let catalog = if cart.lines.contains_key(&payload.item_id) {
        None
    } else {
        state.catalog.lookup(payload.item_id).await?
    };

    let quantity = cart.add(payload.item_id, quantity, payload.mode, catalog.as_ref())?;
    store_cart(state, &cart, expected, &affected).await?;

    tracing::debug!(
        session_id = %session_id,
        item_id = %payload.item_id,
        quantity,
        version = cart.version,
        "cart line updated"
    );
    audit_or_warn(
        state,
        user_id,
        "cart_update",
        "carts",
        serde_json::json!({ "item_id": payload.item_id, "quantity": quantity }),
    )
    .await;

    Ok(cart)
}

pub async fn remove_item(
    state: &AppState,
    session_id: Uuid,
    user_id: Option<Uuid>,
    item_id: Uuid,
    client_version: i64,
) -> AppResult<Cart> {
    let affected = vec![item_id.to_string()];
    let mut cart = load_for_update(state, session_id, client_version, &affected).await?;
    let expected = cart.version;

    let removed = cart.remove(item_id);
    store_cart(state, &cart, expected, &affected).await?;

    if removed.is_some() {
        audit_or_warn(
            state,
            user_id,
            "cart_remove",
            "carts",
            serde_json::json!({ "item_id": item_id }),
        )
        .await;
    }

    Ok(cart)
}

pub async fn clear_cart(
    state: &AppState,
    session_id: Uuid,
    client_version: i64,
) -> AppResult<Cart> {
    let mut cart = load_for_update(state, session_id, client_version, &[]).await?;
    let expected = cart.version;
    cart.clear();
    store_cart(state, &cart, expected, &[]).await?;
    Ok(cart)
}
