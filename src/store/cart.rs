use serde::{Deserialize, Serialize};

use crate::store::{PersistedDomain, StateStore};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl LineItem {
    pub fn new(product_id: impl Into<String>, name: impl Into<String>, price: f64, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            name: name.into(),
            price,
            quantity,
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    fn matches(&self, product_id: &str, variant: Option<&str>) -> bool {
        self.product_id == product_id && self.variant.as_deref() == variant
    }

    pub fn subtotal(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

/// Cart contents. `total` and `item_count` are derived from `items` and recomputed on every change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartState {
    pub items: Vec<LineItem>,
    pub total: f64,
    pub item_count: u32,
}

impl CartState {
    pub fn computed_total(&self) -> f64 {
        self.items.iter().map(LineItem::subtotal).sum()
    }

    pub fn computed_item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }
}

impl PersistedDomain for CartState {
    const STORE_ID: &'static str = "cart";

    fn normalize(&mut self) {
        self.items.retain(|item| item.quantity > 0);
        self.total = self.computed_total();
        self.item_count = self.computed_item_count();
    }
}

pub type CartStore = StateStore<CartState>;

impl StateStore<CartState> {
    /// Adds `item`, merging quantities with an existing line for the same product and variant. The
    /// incoming price wins.
    pub fn add_item(&self, item: LineItem) -> CartState {
        self.update(|cart| {
            let existing = cart
                .items
                .iter_mut()
                .find(|line| line.matches(&item.product_id, item.variant.as_deref()));
            match existing {
                Some(line) => {
                    line.quantity = line.quantity.saturating_add(item.quantity);
                    line.price = item.price;
                }
                None => cart.items.push(item),
            }
        })
    }

    pub fn remove_item(&self, product_id: &str, variant: Option<&str>) -> CartState {
        self.update(|cart| cart.items.retain(|line| !line.matches(product_id, variant)))
    }

    /// Sets a line's quantity; zero removes the line.
    pub fn update_quantity(&self, product_id: &str, variant: Option<&str>, quantity: u32) -> CartState {
        self.update(|cart| {
            if let Some(line) = cart
                .items
                .iter_mut()
                .find(|line| line.matches(product_id, variant))
            {
                line.quantity = quantity;
            }
        })
    }

    pub fn clear(&self) -> CartState {
        self.reset()
    }
}
