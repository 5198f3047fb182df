//! ERP integration shapes, the [`ErpClient`] trait, and text formatting of
//! ERP records for ingestion.
//!
//! The HTTP client lives in the app crate. Everything here is plain data
//! plus pure formatting so adapters and tests share one rendering.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ContentItem, Metadata, OrganizationId, SourceType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpProduct {
    pub id: String,
    pub code: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub unit: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub stock: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpCustomer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tax_number: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpOrderItem {
    pub product_code: Option<String>,
    pub name: String,
    pub quantity: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpOrder {
    pub id: String,
    pub number: String,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub items: Vec<ErpOrderItem>,
    pub total: f64,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub order_date: Option<DateTime<Utc>>,
    pub delivery_address: Option<String>,
}

/// Consolidated snapshot returned by the ERP "AI context" endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpContext {
    pub products: Vec<ErpProduct>,
    pub customers: Vec<ErpCustomer>,
    pub orders: Vec<ErpOrder>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShippingStatus {
    pub order_id: String,
    pub status: String,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub estimated_delivery: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErpRecordKind {
    Product,
    Customer,
    Order,
}

impl ErpRecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Customer => "customer",
            Self::Order => "order",
        }
    }
}

impl fmt::Display for ErpRecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErpRecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(Self::Product),
            "customer" => Ok(Self::Customer),
            "order" => Ok(Self::Order),
            _ => Err(format!("unknown ERP record kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum ErpRecord {
    Product(ErpProduct),
    Customer(ErpCustomer),
    Order(ErpOrder),
}

/// External ERP integration, scoped per organization.
#[async_trait]
pub trait ErpClient: Send + Sync {
    async fn get_ai_context(&self, org: &OrganizationId) -> Result<ErpContext>;

    async fn get_record(
        &self,
        org: &OrganizationId,
        kind: ErpRecordKind,
        id: &str,
    ) -> Result<Option<ErpRecord>>;

    async fn get_customer_by_email(
        &self,
        org: &OrganizationId,
        email: &str,
    ) -> Result<Option<ErpCustomer>>;

    /// Most recent first.
    async fn get_recent_orders(
        &self,
        org: &OrganizationId,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<ErpOrder>>;

    async fn get_shipping_status(
        &self,
        org: &OrganizationId,
        order_id: &str,
    ) -> Result<Option<ShippingStatus>>;
}

fn push_opt(lines: &mut Vec<String>, label: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
        lines.push(format!("{label}: {v}"));
    }
}

/// Source id for an ERP record: `<kind>:<id>`.
pub fn erp_source_id(kind: ErpRecordKind, id: &str) -> String {
    format!("{}:{id}", kind.as_str())
}

pub fn format_product(p: &ErpProduct) -> ContentItem {
    let mut lines = vec![format!("Product: {}", p.name)];
    push_opt(&mut lines, "Code", p.code.as_deref());
    push_opt(&mut lines, "Category", p.category.as_deref());
    push_opt(&mut lines, "Unit", p.unit.as_deref());
    if let Some(price) = p.price {
        let currency = p.currency.as_deref().unwrap_or("EUR");
        lines.push(format!("Price: {price:.2} {currency}"));
    }
    if let Some(stock) = p.stock {
        lines.push(format!("Stock: {stock}"));
    }
    push_opt(&mut lines, "Description", p.description.as_deref());

    let mut metadata = Metadata::new().with("erp_kind", "product").with("erp_id", p.id.clone());
    if let Some(c) = &p.category {
        metadata.insert("category", c.clone());
    }
    if let Some(price) = p.price.filter(|p| *p >= 0.0) {
        metadata.insert("price", price);
    }
    if let Some(code) = &p.code {
        metadata.insert("product_id", code.clone());
    }

    ContentItem {
        title: p.name.clone(),
        content: lines.join("\n"),
        source_type: SourceType::Metakocka,
        source_id: erp_source_id(ErpRecordKind::Product, &p.id),
        metadata,
    }
}

pub fn format_customer(c: &ErpCustomer) -> ContentItem {
    let mut lines = vec![format!("Customer: {}", c.name)];
    push_opt(&mut lines, "Email", c.email.as_deref());
    push_opt(&mut lines, "Phone", c.phone.as_deref());
    push_opt(&mut lines, "Tax number", c.tax_number.as_deref());
    push_opt(&mut lines, "Address", c.address.as_deref());
    if !c.tags.is_empty() {
        lines.push(format!("Tags: {}", c.tags.join(", ")));
    }
    push_opt(&mut lines, "Notes", c.notes.as_deref());

    let metadata = Metadata::new()
        .with("erp_kind", "customer")
        .with("erp_id", c.id.clone())
        .with("customer_id", c.id.clone());

    ContentItem {
        title: c.name.clone(),
        content: lines.join("\n"),
        source_type: SourceType::Metakocka,
        source_id: erp_source_id(ErpRecordKind::Customer, &c.id),
        metadata,
    }
}

pub fn format_order(o: &ErpOrder) -> ContentItem {
    let currency = o.currency.as_deref().unwrap_or("EUR");
    let mut lines = vec![format!("Order: {}", o.number)];
    push_opt(&mut lines, "Customer", o.customer_name.as_deref());
    push_opt(&mut lines, "Status", o.status.as_deref());
    if let Some(date) = o.order_date {
        lines.push(format!("Date: {}", date.format("%Y-%m-%d")));
    }
    if !o.items.is_empty() {
        lines.push("Items:".to_string());
        for item in &o.items {
            let code = item
                .product_code
                .as_deref()
                .map(|c| format!(" ({c})"))
                .unwrap_or_default();
            lines.push(format!(
                "- {}{code}: {} x {:.2} {currency}",
                item.name, item.quantity, item.price
            ));
        }
    }
    lines.push(format!("Total: {:.2} {currency}", o.total));
    push_opt(&mut lines, "Delivery address", o.delivery_address.as_deref());

    let mut metadata = Metadata::new().with("erp_kind", "order").with("erp_id", o.id.clone());
    if let Some(cid) = &o.customer_id {
        metadata.insert("customer_id", cid.clone());
    }

    ContentItem {
        title: format!("Order {}", o.number),
        content: lines.join("\n"),
        source_type: SourceType::Metakocka,
        source_id: erp_source_id(ErpRecordKind::Order, &o.id),
        metadata,
    }
}

pub fn format_record(record: &ErpRecord) -> ContentItem {
    match record {
        ErpRecord::Product(p) => format_product(p),
        ErpRecord::Customer(c) => format_customer(c),
        ErpRecord::Order(o) => format_order(o),
    }
}
