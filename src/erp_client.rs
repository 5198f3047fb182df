//! HTTP [`ErpClient`] against the ERP gateway.
//!
//! Every request carries the `ERP_API_KEY` bearer token and the tenant in
//! an `X-Organization-Id` header. A 404 on a single-record lookup means
//! "not found" and maps to `Ok(None)`.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | AI context | `GET /ai-context` |
//! | Record | `GET /{products,customers,orders}/{id}` |
//! | Customer by email | `GET /customers?email=` |
//! | Recent orders | `GET /customers/{id}/orders?limit=` |
//! | Shipping | `GET /orders/{id}/shipping` |

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crm_rag_core::erp::{
    ErpClient, ErpContext, ErpCustomer, ErpOrder, ErpRecord, ErpRecordKind, ShippingStatus,
};
use crm_rag_core::models::OrganizationId;

use crate::config::{credential, ErpConfig, ERP_API_KEY_ENV};

pub struct HttpErpClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpErpClient {
    /// `Ok(None)` when no `erp.base_url` is configured.
    pub fn from_config(config: &ErpConfig) -> Result<Option<Self>> {
        let base_url = match &config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => return Ok(None),
        };
        let api_key = credential(ERP_API_KEY_ENV)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Some(Self {
            client,
            base_url,
            api_key,
        }))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        org: &OrganizationId,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("X-Organization-Id", org.as_str())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("ERP API error {} on {}: {}", status, path, body_text);
        }
        Ok(Some(response.json().await?))
    }
}

fn record_path(kind: ErpRecordKind, id: &str) -> String {
    format!("/{}s/{}", kind.as_str(), id)
}

#[async_trait]
impl ErpClient for HttpErpClient {
    async fn get_ai_context(&self, org: &OrganizationId) -> Result<ErpContext> {
        Ok(self.get(org, "/ai-context", &[]).await?.unwrap_or_default())
    }

    async fn get_record(
        &self,
        org: &OrganizationId,
        kind: ErpRecordKind,
        id: &str,
    ) -> Result<Option<ErpRecord>> {
        let path = record_path(kind, id);
        let record = match kind {
            ErpRecordKind::Product => self.get(org, &path, &[]).await?.map(ErpRecord::Product),
            ErpRecordKind::Customer => self.get(org, &path, &[]).await?.map(ErpRecord::Customer),
            ErpRecordKind::Order => self.get(org, &path, &[]).await?.map(ErpRecord::Order),
        };
        Ok(record)
    }

    async fn get_customer_by_email(
        &self,
        org: &OrganizationId,
        email: &str,
    ) -> Result<Option<ErpCustomer>> {
        let found: Option<Vec<ErpCustomer>> = self
            .get(org, "/customers", &[("email", email.to_string())])
            .await?;
        Ok(found.and_then(|list| list.into_iter().next()))
    }

    async fn get_recent_orders(
        &self,
        org: &OrganizationId,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<ErpOrder>> {
        let path = format!("/customers/{customer_id}/orders");
        let mut orders: Vec<ErpOrder> = self
            .get(org, &path, &[("limit", limit.to_string())])
            .await?
            .unwrap_or_default();
        orders.sort_by(|a, b| b.order_date.cmp(&a.order_date));
        orders.truncate(limit);
        Ok(orders)
    }

    async fn get_shipping_status(
        &self,
        org: &OrganizationId,
        order_id: &str,
    ) -> Result<Option<ShippingStatus>> {
        self.get(org, &format!("/orders/{order_id}/shipping"), &[]).await
    }
}
