//! Read access to the tenant tables the adapters ingest from.
//!
//! Products come with their price-list rows, suppliers, and ERP mapping
//! already joined. Documents carry whatever an earlier extraction step
//! stored. The only write the retrieval layer makes here is the document
//! processing status.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crm_rag_core::models::{Metadata, OrganizationId};

use crate::sqlite_store::ts_to_datetime;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRow {
    pub price: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierRow {
    pub name: String,
    pub reliability_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErpMapping {
    pub external_code: String,
    pub sync_status: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantProduct {
    pub id: String,
    pub name: String,
    pub sku: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub metadata: Metadata,
    pub prices: Vec<PriceRow>,
    pub suppliers: Vec<SupplierRow>,
    pub erp: Option<ErpMapping>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    RagIndexed,
    RagFailed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::RagIndexed => "rag_indexed",
            Self::RagFailed => "rag_failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processed" => Self::Processed,
            "rag_indexed" => Self::RagIndexed,
            "rag_failed" => Self::RagFailed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantDocument {
    pub id: String,
    pub title: String,
    pub file_name: Option<String>,
    pub document_type: Option<String>,
    pub language: Option<String>,
    pub extracted_text: Option<String>,
    pub extracted_data: Option<serde_json::Value>,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Tenant tables consumed by the product and document adapters.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn list_products(&self, org: &OrganizationId) -> Result<Vec<TenantProduct>>;

    async fn get_product(&self, org: &OrganizationId, id: &str) -> Result<Option<TenantProduct>>;

    /// Documents not yet indexed (`pending`, `processed`, or `rag_failed`).
    async fn list_unindexed_documents(&self, org: &OrganizationId) -> Result<Vec<TenantDocument>>;

    async fn get_document(&self, org: &OrganizationId, id: &str) -> Result<Option<TenantDocument>>;

    async fn set_document_status(
        &self,
        org: &OrganizationId,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteTenantStore {
    pool: SqlitePool,
}

impl SqliteTenantStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn enrich(&self, org: &OrganizationId, row: &SqliteRow) -> Result<TenantProduct> {
        let id: String = row.get("id");
        let metadata_json: String = row.get("metadata_json");

        let prices = sqlx::query(
            "SELECT price, currency FROM price_list_items WHERE organization_id = ? AND product_id = ?",
        )
        .bind(org.as_str())
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| PriceRow {
            price: r.get("price"),
            currency: r.get("currency"),
        })
        .collect();

        let suppliers = sqlx::query(
            r#"
            SELECT s.name, s.reliability_score
            FROM product_suppliers ps
            JOIN suppliers s ON s.id = ps.supplier_id
            WHERE ps.product_id = ? AND s.organization_id = ?
            ORDER BY s.name
            "#,
        )
        .bind(&id)
        .bind(org.as_str())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| SupplierRow {
            name: r.get("name"),
            reliability_score: r.get("reliability_score"),
        })
        .collect();

        let erp = sqlx::query(
            "SELECT external_code, sync_status, last_synced_at FROM erp_mappings WHERE organization_id = ? AND product_id = ?",
        )
        .bind(org.as_str())
        .bind(&id)
        .fetch_optional(&self.pool)
        .await?
        .map(|r| ErpMapping {
            external_code: r.get("external_code"),
            sync_status: r.get("sync_status"),
            last_synced_at: r.get::<Option<i64>, _>("last_synced_at").map(ts_to_datetime),
        });

        Ok(TenantProduct {
            id,
            name: row.get("name"),
            sku: row.get("sku"),
            category: row.get("category"),
            description: row.get("description"),
            unit: row.get("unit"),
            metadata: Metadata::from_json(&metadata_json),
            prices,
            suppliers,
            erp,
            updated_at: ts_to_datetime(row.get("updated_at")),
        })
    }

    pub async fn upsert_product(&self, org: &OrganizationId, product: &TenantProduct) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, organization_id, name, sku, category, description, unit, metadata_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                sku = excluded.sku,
                category = excluded.category,
                description = excluded.description,
                unit = excluded.unit,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&product.id)
        .bind(org.as_str())
        .bind(&product.name)
        .bind(&product.sku)
        .bind(&product.category)
        .bind(&product.description)
        .bind(&product.unit)
        .bind(product.metadata.to_json())
        .bind(product.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM price_list_items WHERE organization_id = ? AND product_id = ?")
            .bind(org.as_str())
            .bind(&product.id)
            .execute(&mut *tx)
            .await?;
        for price in &product.prices {
            sqlx::query(
                "INSERT INTO price_list_items (id, organization_id, product_id, price, currency) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(org.as_str())
            .bind(&product.id)
            .bind(price.price)
            .bind(&price.currency)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM product_suppliers WHERE product_id = ?")
            .bind(&product.id)
            .execute(&mut *tx)
            .await?;
        for supplier in &product.suppliers {
            let supplier_id = format!("{}:{}", org, supplier.name);
            sqlx::query(
                r#"
                INSERT INTO suppliers (id, organization_id, name, reliability_score) VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET reliability_score = excluded.reliability_score
                "#,
            )
            .bind(&supplier_id)
            .bind(org.as_str())
            .bind(&supplier.name)
            .bind(supplier.reliability_score)
            .execute(&mut *tx)
            .await?;
            sqlx::query("INSERT OR IGNORE INTO product_suppliers (product_id, supplier_id) VALUES (?, ?)")
                .bind(&product.id)
                .bind(&supplier_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM erp_mappings WHERE organization_id = ? AND product_id = ?")
            .bind(org.as_str())
            .bind(&product.id)
            .execute(&mut *tx)
            .await?;
        if let Some(erp) = &product.erp {
            sqlx::query(
                "INSERT INTO erp_mappings (organization_id, product_id, external_code, sync_status, last_synced_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(org.as_str())
            .bind(&product.id)
            .bind(&erp.external_code)
            .bind(&erp.sync_status)
            .bind(erp.last_synced_at.map(|t| t.timestamp()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_document(&self, org: &OrganizationId, doc: &TenantDocument) -> Result<()> {
        let now = Utc::now().timestamp();
        let data_json = match &doc.extracted_data {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO documents (id, organization_id, title, file_name, document_type, language,
                                   extracted_text, extracted_data_json, processing_status,
                                   processing_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                file_name = excluded.file_name,
                document_type = excluded.document_type,
                language = excluded.language,
                extracted_text = excluded.extracted_text,
                extracted_data_json = excluded.extracted_data_json,
                processing_status = excluded.processing_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(org.as_str())
        .bind(&doc.title)
        .bind(&doc.file_name)
        .bind(&doc.document_type)
        .bind(&doc.language)
        .bind(&doc.extracted_text)
        .bind(data_json)
        .bind(doc.processing_status.as_str())
        .bind(&doc.processing_error)
        .bind(doc.created_at.timestamp())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_document(row: &SqliteRow) -> TenantDocument {
    let status: String = row.get("processing_status");
    let data_json: Option<String> = row.get("extracted_data_json");
    TenantDocument {
        id: row.get("id"),
        title: row.get("title"),
        file_name: row.get("file_name"),
        document_type: row.get("document_type"),
        language: row.get("language"),
        extracted_text: row.get("extracted_text"),
        extracted_data: data_json.and_then(|j| serde_json::from_str(&j).ok()),
        processing_status: ProcessingStatus::parse(&status),
        processing_error: row.get("processing_error"),
        created_at: ts_to_datetime(row.get("created_at")),
    }
}

#[async_trait]
impl TenantStore for SqliteTenantStore {
    async fn list_products(&self, org: &OrganizationId) -> Result<Vec<TenantProduct>> {
        let rows = sqlx::query("SELECT * FROM products WHERE organization_id = ? ORDER BY name")
            .bind(org.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut products = Vec::with_capacity(rows.len());
        for row in &rows {
            products.push(self.enrich(org, row).await?);
        }
        Ok(products)
    }

    async fn get_product(&self, org: &OrganizationId, id: &str) -> Result<Option<TenantProduct>> {
        let row = sqlx::query("SELECT * FROM products WHERE organization_id = ? AND id = ?")
            .bind(org.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.enrich(org, &row).await?)),
            None => Ok(None),
        }
    }

    async fn list_unindexed_documents(&self, org: &OrganizationId) -> Result<Vec<TenantDocument>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE organization_id = ? AND processing_status != 'rag_indexed' ORDER BY created_at",
        )
        .bind(org.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn get_document(&self, org: &OrganizationId, id: &str) -> Result<Option<TenantDocument>> {
        let row = sqlx::query("SELECT * FROM documents WHERE organization_id = ? AND id = ?")
            .bind(org.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn set_document_status(
        &self,
        org: &OrganizationId,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET processing_status = ?, processing_error = ?, updated_at = ? WHERE organization_id = ? AND id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(org.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn product_joins_prices_suppliers_and_erp() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("t.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let store = SqliteTenantStore::new(pool);
        let org = OrganizationId::new("org-1").unwrap();

        let product = TenantProduct {
            id: "p1".into(),
            name: "Brake pads".into(),
            sku: Some("BP-1".into()),
            category: Some("brakes".into()),
            description: None,
            unit: Some("set".into()),
            metadata: Metadata::new(),
            prices: vec![
                PriceRow { price: 40.0, currency: "EUR".into() },
                PriceRow { price: 50.0, currency: "EUR".into() },
            ],
            suppliers: vec![SupplierRow { name: "Acme".into(), reliability_score: Some(0.9) }],
            erp: Some(ErpMapping {
                external_code: "MK-77".into(),
                sync_status: "synced".into(),
                last_synced_at: None,
            }),
            updated_at: ts_to_datetime(1_700_000_000),
        };
        store.upsert_product(&org, &product).await.unwrap();

        let loaded = store.get_product(&org, "p1").await.unwrap().unwrap();
        assert_eq!(loaded.prices.len(), 2);
        assert_eq!(loaded.suppliers, product.suppliers);
        assert_eq!(loaded.erp.unwrap().external_code, "MK-77");

        let other = OrganizationId::new("org-2").unwrap();
        assert!(store.get_product(&other, "p1").await.unwrap().is_none());
        assert!(store.list_products(&other).await.unwrap().is_empty());
    }
}
