//! Idempotent schema creation.
//!
//! Knowledge-base, memory and access-log tables belong to the retrieval
//! layer. The tenant tables (`products`, `documents`, subscriptions, ...)
//! mirror the shapes the CRM application owns, so the adapters can run
//! against a local database.

use anyhow::Result;
use sqlx::SqlitePool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS knowledge_entries (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_id TEXT NOT NULL,
        title TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        content TEXT NOT NULL,
        token_count INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        embedding BLOB NOT NULL,
        dims INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(organization_id, source_type, source_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        user_id TEXT,
        shared INTEGER NOT NULL DEFAULT 0,
        memory_type TEXT NOT NULL,
        content TEXT NOT NULL,
        importance_score REAL NOT NULL DEFAULT 0.5,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        embedding BLOB NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS memory_access_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        memory_id TEXT NOT NULL,
        organization_id TEXT NOT NULL,
        access_type TEXT NOT NULL,
        user_id TEXT,
        context TEXT,
        accessed_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        name TEXT NOT NULL,
        sku TEXT,
        category TEXT,
        description TEXT,
        unit TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS price_list_items (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        price REAL NOT NULL,
        currency TEXT NOT NULL DEFAULT 'EUR'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS suppliers (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        name TEXT NOT NULL,
        reliability_score REAL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_suppliers (
        product_id TEXT NOT NULL,
        supplier_id TEXT NOT NULL,
        PRIMARY KEY (product_id, supplier_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS erp_mappings (
        organization_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        external_code TEXT NOT NULL,
        sync_status TEXT NOT NULL DEFAULT 'synced',
        last_synced_at INTEGER,
        PRIMARY KEY (organization_id, product_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        title TEXT NOT NULL,
        file_name TEXT,
        document_type TEXT,
        language TEXT,
        extracted_text TEXT,
        extracted_data_json TEXT,
        processing_status TEXT NOT NULL DEFAULT 'pending',
        processing_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS organization_subscriptions (
        organization_id TEXT NOT NULL,
        plan TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_context_settings (
        organization_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        settings_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (organization_id, user_id)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_knowledge_source ON knowledge_entries(organization_id, source_type, source_id)",
    "CREATE INDEX IF NOT EXISTS idx_knowledge_created ON knowledge_entries(organization_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_memories_org ON memories(organization_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_access_memory ON memory_access_log(memory_id)",
    "CREATE INDEX IF NOT EXISTS idx_products_org ON products(organization_id)",
    "CREATE INDEX IF NOT EXISTS idx_prices_product ON price_list_items(product_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_org ON documents(organization_id, processing_status)",
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_org ON organization_subscriptions(organization_id, status)",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
