//! Schema Introspection Module
//!
//! Reads column lists and foreign key targets from the live catalog.

use crate::error::BoxError;
use crate::session::Session;
use async_trait::async_trait;
use tracing::trace;

/// Catalog lookups needed to order and emit tables
#[async_trait(?Send)]
pub trait SchemaIntrospector {
    /// Column names of `table` in ordinal order
    async fn columns_of(&self, table: &str) -> Result<Vec<String>, BoxError>;

    /// Tables that `table` references through foreign keys
    ///
    /// Only constraints where `table` is the referencing side are reported.
    /// A self-referencing table lists itself.
    async fn referenced_tables_of(&self, table: &str) -> Result<Vec<String>, BoxError>;
}

const COLUMNS_QUERY: &str = r#"
    SELECT attname::text AS colname
    FROM pg_catalog.pg_attribute
    WHERE
        attrelid = $1::text::regclass
        AND attnum > 0
        AND attisdropped = FALSE
    ORDER BY attnum
"#;

const REFERENCED_TABLES_QUERY: &str = r#"
    SELECT confrelid::regclass::text AS tablename
    FROM pg_catalog.pg_constraint
    WHERE
        conrelid = $1::text::regclass
        AND contype = 'f'
    ORDER BY conname
"#;

#[async_trait(?Send)]
impl SchemaIntrospector for Session {
    async fn columns_of(&self, table: &str) -> Result<Vec<String>, BoxError> {
        let rows = self.client().query(COLUMNS_QUERY, &[&table]).await?;
        let columns: Vec<String> = rows.iter().map(|row| row.get("colname")).collect();
        trace!("Table {} has columns {:?}", table, columns);
        Ok(columns)
    }

    async fn referenced_tables_of(&self, table: &str) -> Result<Vec<String>, BoxError> {
        let rows = self.client().query(REFERENCED_TABLES_QUERY, &[&table]).await?;

        // One table may be referenced by several constraints
        let mut tables: Vec<String> = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("tablename");
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
        trace!("Table {} references {:?}", table, tables);
        Ok(tables)
    }
}
