//! MySQL store connector.
//!
//! A [`StoreConnector`] owns at most one open [`MySqlConnection`]. Every
//! operation other than [`StoreConnector::connect`] fails with
//! [`StoreError::NotConnected`] until a session is open.
//!
//! Statement text is produced by small pure builders ([`create_table_sql`],
//! [`insert_row_sql`], [`read_tail_sql`]) so column selection and quoting can
//! be tested without a server.
//!
//! # Row insertion
//!
//! Only attributes named by a declared column are written, in schema order.
//! Unknown attribute keys are ignored and declared columns missing from the
//! record fall back to the column default, except `TIMESTAMP`, which is set to
//! `CURRENT_TIMESTAMP` when the record does not carry it.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::models::Attributes;
use crate::schema::{TableSchema, TIMESTAMP_COLUMN};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not connected to the database server")]
    NotConnected,

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// A row of textual column values, `None` for SQL NULL.
pub type TextRow = Vec<Option<String>>;

/// The store operations the ingestion loop depends on.
#[async_trait]
pub trait RowSink: Send {
    /// Check that `table` exists, creating it from `schema` when absent and
    /// `create_if_missing` is set. Returns whether the table exists now.
    async fn ensure_table_exists(
        &mut self,
        table: &str,
        schema: &TableSchema,
        create_if_missing: bool,
    ) -> Result<bool, StoreError>;

    /// Insert a single row. Returns the number of affected rows.
    async fn insert_row(
        &mut self,
        attributes: &Attributes,
        table: &str,
        schema: &TableSchema,
    ) -> Result<u64, StoreError>;

    /// Release the session. Safe to repeat.
    async fn disconnect(&mut self);
}

pub struct StoreConnector {
    config: StoreConfig,
    conn: Option<MySqlConnection>,
}

impl StoreConnector {
    pub fn new(config: StoreConfig) -> Self {
        Self { config, conn: None }
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Open a session. Without `with_database` no default database is
    /// selected, which is what database create/drop need.
    pub async fn connect(&mut self, with_database: bool) -> Result<(), StoreError> {
        self.disconnect().await;

        let mut options = MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.username)
            .password(&self.config.password);
        if with_database {
            options = options.database(&self.config.database);
        }

        let conn = MySqlConnection::connect_with(&options).await?;
        self.conn = Some(conn);
        info!(
            "Connected to database server {}:{}{}",
            self.config.host,
            self.config.port,
            if with_database {
                format!(" ({})", self.config.database)
            } else {
                String::new()
            }
        );
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("database close: {}", e);
            }
            info!("Disconnected from database server");
        }
    }

    fn conn(&mut self) -> Result<&mut MySqlConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::NotConnected)
    }

    pub async fn table_exists(&mut self, table: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_one(conn)
        .await?;
        Ok(count > 0)
    }

    pub async fn ensure_table_exists(
        &mut self,
        table: &str,
        schema: &TableSchema,
        create_if_missing: bool,
    ) -> Result<bool, StoreError> {
        if self.table_exists(table).await? {
            return Ok(true);
        }
        if !create_if_missing {
            return Ok(false);
        }
        self.create_table(table, schema).await?;
        Ok(true)
    }

    pub async fn insert_row(
        &mut self,
        attributes: &Attributes,
        table: &str,
        schema: &TableSchema,
    ) -> Result<u64, StoreError> {
        let insert = insert_row_sql(table, schema, attributes)?;
        let conn = self.conn()?;

        let mut query = sqlx::query(&insert.sql);
        for value in insert.values {
            query = match value {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(b),
                Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => query.bind(i),
                    (None, Some(f)) => query.bind(f),
                    (None, None) => query.bind(n.to_string()),
                },
                Value::String(s) => query.bind(s),
                other => query.bind(other.to_string()),
            };
        }

        let result = query.execute(conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn create_database(&mut self, name: &str) -> Result<(), StoreError> {
        let sql = format!("CREATE DATABASE {}", quote_ident(name)?);
        self.execute(&sql).await?;
        info!("Created database {}", name);
        Ok(())
    }

    pub async fn drop_database(&mut self, name: &str) -> Result<(), StoreError> {
        let sql = format!("DROP DATABASE {}", quote_ident(name)?);
        self.execute(&sql).await?;
        info!("Deleted database {}", name);
        Ok(())
    }

    pub async fn create_table(
        &mut self,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), StoreError> {
        let sql = create_table_sql(table, schema)?;
        self.execute(&sql).await?;
        info!("Created table {}", table);
        Ok(())
    }

    pub async fn drop_table(&mut self, table: &str) -> Result<(), StoreError> {
        if !self.table_exists(table).await? {
            return Err(StoreError::MissingTable(table.to_string()));
        }
        let sql = format!("DROP TABLE {}", quote_ident(table)?);
        self.execute(&sql).await?;
        info!("Deleted table {}", table);
        Ok(())
    }

    /// Run an ad-hoc statement and return its rows in server order.
    pub async fn execute_sql(&mut self, statement: &str) -> Result<Vec<TextRow>, StoreError> {
        let conn = self.conn()?;
        // Unprepared statements use the text protocol, so every column value
        // arrives as text regardless of its SQL type.
        let rows: Vec<MySqlRow> = sqlx::raw_sql(statement).fetch_all(conn).await?;
        rows.iter().map(row_to_text).collect()
    }

    async fn execute(&mut self, statement: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        sqlx::raw_sql(statement).execute(conn).await?;
        Ok(())
    }
}

#[async_trait]
impl RowSink for StoreConnector {
    async fn ensure_table_exists(
        &mut self,
        table: &str,
        schema: &TableSchema,
        create_if_missing: bool,
    ) -> Result<bool, StoreError> {
        StoreConnector::ensure_table_exists(self, table, schema, create_if_missing).await
    }

    async fn insert_row(
        &mut self,
        attributes: &Attributes,
        table: &str,
        schema: &TableSchema,
    ) -> Result<u64, StoreError> {
        StoreConnector::insert_row(self, attributes, table, schema).await
    }

    async fn disconnect(&mut self) {
        StoreConnector::disconnect(self).await
    }
}

fn row_to_text(row: &MySqlRow) -> Result<TextRow, StoreError> {
    (0..row.len())
        .map(|i| {
            match row.try_get_unchecked::<Option<String>, _>(i) {
                Ok(value) => Ok(value),
                // Binary columns that aren't valid UTF-8.
                Err(_) => Ok(row
                    .try_get_unchecked::<Option<Vec<u8>>, _>(i)?
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())),
            }
        })
        .collect()
}

/// Backtick-quote a MySQL identifier.
pub fn quote_ident(name: &str) -> Result<String, StoreError> {
    if name.is_empty() || name.contains('\0') {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// `CREATE TABLE` with columns in schema order and types verbatim.
pub fn create_table_sql(table: &str, schema: &TableSchema) -> Result<String, StoreError> {
    let columns = schema
        .columns()
        .iter()
        .map(|c| Ok(format!("{} {}", quote_ident(&c.name)?, c.sql_type)))
        .collect::<Result<Vec<_>, StoreError>>()?;
    Ok(format!(
        "CREATE TABLE {} ({})",
        quote_ident(table)?,
        columns.join(", ")
    ))
}

/// A parameterised insert: `sql` has one `?` per entry of `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub sql: String,
    pub values: Vec<Value>,
}

pub fn insert_row_sql(
    table: &str,
    schema: &TableSchema,
    attributes: &Attributes,
) -> Result<InsertStatement, StoreError> {
    let mut names = Vec::new();
    let mut placeholders = Vec::new();
    let mut values = Vec::new();

    for column in schema.columns() {
        match attributes.get(&column.name) {
            Some(value) => {
                names.push(quote_ident(&column.name)?);
                placeholders.push("?");
                values.push(value.clone());
            }
            None if column.name == TIMESTAMP_COLUMN => {
                names.push(quote_ident(&column.name)?);
                placeholders.push("CURRENT_TIMESTAMP");
            }
            None => {}
        }
    }

    Ok(InsertStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            names.join(", "),
            placeholders.join(", ")
        ),
        values,
    })
}

/// Newest `count` rows of `table`.
pub fn read_tail_sql(table: &str, count: u64) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT * FROM {} ORDER BY {} DESC LIMIT {}",
        quote_ident(table)?,
        quote_ident(TIMESTAMP_COLUMN)?,
        count
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema;

    fn schema() -> TableSchema {
        parse_schema("UNIT_NAME:VARCHAR(64) LOCATION:VARCHAR(64) TIMESTAMP:TIMESTAMP VOLTS:FLOAT(5,2) AMPS:FLOAT(5,2)")
            .unwrap()
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn test_config() -> StoreConfig {
        StoreConfig {
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "writer".to_string(),
            password: String::new(),
            database: "YSMARTMDB".to_string(),
        }
    }

    #[test]
    fn test_create_table_keeps_schema_order_and_types() {
        let sql = create_table_sql("meter1", &schema()).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE `meter1` (`UNIT_NAME` VARCHAR(64), `LOCATION` VARCHAR(64), `TIMESTAMP` TIMESTAMP, `VOLTS` FLOAT(5,2), `AMPS` FLOAT(5,2))"
        );
    }

    #[test]
    fn test_insert_ignores_unknown_keys() {
        let row = attrs(&[
            ("UNIT_NAME", Value::from("meter1")),
            ("VOLTS", Value::from("230.1")),
            ("FIRMWARE", Value::from("1.2.3")),
            ("LOCATION", Value::from("lab")),
        ]);
        let insert = insert_row_sql("meter1", &schema(), &row).unwrap();
        assert!(!insert.sql.contains("FIRMWARE"));
        assert_eq!(
            insert.values,
            vec![
                Value::from("meter1"),
                Value::from("lab"),
                Value::from("230.1")
            ]
        );
    }

    #[test]
    fn test_insert_omits_missing_columns_for_store_default() {
        let row = attrs(&[("UNIT_NAME", Value::from("meter1"))]);
        let insert = insert_row_sql("meter1", &schema(), &row).unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO `meter1` (`UNIT_NAME`, `TIMESTAMP`) VALUES (?, CURRENT_TIMESTAMP)"
        );
        assert_eq!(insert.values.len(), 1);
        assert_eq!(insert.sql.matches('?').count(), insert.values.len());
    }

    #[test]
    fn test_insert_uses_supplied_timestamp() {
        let row = attrs(&[
            ("UNIT_NAME", Value::from("meter1")),
            ("TIMESTAMP", Value::from("2024-01-01 00:00:00")),
        ]);
        let insert = insert_row_sql("meter1", &schema(), &row).unwrap();
        assert!(!insert.sql.contains("CURRENT_TIMESTAMP"));
        assert_eq!(insert.values.len(), 2);
    }

    #[test]
    fn test_quote_ident_escapes_backticks() {
        assert_eq!(quote_ident("meter1").unwrap(), "`meter1`");
        assert_eq!(quote_ident("a`b").unwrap(), "`a``b`");
        assert!(matches!(
            quote_ident(""),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_read_tail_sql() {
        assert_eq!(
            read_tail_sql("meter1", 5).unwrap(),
            "SELECT * FROM `meter1` ORDER BY `TIMESTAMP` DESC LIMIT 5"
        );
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let mut store = StoreConnector::new(test_config());
        assert!(!store.is_connected());

        let row = attrs(&[("UNIT_NAME", Value::from("meter1"))]);
        assert!(matches!(
            store.insert_row(&row, "meter1", &schema()).await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(
            store.create_table("meter1", &schema()).await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(
            store.drop_table("meter1").await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(
            store.create_database("X").await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(
            store.drop_database("X").await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(
            store.execute_sql("SHOW TABLES").await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(
            store.ensure_table_exists("meter1", &schema(), true).await,
            Err(StoreError::NotConnected)
        ));

        // Idempotent without a session.
        store.disconnect().await;
        store.disconnect().await;
    }
}
