//! Store maintenance commands.
//!
//! Backs `read`, `sql`, `show`, `db` and `table`. Each command opens its own
//! store session, prints its result on stdout and disconnects.

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::schema::TableSchema;
use crate::store::{quote_ident, read_tail_sql, StoreConnector, TextRow};

/// Default number of rows printed by `read`.
pub const DEFAULT_READ_COUNT: u64 = 10;

async fn open_store(config: &Config, with_database: bool) -> Result<StoreConnector> {
    let mut store = StoreConnector::new(config.store.clone());
    store
        .connect(with_database)
        .await
        .with_context(|| format!("Failed to connect to MySQL at {}", config.store.host))?;
    Ok(store)
}

/// Print the last `count` rows of `table`, newest first.
pub async fn run_read(config: &Config, table: &str, count: u64) -> Result<()> {
    let sql = read_tail_sql(table, count)?;
    let mut store = open_store(config, true).await?;
    let rows = store.execute_sql(&sql).await;
    store.disconnect().await;

    let rows = rows.with_context(|| format!("Failed to read table {}", table))?;
    print_rows(&rows);
    println!("{} rows", rows.len());
    Ok(())
}

/// Execute an ad-hoc statement and print whatever rows it returns.
pub async fn run_sql(config: &Config, statement: &str) -> Result<()> {
    let mut store = open_store(config, true).await?;
    let rows = store.execute_sql(statement).await;
    store.disconnect().await;

    let rows = rows.context("SQL statement failed")?;
    print_rows(&rows);
    Ok(())
}

pub async fn show_databases(config: &Config) -> Result<()> {
    let mut store = open_store(config, false).await?;
    let rows = store.execute_sql("SHOW DATABASES").await;
    store.disconnect().await;

    print_rows(&rows?);
    Ok(())
}

pub async fn show_tables(config: &Config) -> Result<()> {
    let mut store = open_store(config, true).await?;
    let rows = store.execute_sql("SHOW TABLES").await;
    store.disconnect().await;

    print_rows(&rows?);
    Ok(())
}

/// Print the column definitions of `table`.
pub async fn show_schema(config: &Config, table: &str) -> Result<()> {
    let sql = format!("DESCRIBE {}", quote_ident(table)?);
    let mut store = open_store(config, true).await?;
    let rows = store.execute_sql(&sql).await;
    store.disconnect().await;

    let rows = rows.with_context(|| format!("Failed to describe table {}", table))?;
    println!(
        "{:<24} {:<16} {:<6} {:<6} {:<20}",
        "FIELD", "TYPE", "NULL", "KEY", "DEFAULT"
    );
    for row in &rows {
        let cell = |i: usize| text_cell(row.get(i).and_then(|c| c.as_deref()));
        println!(
            "{:<24} {:<16} {:<6} {:<6} {:<20}",
            cell(0),
            cell(1),
            cell(2),
            cell(3),
            cell(4)
        );
    }
    Ok(())
}

pub async fn create_database(config: &Config, name: &str) -> Result<()> {
    let mut store = open_store(config, false).await?;
    let result = store.create_database(name).await;
    store.disconnect().await;

    result.with_context(|| format!("Failed to create database {}", name))?;
    println!("Created database {}", name);
    Ok(())
}

pub async fn drop_database(config: &Config, name: &str, confirmed: bool) -> Result<()> {
    require_confirmation(confirmed, &format!("database {}", name))?;
    let mut store = open_store(config, false).await?;
    let result = store.drop_database(name).await;
    store.disconnect().await;

    result.with_context(|| format!("Failed to delete database {}", name))?;
    println!("Deleted database {}", name);
    Ok(())
}

pub async fn create_table(config: &Config, table: &str, schema: &TableSchema) -> Result<()> {
    let mut store = open_store(config, true).await?;
    let result = store.create_table(table, schema).await;
    store.disconnect().await;

    result.with_context(|| format!("Failed to create table {}", table))?;
    println!("Created table {} ({})", table, schema);
    Ok(())
}

pub async fn drop_table(config: &Config, table: &str, confirmed: bool) -> Result<()> {
    require_confirmation(confirmed, &format!("table {}", table))?;
    let mut store = open_store(config, true).await?;
    let result = store.drop_table(table).await;
    store.disconnect().await;

    result.with_context(|| format!("Failed to delete table {}", table))?;
    println!("Deleted table {}", table);
    Ok(())
}

fn require_confirmation(confirmed: bool, what: &str) -> Result<()> {
    if !confirmed {
        bail!("Refusing to delete {} without --yes", what);
    }
    Ok(())
}

fn text_cell(value: Option<&str>) -> &str {
    value.unwrap_or("NULL")
}

fn format_row(row: &TextRow) -> String {
    row.iter()
        .map(|c| text_cell(c.as_deref()))
        .collect::<Vec<_>>()
        .join("\t")
}

fn print_rows(rows: &[TextRow]) {
    for row in rows {
        println!("{}", format_row(row));
    }
}
