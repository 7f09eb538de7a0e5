use anyhow::{Context, Result};
use rusqlite::Connection;
use std::fs;
use std::path::Path;

pub fn conn(database_url: &str) -> Result<Connection> {
    if let Some(dir) = Path::new(database_url)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
    {
        fs::create_dir_all(dir)
            .with_context(|| format!("create database directory {}", dir.display()))?;
    }
    let conn = Connection::open(database_url)
        .with_context(|| format!("open database {database_url}"))?;

    // Initialize the database tables
    crate::database::create_tables(&conn)?;

    Ok(conn)
}

pub fn in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    crate::database::create_tables(&conn)?;
    Ok(conn)
}
