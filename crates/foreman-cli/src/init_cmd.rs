//! `foreman init` and `foreman db-init` commands.

use anyhow::{Context, Result, bail};

use foreman_core::phase::catalog;
use foreman_db::pool;

use crate::config::{ConfigFile, DatabaseSection, config_path, save_config};

/// Write the config file. No database required.
pub fn run_init(db_url: &str, force: bool) -> Result<()> {
    let path = config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_owned(),
        },
        ..Default::default()
    };
    save_config(&file)?;

    println!("Wrote {}", path.display());
    println!("Next: run `foreman db-init` to create the database and seed the phase catalog.");
    Ok(())
}

/// Create the database if needed, run migrations, and seed the built-in
/// phase catalog.
pub async fn run_db_init(database_url: Option<&str>) -> Result<()> {
    let db_config = crate::config::resolve_db_config(database_url);

    pool::ensure_database_exists(&db_config).await?;
    let pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&pool, pool::default_migrations_path()).await?;
    catalog::seed_phases(&pool)
        .await
        .context("failed to seed phase catalog")?;

    println!("Database ready at {}", db_config.database_url);
    for (table, count) in pool::table_counts(&pool).await? {
        println!("  {table:<24} {count:>6} rows");
    }
    Ok(())
}
