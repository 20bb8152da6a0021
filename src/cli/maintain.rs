//! `init`, `cleanup`, `rm`, and `verify` commands.

use std::time::Duration;

use console::style;

use crate::config::Settings;

pub fn init(settings: &Settings) -> anyhow::Result<()> {
    let _store = super::open_store(settings)?;
    println!(
        "{} Initialized cache at {}",
        style("✓").green(),
        settings.cache_root().display()
    );
    Ok(())
}

pub fn cleanup(settings: &Settings, max_age_days: u64) -> anyhow::Result<()> {
    let store = super::open_store(settings)?;
    let removed = store.cleanup(Duration::from_secs(max_age_days * 24 * 3600))?;
    println!(
        "Removed {} entr(ies) not accessed in the last {} day(s)",
        style(removed).bold(),
        max_age_days
    );
    Ok(())
}

pub fn rm(settings: &Settings, id: &str) -> anyhow::Result<()> {
    let store = super::open_store(settings)?;

    // Allow the shortened ids printed by `ls`
    let full_id = if id.len() < 36 {
        store
            .list_all()?
            .into_iter()
            .find(|a| a.id.starts_with(id))
            .map(|a| a.id)
            .unwrap_or_else(|| id.to_string())
    } else {
        id.to_string()
    };

    if store.remove(&full_id)? {
        println!("{} Removed {}", style("✓").green(), full_id);
    } else {
        println!("{} No asset with id {}", style("✗").red(), id);
    }
    Ok(())
}

pub fn verify(settings: &Settings) -> anyhow::Result<()> {
    let store = super::open_store(settings)?;
    let report = store.verify()?;

    println!("{}", style("Verify").bold());
    println!("  Purged index entries:  {}", report.purged_entries);
    println!("  Removed orphan blobs:  {}", report.removed_blobs);
    println!("  Removed orphan thumbs: {}", report.removed_thumbnails);
    println!("  Removed staging files: {}", report.removed_staging);
    Ok(())
}
