//! `ls` and `stats` commands.

use console::style;

use crate::config::Settings;
use crate::models::AssetCategory;
use crate::utils::format_size;

pub fn ls(
    settings: &Settings,
    project: Option<String>,
    category: Option<AssetCategory>,
) -> anyhow::Result<()> {
    let store = super::open_store(settings)?;

    let assets = match (&project, category) {
        (Some(project), _) => store.list_by_project(project)?,
        (None, Some(category)) => store.list_by_category(category)?,
        (None, None) => store.list_all()?,
    };
    // Both filters given: narrow the project listing by category
    let assets: Vec<_> = match (project.is_some(), category) {
        (true, Some(category)) => assets
            .into_iter()
            .filter(|a| a.category == category)
            .collect(),
        _ => assets,
    };

    if assets.is_empty() {
        println!("{}", style("No cached assets").dim());
        return Ok(());
    }

    for asset in &assets {
        println!(
            "{}  {:9}  {:>9}  {}  {}",
            style(&asset.id[..8]).cyan(),
            asset.category.id(),
            format_size(asset.size),
            style(asset.project_id.as_deref().unwrap_or("-")).dim(),
            asset.file_name,
        );
    }
    println!("\n{} asset(s)", assets.len());
    Ok(())
}

pub fn stats(settings: &Settings) -> anyhow::Result<()> {
    let store = super::open_store(settings)?;
    let stats = store.stats()?;

    println!("{}", style("Cache statistics").bold());
    println!("  Files:           {}", stats.total_files);
    println!("  Total size:      {}", format_size(stats.total_size));
    println!("  Available space: {}", format_size(stats.available_space));
    println!("  Hit rate:        {:.1}%", stats.hit_rate * 100.0);
    Ok(())
}
