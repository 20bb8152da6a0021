//! `fetch` command: submit URLs to the scheduler with live progress bars.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

use crate::config::Settings;
use crate::fetch::HttpFetcher;
use crate::models::{Priority, TaskId};
use crate::scheduler::{
    DownloadRequest, DownloadScheduler, SchedulerConfig, SubmitOptions, TaskEvent,
};
use crate::utils::extension_to_mime;

pub struct FetchArgs {
    pub urls: Vec<String>,
    pub workers: Option<usize>,
    pub priority: Priority,
    pub project: Option<String>,
    pub retries: Option<u32>,
    pub timeout: Option<u64>,
}

/// Derive a display/storage file name from a URL.
fn file_name_from_url(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.rev().find(|s| !s.is_empty()).map(String::from))
        })
        .unwrap_or_else(|| "asset".to_string())
}

pub async fn execute(settings: &Settings, args: FetchArgs) -> anyhow::Result<()> {
    if args.urls.is_empty() {
        anyhow::bail!("No URLs given");
    }

    let store = super::open_store(settings)?;
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(
        args.timeout.unwrap_or(settings.fetch_timeout_secs),
    )));
    let scheduler = DownloadScheduler::new(
        store,
        fetcher,
        SchedulerConfig {
            max_concurrent_downloads: args.workers.unwrap_or(settings.max_concurrent_downloads),
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            default_max_retries: settings.default_max_retries,
        },
    );

    let multi = MultiProgress::new();
    let bar_style = ProgressStyle::with_template(
        "{prefix:20!} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
    )
    .expect("valid progress template")
    .progress_chars("=> ");

    let bars: Arc<Mutex<HashMap<TaskId, ProgressBar>>> = Arc::new(Mutex::new(HashMap::new()));

    let events = scheduler.subscribe();
    let pump = tokio::spawn(pump_events(events, bars.clone()));

    let mut handles = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let file_name = file_name_from_url(url);
        let extension = file_name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let request = DownloadRequest {
            url: url.clone(),
            file_name: file_name.clone(),
            // No size hint from the CLI; the Content-Length header drives
            // progress when present
            expected_size: None,
            mime_type: extension_to_mime(extension).to_string(),
            opts: SubmitOptions {
                priority: args.priority,
                project_id: args.project.clone(),
                max_retries: args.retries,
                metadata: None,
            },
        };

        match scheduler.submit(request) {
            Ok(handle) => {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(bar_style.clone());
                bar.set_prefix(file_name);
                bars.lock().unwrap().insert(handle.task_id().to_string(), bar);
                handles.push((url.clone(), handle));
            }
            Err(e) => {
                eprintln!("{} {}: {}", style("✗").red(), url, e);
            }
        }
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut results = Vec::new();
    for (url, handle) in handles {
        match handle.wait().await {
            Ok(path) => {
                succeeded += 1;
                results.push(format!(
                    "{} {} {} {}",
                    style("✓").green(),
                    url,
                    style("->").dim(),
                    path.display()
                ));
            }
            Err(e) => {
                failed += 1;
                results.push(format!("{} {}: {}", style("✗").red(), url, e));
            }
        }
    }

    scheduler.shutdown();
    pump.abort();
    let _ = multi.clear();

    for line in results {
        println!("{}", line);
    }
    println!(
        "\n{} cached, {} failed",
        style(succeeded).green().bold(),
        if failed > 0 {
            style(failed).red().bold()
        } else {
            style(failed).dim()
        }
    );

    if failed > 0 && succeeded == 0 {
        anyhow::bail!("All downloads failed");
    }
    Ok(())
}

async fn pump_events(
    mut events: broadcast::Receiver<TaskEvent>,
    bars: Arc<Mutex<HashMap<TaskId, ProgressBar>>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let bars = bars.lock().unwrap();
        match event {
            TaskEvent::Progress {
                task_id, percent, ..
            } => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.set_position(u64::from(percent));
                }
            }
            TaskEvent::Retrying {
                task_id,
                retry_count,
                delay,
            } => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.set_position(0);
                    bar.set_message(format!("retry {} in {:?}", retry_count, delay));
                }
            }
            TaskEvent::Completed { task_id, .. } => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.set_position(100);
                    bar.finish_with_message("done");
                }
            }
            TaskEvent::Failed { task_id, error } => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.abandon_with_message(error);
                }
            }
            _ => {}
        }
    }
}
