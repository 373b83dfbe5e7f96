//! Backend liveness table from one scrape of the uploader metrics.

use anyhow::{Context, Result};
use prometheus::Registry;

use qsfs_config::Config;
use qsfs_zstor::MetricsScraper;

pub async fn run(config: &Config) -> Result<()> {
    let registry = Registry::new();
    let mut scraper = MetricsScraper::new(config.zstor_config_path.clone(), &registry)
        .context("scraper setup failed")?;
    scraper
        .scrape()
        .await
        .context("could not scrape uploader metrics, is zstor running?")?;

    let statuses = scraper.statuses();
    if statuses.is_empty() {
        println!("No backend statuses found.");
        return Ok(());
    }

    println!(
        "{:<45} {:<8} {:<24} {:<8} {}",
        "ADDRESS", "TYPE", "NAMESPACE", "STATUS", "LAST SEEN"
    );
    let mut rows: Vec<_> = statuses.values().collect();
    rows.sort_by(|a, b| {
        (&a.address, &a.backend_type, &a.namespace)
            .cmp(&(&b.address, &b.backend_type, &b.namespace))
    });
    for status in rows {
        let state = if status.is_alive { "ALIVE" } else { "DEAD" };
        let last_seen = match status.last_seen.elapsed() {
            Ok(age) => format!("{}s ago", age.as_secs()),
            Err(_) => "now".to_string(),
        };
        println!(
            "{:<45} {:<8} {:<24} {:<8} {}",
            status.address, status.backend_type, status.namespace, state, last_seen
        );
    }

    Ok(())
}
