//! Poller for the uploader's Prometheus endpoint.
//!
//! zstor exports one `connection_status` sample per backend; the scraper
//! keeps the latest view per `(address, backend_type, namespace)` and
//! mirrors it into this process's own registry. Entries are never removed:
//! a backend that stops being reported goes stale, it does not go healthy.

use crate::error::ZstorError;
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Latest known state of one backend namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub address: String,
    pub backend_type: String,
    pub namespace: String,
    pub is_alive: bool,
    pub last_seen: SystemTime,
}

/// Key used for status maps and shard lookups.
pub fn backend_key(address: &str, backend_type: &str, namespace: &str) -> String {
    format!("{}-{}-{}", address, backend_type, namespace)
}

/// Subset of the uploader's TOML config the daemon reads back.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UploaderConfig {
    prometheus_port: Option<u16>,
}

pub struct MetricsScraper {
    config_path: PathBuf,
    http: reqwest::Client,
    statuses: HashMap<String, BackendStatus>,
    status_gauge: GaugeVec,
    last_scrape_time: Gauge,
}

impl MetricsScraper {
    pub fn new(config_path: PathBuf, registry: &Registry) -> Result<Self, ZstorError> {
        let status_gauge = GaugeVec::new(
            Opts::new(
                "zstor_backend_status",
                "Status of zstor backends (1 = alive, 0 = dead)",
            ),
            &["address", "backend_type", "namespace"],
        )?;
        let last_scrape_time = Gauge::new(
            "zstor_last_scrape_time",
            "Timestamp of the last successful scrape",
        )?;
        registry.register(Box::new(status_gauge.clone()))?;
        registry.register(Box::new(last_scrape_time.clone()))?;

        Ok(Self {
            config_path,
            http: reqwest::Client::new(),
            statuses: HashMap::new(),
            status_gauge,
            last_scrape_time,
        })
    }

    /// Port the uploader serves metrics on. Read from its config on every
    /// scrape so a rewritten config takes effect without a restart.
    pub fn prometheus_port(&self) -> Result<u16, ZstorError> {
        let contents = std::fs::read_to_string(&self.config_path)?;
        let config: UploaderConfig = toml::from_str(&contents)?;
        Ok(config.prometheus_port.unwrap_or(9100))
    }

    /// One scrape. On failure the previous state is kept untouched.
    pub async fn scrape(&mut self) -> Result<(), ZstorError> {
        let port = self.prometheus_port()?;
        let url = format!("http://127.0.0.1:{}/metrics", port);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ZstorError::ScrapeStatus(response.status().as_u16()));
        }
        let body = response.text().await?;

        self.ingest(&body);
        self.last_scrape_time.set(unix_now() as f64);
        Ok(())
    }

    fn ingest(&mut self, body: &str) {
        for line in body.lines() {
            let (labels, value) = match parse_connection_status(line) {
                Some(sample) => sample,
                None => continue,
            };

            let address = labels.get("address").cloned().unwrap_or_default();
            let backend_type = labels.get("backend_type").cloned().unwrap_or_default();
            let namespace = labels.get("namespace").cloned().unwrap_or_default();
            let key = backend_key(&address, &backend_type, &namespace);

            let status = self.statuses.entry(key).or_insert_with(|| BackendStatus {
                address: address.clone(),
                backend_type: backend_type.clone(),
                namespace: namespace.clone(),
                is_alive: false,
                last_seen: SystemTime::now(),
            });
            status.is_alive = value == 1.0;
            status.last_seen = SystemTime::now();
        }

        for status in self.statuses.values() {
            self.status_gauge
                .with_label_values(&[&status.address, &status.backend_type, &status.namespace])
                .set(if status.is_alive { 1.0 } else { 0.0 });
        }
    }

    pub fn statuses(&self) -> &HashMap<String, BackendStatus> {
        &self.statuses
    }

    /// Owned copy for handing across a channel.
    pub fn snapshot(&self) -> HashMap<String, BackendStatus> {
        self.statuses.clone()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Pick apart one `connection_status{...} <value>` sample line.
fn parse_connection_status(line: &str) -> Option<(HashMap<String, String>, f64)> {
    let rest = line.strip_prefix("connection_status{")?;
    let end = rest.find('}')?;
    let labels = parse_labels(&rest[..end]);
    let value = match rest[end + 1..].trim().parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            debug!(line = %line, "Skipping unparseable connection_status sample");
            return None;
        }
    };
    Some((labels, value))
}

/// Quote-aware label parser. Addresses are bracketed IPv6 with colons and
/// namespaces may hold arbitrary deployment names, so splitting on commas
/// alone is not enough.
fn parse_labels(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut chars = raw.chars();

    'outer: loop {
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(',') | Some(' ') if key.is_empty() => continue,
                Some(c) => key.push(c),
                None => break 'outer,
            }
        }
        if chars.next() != Some('"') {
            break;
        }
        let mut value = String::new();
        loop {
            match chars.next() {
                Some('\\') => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(c) => value.push(c),
                    None => break 'outer,
                },
                Some('"') => break,
                Some(c) => value.push(c),
                None => break 'outer,
            }
        }
        labels.insert(key, value);
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LINE: &str = r#"connection_status{address="[45b:7cd9:4930:2763:3e54:4b4f:905b:dd16]:9900",backend_type="data",namespace="5545-1386679-qsfs_5545_data_921"} 1"#;

    fn scraper_with(dir: &tempfile::TempDir, toml: &str) -> MetricsScraper {
        let config = dir.path().join("zstor.toml");
        std::fs::write(&config, toml).unwrap();
        MetricsScraper::new(config, &Registry::new()).unwrap()
    }

    #[test]
    fn test_parse_sample_line() {
        let (labels, value) = parse_connection_status(SAMPLE_LINE).unwrap();
        assert_eq!(value, 1.0);
        assert_eq!(
            labels["address"],
            "[45b:7cd9:4930:2763:3e54:4b4f:905b:dd16]:9900"
        );
        assert_eq!(labels["backend_type"], "data");
        assert_eq!(labels["namespace"], "5545-1386679-qsfs_5545_data_921");
    }

    #[test]
    fn test_parse_ignores_other_families() {
        assert!(parse_connection_status("# HELP connection_status ...").is_none());
        assert!(parse_connection_status("store_duration_seconds 0.5").is_none());
        assert!(parse_connection_status("connection_status_total{a=\"b\"} 1").is_none());
    }

    #[test]
    fn test_parse_labels_with_escapes() {
        let labels = parse_labels(r#"address="10.0.0.1:9900",namespace="with\"quote,comma""#);
        assert_eq!(labels["address"], "10.0.0.1:9900");
        assert_eq!(labels["namespace"], "with\"quote,comma");
    }

    #[test]
    fn test_port_from_config_with_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let scraper = scraper_with(&dir, "prometheus_port = 9200\nroot = \"/x\"\n");
        assert_eq!(scraper.prometheus_port().unwrap(), 9200);

        let scraper = scraper_with(&dir, "root = \"/x\"\n");
        assert_eq!(scraper.prometheus_port().unwrap(), 9100);
    }

    #[test]
    fn test_ingest_updates_and_retains() {
        let dir = tempfile::tempdir().unwrap();
        let mut scraper = scraper_with(&dir, "");

        scraper.ingest(
            "connection_status{address=\"a:9900\",backend_type=\"data\",namespace=\"ns\"} 1\n\
             connection_status{address=\"b:9900\",backend_type=\"data\",namespace=\"ns\"} 0\n",
        );
        assert_eq!(scraper.statuses().len(), 2);
        assert!(scraper.statuses()[&backend_key("a:9900", "data", "ns")].is_alive);
        assert!(!scraper.statuses()[&backend_key("b:9900", "data", "ns")].is_alive);

        // b disappears from the next scrape: retained, not deleted.
        scraper.ingest(
            "connection_status{address=\"a:9900\",backend_type=\"data\",namespace=\"ns\"} 0\n",
        );
        assert_eq!(scraper.statuses().len(), 2);
        assert!(!scraper.statuses()[&backend_key("a:9900", "data", "ns")].is_alive);
        assert!(!scraper.statuses()[&backend_key("b:9900", "data", "ns")].is_alive);
    }

    #[test]
    fn test_non_one_values_are_dead() {
        let dir = tempfile::tempdir().unwrap();
        let mut scraper = scraper_with(&dir, "");
        scraper.ingest(
            "connection_status{address=\"a\",backend_type=\"data\",namespace=\"n\"} 2\n",
        );
        assert!(!scraper.statuses()[&backend_key("a", "data", "n")].is_alive);
    }

    #[tokio::test]
    async fn test_scrape_against_local_endpoint() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let body = "connection_status{address=\"a\",backend_type=\"data\",namespace=\"n\"} 1\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: text/plain\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let mut scraper = scraper_with(&dir, &format!("prometheus_port = {}\n", port));
        scraper.scrape().await.unwrap();
        assert!(scraper.statuses()[&backend_key("a", "data", "n")].is_alive);
    }

    #[test]
    fn test_scrape_failure_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut scraper = scraper_with(&dir, "");
        scraper.ingest(
            "connection_status{address=\"a\",backend_type=\"data\",namespace=\"n\"} 1\n",
        );

        // Unreadable config: the scrape errors before touching anything.
        std::fs::remove_file(dir.path().join("zstor.toml")).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(rt.block_on(scraper.scrape()).is_err());
        assert!(scraper.statuses()[&backend_key("a", "data", "n")].is_alive);
    }
}
