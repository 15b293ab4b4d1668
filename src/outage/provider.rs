//! Outage schedule sources

use super::OutageWindow;
use super::parse::{lvivoblenergo_today_html, parse_group_windows, yasno_windows};
use crate::config::{OutageConfig, OutageProvider};
use crate::error::{PowerwatchError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;

/// Where today's outage windows come from
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    fn name(&self) -> &str;

    /// Raw schedule document. Network failures are `Unreachable`.
    async fn fetch_document(&self) -> Result<String>;

    /// Windows for the configured group on `date`. Malformed documents are
    /// `Parse` errors; a document without the group yields no windows.
    fn parse_windows(&self, document: &str, date: NaiveDate) -> Result<Vec<OutageWindow>>;
}

/// Plain GET with a request timeout
struct HttpFetcher {
    url: String,
    #[cfg(feature = "outage-http")]
    client: reqwest::Client,
}

impl HttpFetcher {
    fn new(url: String, timeout: Duration) -> Result<Self> {
        #[cfg(feature = "outage-http")]
        {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("powerwatch/", env!("CARGO_PKG_VERSION")))
                .build()?;
            Ok(Self { url, client })
        }
        #[cfg(not(feature = "outage-http"))]
        {
            let _ = timeout;
            Ok(Self { url })
        }
    }

    async fn get(&self) -> Result<String> {
        #[cfg(feature = "outage-http")]
        {
            let resp = self.client.get(&self.url).send().await?;
            if !resp.status().is_success() {
                return Err(PowerwatchError::unreachable(format!(
                    "{} returned {}",
                    self.url,
                    resp.status()
                )));
            }
            Ok(resp.text().await?)
        }
        #[cfg(not(feature = "outage-http"))]
        {
            Err(PowerwatchError::unreachable(format!(
                "Cannot fetch {}: built without outage-http",
                self.url
            )))
        }
    }
}

/// Lvivoblenergo (LOE) menu API
pub struct LvivoblenergoSource {
    group: String,
    http: HttpFetcher,
}

impl LvivoblenergoSource {
    pub fn new(url: &str, group: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            group: group.to_string(),
            http: HttpFetcher::new(url.to_string(), timeout)?,
        })
    }
}

#[async_trait]
impl ScheduleSource for LvivoblenergoSource {
    fn name(&self) -> &str {
        "lvivoblenergo"
    }

    async fn fetch_document(&self) -> Result<String> {
        self.http.get().await
    }

    fn parse_windows(&self, document: &str, date: NaiveDate) -> Result<Vec<OutageWindow>> {
        match lvivoblenergo_today_html(document)? {
            Some(html) => parse_group_windows(&html, &self.group, date),
            None => Ok(Vec::new()),
        }
    }
}

/// YASNO planned outages for one region and DSO
pub struct YasnoSource {
    group: String,
    http: HttpFetcher,
}

impl YasnoSource {
    /// `url_template` may hold `{region_id}` and `{dso_id}` placeholders.
    pub fn new(
        url_template: &str,
        group: &str,
        region_id: u32,
        dso_id: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let url = url_template
            .replace("{region_id}", &region_id.to_string())
            .replace("{dso_id}", &dso_id.to_string());
        Ok(Self {
            group: group.to_string(),
            http: HttpFetcher::new(url, timeout)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.http.url
    }
}

#[async_trait]
impl ScheduleSource for YasnoSource {
    fn name(&self) -> &str {
        "yasno"
    }

    async fn fetch_document(&self) -> Result<String> {
        self.http.get().await
    }

    fn parse_windows(&self, document: &str, date: NaiveDate) -> Result<Vec<OutageWindow>> {
        yasno_windows(document, &self.group, date)
    }
}

/// Build the configured source; `None` disables outage polling.
pub fn source_from_config(config: &OutageConfig) -> Result<Option<Arc<dyn ScheduleSource>>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let source: Arc<dyn ScheduleSource> = match config.provider {
        OutageProvider::None => return Ok(None),
        OutageProvider::Lvivoblenergo => Arc::new(LvivoblenergoSource::new(
            &config.lvivoblenergo_url,
            &config.group,
            timeout,
        )?),
        OutageProvider::Yasno => Arc::new(YasnoSource::new(
            &config.yasno_url,
            &config.group,
            config.region_id,
            config.dso_id,
            timeout,
        )?),
    };
    Ok(Some(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yasno_url_template() {
        let source = YasnoSource::new(
            "https://example.invalid/regions/{region_id}/dsos/{dso_id}/planned-outages",
            "2.1",
            25,
            902,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            source.url(),
            "https://example.invalid/regions/25/dsos/902/planned-outages"
        );
    }

    #[test]
    fn test_source_from_config() {
        let mut config = OutageConfig::default();
        config.provider = OutageProvider::None;
        assert!(source_from_config(&config).unwrap().is_none());

        config.provider = OutageProvider::Yasno;
        let source = source_from_config(&config).unwrap().unwrap();
        assert_eq!(source.name(), "yasno");

        config.provider = OutageProvider::Lvivoblenergo;
        let source = source_from_config(&config).unwrap().unwrap();
        assert_eq!(source.name(), "lvivoblenergo");
    }

    #[test]
    fn test_lvivoblenergo_parse_without_today() {
        let source =
            LvivoblenergoSource::new("http://localhost/", "4.1", Duration::from_secs(1)).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let doc = r#"{"hydra:member":[{"menuItems":[{"name":"Tomorrow","rawHtml":""}]}]}"#;
        assert!(source.parse_windows(doc, date).unwrap().is_empty());
    }
}
