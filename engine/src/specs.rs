//! Cryostat pressure and temperature probe used by the pre-fill check
//! gate. The summary API reports flat `<camera>_pressure` /
//! `<camera>_ln2` keys per spectrograph.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, bail};
use futures::future::BoxFuture;

pub trait CryostatProbe: Send + Sync {
    /// Cryostat pressures (Torr) keyed by camera.
    fn pressures<'a>(
        &'a self,
        cameras: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<HashMap<String, f64>>>;

    /// LN2 temperatures (degC) keyed by camera.
    fn temperatures<'a>(
        &'a self,
        cameras: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<HashMap<String, f64>>>;
}

/// Spectrographs covered by a camera set: camera `r2` lives on `sp2`.
fn spectrographs(cameras: &[String]) -> BTreeSet<String> {
    cameras
        .iter()
        .filter_map(|camera| camera.chars().last())
        .filter(char::is_ascii_digit)
        .map(|digit| format!("sp{digit}"))
        .collect()
}

pub struct HttpCryostatProbe {
    client: reqwest::Client,
    api_url: String,
}

impl HttpCryostatProbe {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    async fn summary(&self, cameras: &[String]) -> anyhow::Result<HashMap<String, f64>> {
        let mut merged = HashMap::new();

        for spec in spectrographs(cameras) {
            let url = format!("{}/spectrographs/{spec}/summary", self.api_url);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("summary for {spec}"))?;
            if !response.status().is_success() {
                bail!("summary for {spec} returned {}", response.status());
            }
            let values: HashMap<String, f64> = response
                .json()
                .await
                .with_context(|| format!("parsing summary for {spec}"))?;
            merged.extend(values);
        }

        Ok(merged)
    }

    fn extract(
        summary: &HashMap<String, f64>,
        cameras: &[String],
        suffix: &str,
    ) -> anyhow::Result<HashMap<String, f64>> {
        let mut out = HashMap::new();
        for camera in cameras {
            let key = format!("{camera}_{suffix}");
            match summary.get(&key) {
                Some(value) => {
                    out.insert(camera.clone(), *value);
                }
                None => bail!("summary is missing {key:?}"),
            }
        }
        Ok(out)
    }
}

impl CryostatProbe for HttpCryostatProbe {
    fn pressures<'a>(
        &'a self,
        cameras: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<HashMap<String, f64>>> {
        Box::pin(async move {
            let summary = self.summary(cameras).await?;
            Self::extract(&summary, cameras, "pressure")
        })
    }

    fn temperatures<'a>(
        &'a self,
        cameras: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<HashMap<String, f64>>> {
        Box::pin(async move {
            let summary = self.summary(cameras).await?;
            Self::extract(&summary, cameras, "ln2")
        })
    }
}
