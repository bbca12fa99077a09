use std::time::Duration;

use async_trait::async_trait;
use config::InfluxWriterConfig;
use reqwest::{Client, StatusCode};
use stream::Reading;

use crate::encode::encode_line_protocol;
use crate::{WriteError, WriteTarget};

/// Writes batches as InfluxDB line protocol over the v2 HTTP write API.
/// A 2xx response is success; 4xx is classified `Permanent` (the payload
/// itself is rejected and a retry cannot help); everything else —
/// including 5xx and transport-level failures — is `Transient`.
pub struct InfluxTarget {
    client: Client,
    config: InfluxWriterConfig,
    write_url: String,
    health_url: String,
}

impl InfluxTarget {
    /// Builds a target from its configuration. The request timeout is
    /// independent of the device poll timeout: writer I/O runs on its own
    /// schedule.
    pub fn new(config: InfluxWriterConfig, request_timeout: Duration) -> Result<Self, WriteError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| WriteError::Transient {
                message: format!("failed to build HTTP client: {err}"),
            })?;

        let write_url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            config.url.trim_end_matches('/'),
            urlencode(&config.org),
            urlencode(&config.bucket),
        );
        let health_url = format!("{}/health", config.url.trim_end_matches('/'));

        Ok(Self {
            client,
            config,
            write_url,
            health_url,
        })
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl InfluxTarget {
    async fn post(&self, body: Vec<u8>) -> Result<(), WriteError> {
        let response = self
            .client
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|err| WriteError::Transient {
                message: format!("influxdb write request failed: {err}"),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(WriteError::Permanent {
                message: format!("influxdb rejected batch with {status}: {body}"),
            })
        } else {
            Err(WriteError::Transient {
                message: format!("influxdb returned {status}: {body}"),
            })
        }
    }
}

#[async_trait]
impl WriteTarget for InfluxTarget {
    async fn write_batch(&self, readings: &[Reading]) -> Result<(), WriteError> {
        let batch = encode_line_protocol(readings, &self.config.measurement);
        self.post(batch.body.into_bytes()).await
    }

    async fn probe_health(&self) -> bool {
        matches!(
            self.client.get(&self.health_url).send().await,
            Ok(response) if response.status() == StatusCode::OK
        )
    }

    fn encode_for_dlq(&self, readings: &[Reading]) -> Vec<u8> {
        encode_line_protocol(readings, &self.config.measurement).body.into_bytes()
    }

    async fn replay_raw(&self, payload: &[u8]) -> Result<(), WriteError> {
        self.post(payload.to_vec()).await
    }

    fn name(&self) -> &'static str {
        "influxdb"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> InfluxWriterConfig {
        InfluxWriterConfig {
            url: "https://influx.example.com".to_string(),
            token: "secret".to_string(),
            org: "plant a".to_string(),
            bucket: "counters".to_string(),
            measurement: "counter_data".to_string(),
        }
    }

    #[test]
    fn write_url_encodes_org_and_bucket() {
        let target = InfluxTarget::new(config(), Duration::from_secs(5)).expect("client builds");
        assert!(target.write_url.contains("org=plant%20a"));
        assert!(target.write_url.contains("bucket=counters"));
        assert!(target.write_url.contains("precision=ns"));
    }

    #[test]
    fn name_identifies_the_target() {
        let target = InfluxTarget::new(config(), Duration::from_secs(5)).expect("client builds");
        assert_eq!(target.name(), "influxdb");
    }
}
