use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use serde::Deserialize;
use shared::types::{GeoLocation, PublicNetworkInfo};
use crate::config::PublicNetworkConfig;
use crate::error::PublicNetworkError;

/// Where `get_public_network_info` gets its answer from.
#[async_trait]
pub trait PublicNetworkSource: Send + Sync {
    async fn lookup(&self) -> Result<PublicNetworkInfo, PublicNetworkError>;
}

/// ip-api style JSON lookup plus local resolver and host name.
pub struct HttpPublicNetwork {
    client: reqwest::Client,
    endpoint: String,
    resolv_conf: PathBuf,
}

/// Response body of the lookup endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LookupResponse {
    status: String,
    message: Option<String>,
    query: Option<String>,
    isp: Option<String>,
    org: Option<String>,
    #[serde(rename = "as")]
    asn: Option<String>,
    city: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    country: Option<String>,
    zip: Option<String>,
    timezone: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    proxy: Option<bool>,
    hosting: Option<bool>,
}

impl HttpPublicNetwork {
    pub fn new(config: &PublicNetworkConfig) -> Result<Self, PublicNetworkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            resolv_conf: config.resolv_conf.clone(),
        })
    }
}

#[async_trait]
impl PublicNetworkSource for HttpPublicNetwork {
    async fn lookup(&self) -> Result<PublicNetworkInfo, PublicNetworkError> {
        let response: LookupResponse = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut info = into_info(response)?;
        info.dns = local_dns_servers(&self.resolv_conf).await;
        info.local_hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok());

        tracing::debug!(ip = ?info.ip, "Public network lookup complete");
        Ok(info)
    }
}

fn into_info(response: LookupResponse) -> Result<PublicNetworkInfo, PublicNetworkError> {
    if !response.status.eq_ignore_ascii_case("success") {
        return Err(PublicNetworkError::Lookup {
            status: response.status,
            message: response.message.unwrap_or_else(|| "no message".to_string()),
        });
    }

    let coordinates = response.lat.zip(response.lon);
    let location = GeoLocation {
        city: response.city,
        region: response.region_name,
        country: response.country,
        postal: response.zip.filter(|zip| !zip.is_empty()),
        timezone: response.timezone,
        coordinates,
    };
    let has_location = location != GeoLocation::default();

    Ok(PublicNetworkInfo {
        ip: response.query,
        isp: response.isp,
        org: response.org.filter(|org| !org.is_empty()),
        asn: response.asn.filter(|asn| !asn.is_empty()),
        local_hostname: None,
        dns: Vec::new(),
        location: has_location.then_some(location),
        // The endpoint folds VPN exits into its proxy flag
        is_vpn: response.proxy,
        is_proxy: response.proxy,
        is_hosting: response.hosting,
    })
}

async fn local_dns_servers(path: &Path) -> Vec<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_resolv_conf(&contents),
        Err(e) => {
            tracing::debug!("Could not read {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// `nameserver` entries in file order, without duplicates
fn parse_resolv_conf(contents: &str) -> Vec<String> {
    let mut servers: Vec<String> = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        if let Some(server) = fields.next() {
            if !servers.iter().any(|s| s == server) {
                servers.push(server.to_string());
            }
        }
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_lookup() {
        let body = r#"{
            "status": "success", "query": "203.0.113.7", "isp": "Example ISP",
            "org": "", "as": "AS64500 Example", "city": "Springfield",
            "regionName": "Oregon", "country": "United States", "zip": "97477",
            "timezone": "America/Los_Angeles", "lat": 44.05, "lon": -123.02,
            "proxy": false, "hosting": true
        }"#;
        let response: LookupResponse = serde_json::from_str(body).unwrap();

        let info = into_info(response).unwrap();

        assert_eq!(info.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(info.org, None);
        assert_eq!(info.asn.as_deref(), Some("AS64500 Example"));
        assert_eq!(info.is_hosting, Some(true));
        let location = info.location.unwrap();
        assert_eq!(location.region.as_deref(), Some("Oregon"));
        assert_eq!(location.coordinates, Some((44.05, -123.02)));
    }

    #[test]
    fn test_failed_lookup() {
        let response: LookupResponse =
            serde_json::from_str(r#"{"status":"fail","message":"reserved range"}"#).unwrap();

        match into_info(response) {
            Err(PublicNetworkError::Lookup { status, message }) => {
                assert_eq!(status, "fail");
                assert_eq!(message, "reserved range");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolv_conf() {
        let contents = "# generated\nsearch lan\nnameserver 192.168.1.1\nnameserver fd00::1 \n; nameserver 9.9.9.9\nnameserver 192.168.1.1\n";
        assert_eq!(parse_resolv_conf(contents), vec!["192.168.1.1", "fd00::1"]);
    }

    #[tokio::test]
    async fn test_missing_resolv_conf_is_empty() {
        assert!(local_dns_servers(Path::new("/nonexistent/resolv.conf")).await.is_empty());
    }
}
