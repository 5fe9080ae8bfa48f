use std::time::Duration;

use log::debug;
use mac_address::MacAddress;
use reqwest::StatusCode;
use serde_derive::Deserialize;
use thiserror::Error;
use url::Url;

use crate::device::{DeviceRecord, Role, decode_roster};
use crate::messages::Numeric;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("device answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error("{field} is not a number: {value:?}")]
    NotNumeric { field: &'static str, value: String },
}

/// Parsed body of `GET /preferences`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    pub saved: Vec<DeviceRecord>,
    pub discovered: Vec<DeviceRecord>,
    pub self_role: Option<Role>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    #[serde(rename = "selfMac")]
    pub self_mac: String,
    #[serde(rename = "selfRole", default)]
    pub self_role: Role,
    pub firmware_hash: Option<String>,
    pub filesystem_hash: Option<String>,
}

impl DeviceInfo {
    pub fn version(&self) -> String {
        fn short(hash: Option<&String>) -> &str {
            match hash {
                Some(h) if !h.is_empty() => h.get(..8).unwrap_or(h.as_str()),
                _ => "unknown",
            }
        }
        format!(
            "FW: {} | FS: {}",
            short(self.firmware_hash.as_ref()),
            short(self.filesystem_hash.as_ref())
        )
    }
}

#[derive(Deserialize, Debug)]
struct LastTimeBody {
    #[serde(rename = "lastTime")]
    last_time: Numeric,
}

#[derive(Deserialize, Debug)]
struct RunCountBody {
    count: Numeric,
}

fn numeric(field: &'static str, value: Numeric) -> Result<u64, ApiError> {
    value.value().ok_or_else(|| ApiError::NotNumeric {
        field,
        value: format!("{value:?}"),
    })
}

/// Each roster line is decoded on its own; a broken or missing line leaves
/// only that roster empty.
pub fn parse_preferences(body: &str) -> Preferences {
    fn roster(body: &str, prefix: &str) -> Vec<DeviceRecord> {
        let Some(line) = body.lines().find(|l| l.starts_with(prefix)) else {
            debug!("Preferences carry no {prefix:?} line");
            return Vec::new();
        };
        decode_roster(&line[prefix.len()..]).unwrap_or_else(|err| {
            debug!("Ignoring malformed {prefix:?} line: {err}");
            Vec::new()
        })
    }

    let self_role = body
        .lines()
        .find_map(|l| l.strip_prefix("R: "))
        .map(|role| Role::from(role.trim().to_string()));

    Preferences {
        saved: roster(body, "S: "),
        discovered: roster(body, "D: "),
        self_role,
    }
}

/// HTTP side of the device: snapshots, edits and discovery.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    /// Every request gives up after `timeout`, so a hung device can't hold
    /// an edit lock forever.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ApiClient { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }

    async fn expect_success(resp: reqwest::Response) -> Result<String, ApiError> {
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(ApiError::Status { status, body })
        }
    }

    pub async fn fetch_preferences(&self) -> Result<Preferences, ApiError> {
        let resp = self.http.get(self.endpoint("/preferences")?).send().await?;
        let body = Self::expect_success(resp).await?;
        Ok(parse_preferences(&body))
    }

    pub async fn fetch_device_info(&self) -> Result<DeviceInfo, ApiError> {
        let resp = self
            .http
            .get(self.endpoint("/api/device_info")?)
            .send()
            .await?;
        let body = Self::expect_success(resp).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn fetch_last_time(&self) -> Result<u64, ApiError> {
        let resp = self
            .http
            .get(self.endpoint("/api/last_time")?)
            .send()
            .await?;
        let body = Self::expect_success(resp).await?;
        let body: LastTimeBody = serde_json::from_str(&body)?;
        numeric("lastTime", body.last_time)
    }

    pub async fn fetch_run_count(&self) -> Result<u64, ApiError> {
        let resp = self
            .http
            .get(self.endpoint("/api/lauf_count")?)
            .send()
            .await?;
        let body = Self::expect_success(resp).await?;
        let body: RunCountBody = serde_json::from_str(&body)?;
        numeric("count", body.count)
    }

    pub async fn submit_device_role(&self, mac: MacAddress, role: Role) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.endpoint("/change_device")?)
            .form(&[("mac", mac.to_string()), ("role", role.to_string())])
            .send()
            .await?;
        let body = Self::expect_success(resp).await?;
        debug!("change_device for {mac}: {body}");
        Ok(())
    }

    pub async fn submit_self_role(&self, role: Role) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.endpoint("/config")?)
            .form(&[("role", role.to_string())])
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    pub async fn trigger_discovery(&self) -> Result<(), ApiError> {
        let resp = self.http.post(self.endpoint("/discover")?).send().await?;
        Self::expect_success(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_preferences() {
        let body = "S: [{\"mac\":\"AA:BB:CC:DD:EE:FF\",\"role\":\"Ziel\"}]\nD: [{\"mac\":\"11:22:33:44:55:66\",\"role\":\"-\"}]\nR: Start";
        let prefs = parse_preferences(body);
        assert_eq!(prefs.saved.len(), 1);
        assert_eq!(prefs.saved[0].role, Role::Finish);
        assert_eq!(prefs.discovered.len(), 1);
        assert_eq!(prefs.self_role, Some(Role::Start));
    }

    #[test]
    fn test_malformed_line_only_empties_its_roster() {
        let body = "S: [{\"mac\":\nD: [{\"mac\":\"11:22:33:44:55:66\",\"role\":\"Start\"}]";
        let prefs = parse_preferences(body);
        assert!(prefs.saved.is_empty());
        assert_eq!(prefs.discovered.len(), 1);
        assert_eq!(prefs.self_role, None);

        let prefs = parse_preferences("S: []");
        assert!(prefs.saved.is_empty());
        assert!(prefs.discovered.is_empty());
        assert_eq!(parse_preferences(""), Preferences::default());
    }

    #[test]
    fn test_device_info_version() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"selfMac":"00:00:00:00:00:01","selfRole":"Start","firmware_hash":"0123456789abcdef"}"#,
        )
        .unwrap();
        assert_eq!(info.self_role, Role::Start);
        assert_eq!(info.version(), "FW: 01234567 | FS: unknown");
    }

    fn client(base: Url) -> ApiClient {
        ApiClient::new(base, Duration::from_secs(5)).unwrap()
    }

    async fn one_shot_server(response: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn test_non_success_is_an_error() {
        let base = one_shot_server(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
        )
        .await;
        let client = client(base);
        let mac = crate::device::parse_mac("AA:BB:CC:DD:EE:FF").unwrap();
        match client.submit_device_role(mac, Role::Finish).await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "nope");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_preferences() {
        let base = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nR: Ziel",
        )
        .await;
        let prefs = client(base).fetch_preferences().await.unwrap();
        assert_eq!(prefs.self_role, Some(Role::Finish));
        assert!(prefs.saved.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_run_display() {
        let base = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\nConnection: close\r\n\r\n{\"lastTime\":5042}",
        )
        .await;
        assert_eq!(client(base).fetch_last_time().await.unwrap(), 5042);

        let base = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\nConnection: close\r\n\r\n{\"count\":\"3\"}",
        )
        .await;
        assert_eq!(client(base).fetch_run_count().await.unwrap(), 3);

        let base = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 16\r\nConnection: close\r\n\r\n{\"count\":\"many\"}",
        )
        .await;
        assert!(matches!(
            client(base).fetch_run_count().await,
            Err(ApiError::NotNumeric { field: "count", .. })
        ));
    }

    #[tokio::test]
    async fn test_hung_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            // Never answer.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        let client = ApiClient::new(base, Duration::from_millis(100)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), client.submit_self_role(Role::Start))
            .await
            .expect("request should have timed out on its own");
        match result {
            Err(ApiError::Transport(err)) => assert!(err.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
