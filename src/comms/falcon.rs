//! HTTP client for the Falcon streaming and host APIs.
//!
//! One `FalconClient` serves the whole process: it owns the OAuth2 token
//! (refreshed a minute before expiry) and two `reqwest` clients, one with a
//! request timeout for ordinary API calls and one without for the long-lived
//! data feeds.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::comms::api::{
    ApiError, DeviceDirectory, DeviceRecord, FeedBody, Partition, StreamDescriptor, StreamingApi,
};
use crate::config::model::FalconConfig;

/// Region name → API host.
pub const CLOUD_REGIONS: &[(&str, &str)] = &[
    ("us-1", "api.crowdstrike.com"),
    ("us-2", "api.us-2.crowdstrike.com"),
    ("eu-1", "api.eu-1.crowdstrike.com"),
    ("us-gov-1", "api.laggar.gcw.crowdstrike.com"),
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TOKEN_MARGIN: Duration = Duration::from_secs(60);
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

/// `https://<host>` for a configured region, if the region is known.
pub fn base_url(region: &str) -> Option<String> {
    CLOUD_REGIONS
        .iter()
        .find(|(name, _)| *name == region)
        .map(|(_, host)| format!("https://{host}"))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Resources<T> {
    #[serde(default)]
    resources: Option<Vec<T>>,
}

pub struct FalconClient {
    http: reqwest::Client,
    feed_http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    app_id: String,
    token: Mutex<Option<CachedToken>>,
}

impl FalconClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let user_agent = concat!("detection-gateway/", env!("CARGO_PKG_VERSION"));
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let feed_http = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            feed_http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            app_id: app_id.into(),
            token: Mutex::new(None),
        })
    }

    /// Build a client for the region and credentials in `cfg`.
    pub fn from_config(cfg: &FalconConfig) -> Result<Self, ApiError> {
        let base = base_url(&cfg.cloud_region).ok_or_else(|| ApiError::Malformed {
            context: "configuration",
            detail: format!("unknown cloud region '{}'", cfg.cloud_region),
        })?;
        Self::new(base, &cfg.client_id, &cfg.client_secret, &cfg.application_id)
    }

    async fn access_token(&self) -> Result<String, ApiError> {
        let mut slot = self.token.lock().await;
        if let Some(tok) = slot.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(tok.value.clone());
        }

        log::debug!("requesting OAuth2 token from {}", self.base_url);
        let resp = self
            .http
            .post(format!("{}/oauth2/token", self.base_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        let resp = check_status("oauth2 token", resp).await?;
        let body: TokenResponse = resp.json().await?;

        let lifetime = Duration::from_secs(body.expires_in).saturating_sub(TOKEN_MARGIN);
        *slot = Some(CachedToken {
            value: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(body.access_token)
    }

    /// Send an authenticated API request, waiting out rate limiting a few
    /// times before giving up. A 401 drops the cached token and retries once.
    async fn send_api<F>(&self, context: &'static str, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        let mut reauthenticated = false;
        loop {
            let token = self.access_token().await?;
            let resp = build(&self.http).bearer_auth(token).send().await?;
            if resp.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                reauthenticated = true;
                log::warn!("{context} rejected the cached OAuth2 token, requesting a new one");
                self.token.lock().await.take();
                continue;
            }
            if resp.status() == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                attempt += 1;
                let wait = retry_after(resp.headers());
                log::warn!("{context} rate limited, retrying in {wait:?} (attempt {attempt})");
                tokio::time::sleep(wait).await;
                continue;
            }
            return check_status(context, resp).await;
        }
    }

    async fn get_resources<T: DeserializeOwned>(
        &self,
        context: &'static str,
        build: impl Fn(&reqwest::Client) -> RequestBuilder,
    ) -> Result<Vec<T>, ApiError> {
        let resp = self.send_api(context, build).await?;
        let body: Resources<T> = resp.json().await?;
        Ok(body.resources.unwrap_or_default())
    }
}

async fn check_status(context: &'static str, resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        context,
        status: status.as_u16(),
        body,
    })
}

/// Wait advertised by a 429 response. The vendor sends an absolute epoch
/// second in `X-RateLimit-RetryAfter`; plain `Retry-After` is seconds.
fn retry_after(headers: &header::HeaderMap) -> Duration {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    let secs = if let Some(at) = read("X-RateLimit-RetryAfter") {
        at - chrono::Utc::now().timestamp()
    } else {
        read("Retry-After").unwrap_or(1)
    };
    Duration::from_secs(secs.max(1) as u64).min(MAX_RATE_LIMIT_WAIT)
}

#[async_trait]
impl StreamingApi for FalconClient {
    async fn list_streams(&self) -> Result<Vec<Partition>, ApiError> {
        let url = format!("{}/sensors/entities/datafeed/v2", self.base_url);
        let descriptors: Vec<StreamDescriptor> = self
            .get_resources("stream discovery", |http| {
                http.get(&url)
                    .query(&[("appId", self.app_id.as_str()), ("format", "json")])
            })
            .await?;
        if descriptors.is_empty() {
            return Err(ApiError::NoStreams(self.app_id.clone()));
        }
        descriptors.into_iter().map(Partition::try_from).collect()
    }

    async fn refresh_stream(&self, partition: &Partition) -> Result<(), ApiError> {
        self.send_api("stream refresh", |http| {
            http.post(&partition.refresh_url)
                .header(header::CONTENT_TYPE, "application/json")
                .body("{}")
        })
        .await?;
        log::debug!("refreshed session for partition {}", partition.feed_id);
        Ok(())
    }

    async fn open_feed(&self, partition: &Partition, offset: u64) -> Result<FeedBody, ApiError> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S +0000")
            .to_string();
        let resp = self
            .feed_http
            .get(&partition.data_feed_url)
            .query(&[("offset", offset)])
            .header(header::AUTHORIZATION, format!("Token {}", partition.token))
            .header(header::DATE, date)
            .header(header::CONNECTION, "Keep-Alive")
            .send()
            .await?;
        let resp = check_status("data feed", resp).await?;
        Ok(Box::pin(resp.bytes_stream().map_err(ApiError::from)))
    }
}

#[async_trait]
impl DeviceDirectory for FalconClient {
    async fn device_details(&self, sensor_id: &str) -> Result<Vec<DeviceRecord>, ApiError> {
        let url = format!("{}/devices/entities/devices/v2", self.base_url);
        self.get_resources("device details", |http| {
            http.get(&url).query(&[("ids", sensor_id)])
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::FeedId;
    use futures::StreamExt;
    use reqwest::header::{HeaderMap, HeaderValue};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const DEVICES: &str = "/devices/entities/devices/v2";
    const TOKEN: &str = "/oauth2/token";

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        target: String,
        headers: HashMap<String, String>,
        body: String,
    }

    impl Recorded {
        fn path(&self) -> &str {
            self.target.split('?').next().unwrap_or_default()
        }

        fn header(&self, name: &str) -> &str {
            self.headers.get(name).map(String::as_str).unwrap_or_default()
        }
    }

    struct Reply {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    }

    fn reply(status: u16, body: Value) -> Reply {
        Reply {
            status,
            headers: vec![("Content-Type", "application/json".into())],
            body: body.to_string(),
        }
    }

    fn token_reply(n: usize, expires_in: u64) -> Reply {
        reply(200, json!({"access_token": format!("tok-{n}"), "expires_in": expires_in, "token_type": "bearer"}))
    }

    type Log = Arc<StdMutex<Vec<Recorded>>>;

    fn requests(log: &Log, path: &str) -> Vec<Recorded> {
        log.lock().unwrap().iter().filter(|r| r.path() == path).cloned().collect()
    }

    async fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break i;
            }
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next()?.split(' ');
        let method = request_line.next()?.to_owned();
        let target = request_line.next()?.to_owned();
        let headers: HashMap<String, String> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_owned()))
            .collect();
        let length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = buf[header_end + 4..].to_vec();
        while body.len() < length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Some(Recorded {
            method,
            target,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// HTTP/1.1 vendor stand-in on 127.0.0.1, one request per connection.
    /// The handler also gets the server's base URL.
    async fn serve<F>(handler: F) -> (String, Log)
    where
        F: Fn(&Recorded, &str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let log: Log = Arc::default();
        let handler = Arc::new(handler);

        let (server_base, server_log) = (base.clone(), Arc::clone(&log));
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let (base, log, handler) =
                    (server_base.clone(), Arc::clone(&server_log), Arc::clone(&handler));
                tokio::spawn(async move {
                    let Some(req) = read_request(&mut stream).await else {
                        return;
                    };
                    let reply = (*handler)(&req, &base);
                    log.lock().unwrap().push(req);

                    let mut head = format!(
                        "HTTP/1.1 {} Fake\r\nContent-Length: {}\r\nConnection: close\r\n",
                        reply.status,
                        reply.body.len()
                    );
                    for (name, value) in &reply.headers {
                        head.push_str(&format!("{name}: {value}\r\n"));
                    }
                    head.push_str("\r\n");
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(reply.body.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (base, log)
    }

    fn client(base: &str) -> FalconClient {
        FalconClient::new(base, "id", "secret", "fig").unwrap()
    }

    fn device_reply() -> Reply {
        reply(200, json!({"resources": [{"device_id": "s1", "service_provider": "GCP"}]}))
    }

    #[tokio::test]
    async fn token_is_reused_across_calls() {
        let issued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&issued);
        let (base, log) = serve(move |req: &Recorded, _: &str| match req.path() {
            TOKEN => token_reply(counter.fetch_add(1, Ordering::SeqCst) + 1, 1799),
            _ => device_reply(),
        })
        .await;
        let falcon = client(&base);

        let first = falcon.device_details("s1").await.unwrap();
        falcon.device_details("s2").await.unwrap();
        assert_eq!(first[0].service_provider.as_deref(), Some("GCP"));

        let tokens = requests(&log, TOKEN);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].method, "POST");
        assert!(tokens[0].body.contains("client_id=id"));
        assert!(tokens[0].body.contains("client_secret=secret"));

        let lookups = requests(&log, DEVICES);
        assert_eq!(lookups[0].target, "/devices/entities/devices/v2?ids=s1");
        assert_eq!(lookups[1].target, "/devices/entities/devices/v2?ids=s2");
        assert_eq!(lookups[1].header("authorization"), "Bearer tok-1");
    }

    #[tokio::test]
    async fn token_inside_the_expiry_margin_is_refetched() {
        let issued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&issued);
        let (base, log) = serve(move |req: &Recorded, _: &str| match req.path() {
            // Shorter than the one minute margin: never reusable.
            TOKEN => token_reply(counter.fetch_add(1, Ordering::SeqCst) + 1, 30),
            _ => device_reply(),
        })
        .await;
        let falcon = client(&base);

        falcon.device_details("s1").await.unwrap();
        falcon.device_details("s1").await.unwrap();

        assert_eq!(requests(&log, TOKEN).len(), 2);
        assert_eq!(requests(&log, DEVICES)[1].header("authorization"), "Bearer tok-2");
    }

    #[tokio::test]
    async fn unauthorized_response_renews_the_token_once() {
        let issued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&issued);
        let (base, log) = serve(move |req: &Recorded, _: &str| match req.path() {
            TOKEN => token_reply(counter.fetch_add(1, Ordering::SeqCst) + 1, 1799),
            // The first token was revoked server-side.
            _ if req.header("authorization") == "Bearer tok-1" => reply(401, json!({})),
            _ => device_reply(),
        })
        .await;
        let falcon = client(&base);

        falcon.device_details("s1").await.unwrap();
        falcon.device_details("s1").await.unwrap();
        assert_eq!(requests(&log, TOKEN).len(), 2);
        assert_eq!(requests(&log, DEVICES).len(), 3);
    }

    #[tokio::test]
    async fn persistent_unauthorized_is_an_error() {
        let (base, log) = serve(|req: &Recorded, _: &str| match req.path() {
            TOKEN => token_reply(1, 1799),
            _ => reply(401, json!({"errors": ["access denied"]})),
        })
        .await;

        let result = client(&base).device_details("s1").await;
        assert!(matches!(result, Err(ApiError::Status { status: 401, .. })));
        assert_eq!(requests(&log, TOKEN).len(), 2);
        assert_eq!(requests(&log, DEVICES).len(), 2);
    }

    fn rate_limited() -> Reply {
        Reply {
            status: 429,
            headers: vec![("Retry-After", "1".into())],
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn rate_limiting_is_waited_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (base, log) = serve(move |req: &Recorded, _: &str| match req.path() {
            TOKEN => token_reply(1, 1799),
            _ if counter.fetch_add(1, Ordering::SeqCst) < 3 => rate_limited(),
            _ => device_reply(),
        })
        .await;

        assert!(client(&base).device_details("s1").await.is_ok());
        assert_eq!(requests(&log, DEVICES).len(), 4);
        assert_eq!(requests(&log, TOKEN).len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_retries_are_bounded() {
        let (base, log) = serve(|req: &Recorded, _: &str| match req.path() {
            TOKEN => token_reply(1, 1799),
            _ => rate_limited(),
        })
        .await;

        let result = client(&base).device_details("s1").await;
        assert!(matches!(result, Err(ApiError::Status { status: 429, .. })));
        assert_eq!(requests(&log, DEVICES).len(), 1 + MAX_RATE_LIMIT_RETRIES as usize);
    }

    #[tokio::test]
    async fn discovery_without_resources_is_no_streams() {
        for body in [json!({"resources": []}), json!({}), json!({"resources": null})] {
            let (base, _) = serve(move |req: &Recorded, _: &str| match req.path() {
                TOKEN => token_reply(1, 1799),
                _ => reply(200, body.clone()),
            })
            .await;
            let result = client(&base).list_streams().await;
            assert!(matches!(result, Err(ApiError::NoStreams(ref app)) if app == "fig"));
        }
    }

    #[tokio::test]
    async fn discovery_refresh_and_feed_requests() {
        let (base, log) = serve(|req: &Recorded, base: &str| match req.path() {
            TOKEN => token_reply(1, 1799),
            "/sensors/entities/datafeed/v2" => reply(
                200,
                json!({"resources": [{
                    "dataFeedURL": format!("{base}/sensors/entities/datafeed/v1/0?appId=fig"),
                    "sessionToken": {"token": "feed-token"},
                    "refreshActiveSessionURL": format!(
                        "{base}/sensors/entities/datafeed-actions/v1/0?appId=fig&action_name=refresh_active_stream_session"
                    ),
                    "refreshActiveSessionInterval": 1800
                }]}),
            ),
            "/sensors/entities/datafeed/v1/0" => Reply {
                status: 200,
                headers: Vec::new(),
                body: "{\"a\":1}\n\n".into(),
            },
            _ => reply(200, json!({})),
        })
        .await;
        let falcon = client(&base);

        let partitions = falcon.list_streams().await.unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].feed_id, FeedId::new("0"));
        assert_eq!(partitions[0].refresh_interval, Duration::from_secs(1800));

        falcon.refresh_stream(&partitions[0]).await.unwrap();

        let mut body = falcon.open_feed(&partitions[0], 7).await.unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = body.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, b"{\"a\":1}\n\n");

        let discovery = &requests(&log, "/sensors/entities/datafeed/v2")[0];
        assert_eq!(discovery.target, "/sensors/entities/datafeed/v2?appId=fig&format=json");
        assert_eq!(discovery.header("authorization"), "Bearer tok-1");

        let refresh = &requests(&log, "/sensors/entities/datafeed-actions/v1/0")[0];
        assert_eq!(refresh.method, "POST");
        assert_eq!(refresh.header("authorization"), "Bearer tok-1");

        let feed = &requests(&log, "/sensors/entities/datafeed/v1/0")[0];
        assert_eq!(feed.target, "/sensors/entities/datafeed/v1/0?appId=fig&offset=7");
        assert_eq!(feed.header("authorization"), "Token feed-token");
        // The feed uses the session token, not the OAuth2 token.
        assert_eq!(requests(&log, TOKEN).len(), 1);
    }

    #[test]
    fn known_regions_resolve() {
        assert_eq!(base_url("eu-1").as_deref(), Some("https://api.eu-1.crowdstrike.com"));
        assert_eq!(base_url("mars-1"), None);
    }

    #[test]
    fn retry_after_is_bounded() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), Duration::from_secs(1));

        headers.insert("Retry-After", HeaderValue::from_static("5"));
        assert_eq!(retry_after(&headers), Duration::from_secs(5));

        headers.insert("Retry-After", HeaderValue::from_static("3600"));
        assert_eq!(retry_after(&headers), MAX_RATE_LIMIT_WAIT);
    }
}
