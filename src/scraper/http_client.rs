use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, ORIGIN, REFERER};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{FetchError, RawPage, ReportSource};

/// Redirect hops allowed before a request counts as `TooManyRedirects`.
const MAX_REDIRECTS: usize = 10;

/// Posts the daily-report form for one (date, page).
///
/// No spacing and no retries here: wrap it in
/// [`RateLimited`](super::rate_limit::RateLimited) before handing it out.
pub struct HttpReportSource {
    inner: reqwest::Client,
    endpoint: Url,
    xmlname: String,
}

impl HttpReportSource {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("Invalid report endpoint {:?}", config.endpoint))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        headers.insert(
            ORIGIN,
            HeaderValue::from_str(&config.origin).context("Invalid Origin header")?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&config.referer).context("Invalid Referer header")?,
        );
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            endpoint,
            xmlname: config.xmlname.clone(),
        })
    }

    /// The fixed form; only `V_DATE` and `pageNum` vary.
    fn form(&self, date: &str, page: u32) -> Vec<(&'static str, String)> {
        vec![
            ("V_DATE", date.to_string()),
            ("pageNum", page.to_string()),
            ("orderby", String::new()),
            ("ordertype", String::new()),
            ("xmlname", self.xmlname.clone()),
            ("gisDataJson", String::new()),
            ("queryflag", "close".to_string()),
            ("customquery", "false".to_string()),
            ("isdesignpatterns", "false".to_string()),
            ("roleType", "CFCD2084".to_string()),
            ("permission", "0".to_string()),
            ("AREA", String::new()),
            ("inPageNo", "1".to_string()),
        ]
    }
}

#[async_trait]
impl ReportSource for HttpReportSource {
    async fn fetch(&self, date: &str, page: u32) -> Result<RawPage, FetchError> {
        debug!("POST {} V_DATE={} pageNum={}", self.endpoint, date, page);

        let resp = self
            .inner
            .post(self.endpoint.clone())
            .form(&self.form(date, page))
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let status = resp.status();
        if !status.is_success() {
            warn!("{} page {}: HTTP {}", date, page, status);
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = resp.text().await.map_err(|e| classify(&e))?;
        Ok(RawPage {
            status: status.as_u16(),
            body,
        })
    }
}

/// Map a transport error onto the fetch taxonomy.
fn classify(e: &reqwest::Error) -> FetchError {
    let msg = e.to_string();
    if e.is_timeout() {
        FetchError::Timeout(msg)
    } else if e.is_redirect() {
        FetchError::TooManyRedirects(msg)
    } else if let Some(status) = e.status() {
        FetchError::HttpStatus(status.as_u16())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        FetchError::Network(msg)
    } else {
        FetchError::Other(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_carries_date_and_page() {
        let source = HttpReportSource::new(&ScraperConfig::default()).unwrap();
        let form = source.form("2018-08-01", 7);

        let get = |k: &str| form.iter().find(|(name, _)| *name == k).map(|(_, v)| v.as_str());
        assert_eq!(get("V_DATE"), Some("2018-08-01"));
        assert_eq!(get("pageNum"), Some("7"));
        assert_eq!(get("xmlname"), Some("1512478367400"));
        assert_eq!(get("queryflag"), Some("close"));
        assert_eq!(get("inPageNo"), Some("1"));
        assert_eq!(form.len(), 13);
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let cfg = ScraperConfig {
            endpoint: "not a url".to_string(),
            ..ScraperConfig::default()
        };
        assert!(HttpReportSource::new(&cfg).is_err());
    }

    // ── Canned HTTP server ────────────────────────────────────────────────────

    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::{assert_err, assert_ok};

    /// Serve `response` to every connection after `delay`; returns the endpoint URL.
    async fn serve(response: String, delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let response = response.clone();
                tokio::spawn(async move {
                    read_request(&mut sock).await;
                    tokio::time::sleep(delay).await;
                    let _ = sock.write_all(response.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{}/report", addr)
    }

    /// Consume one request: headers, then `Content-Length` bytes of body.
    async fn read_request(sock: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                return;
            }
        }
    }

    fn source_for(endpoint: String, timeout_secs: u64) -> HttpReportSource {
        let cfg = ScraperConfig {
            endpoint,
            timeout_secs,
            ..ScraperConfig::default()
        };
        HttpReportSource::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn test_ok_response_returns_utf8_body() {
        let body = r#"<div class="report_page_null">暂无数据</div>"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let source = source_for(serve(response, Duration::ZERO).await, 5);

        let page = assert_ok!(source.fetch("2018-08-01", 1).await);
        assert_eq!(page.status, 200);
        assert_eq!(page.body, body);
    }

    #[tokio::test]
    async fn test_server_error_is_http_status() {
        let response =
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let source = source_for(serve(response.to_string(), Duration::ZERO).await, 5);

        let err = assert_err!(source.fetch("2018-08-01", 1).await);
        assert_eq!(err, FetchError::HttpStatus(500));
    }

    #[tokio::test]
    async fn test_redirect_loop_is_too_many_redirects() {
        let response =
            "HTTP/1.1 302 Found\r\nLocation: /report\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let source = source_for(serve(response.to_string(), Duration::ZERO).await, 5);

        let err = assert_err!(source.fetch("2018-08-01", 1).await);
        assert!(matches!(err, FetchError::TooManyRedirects(_)), "unexpected {err:?}");
    }

    #[tokio::test]
    async fn test_slow_server_is_timeout() {
        let response = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let source = source_for(serve(response.to_string(), Duration::from_secs(3)).await, 1);

        let err = assert_err!(source.fetch("2018-08-01", 1).await);
        assert!(matches!(err, FetchError::Timeout(_)), "unexpected {err:?}");
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        // Bind then drop: the port is free and nothing listens on it.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let source = source_for(format!("http://{}/report", addr), 5);

        let err = assert_err!(source.fetch("2018-08-01", 1).await);
        assert!(matches!(err, FetchError::Network(_)), "unexpected {err:?}");
    }
}
