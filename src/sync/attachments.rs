//! Attachment discovery and SSRF-safe download.
//!
//! Every hop of a download is validated before any connection is made: the
//! scheme must be http(s), the host must not be a known metadata name, and every
//! address it resolves to must be publicly routable. The connection is then
//! pinned to the validated address so a second DNS answer cannot redirect it.
//! Redirects are followed by hand, each one re-validated.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::redirect::Policy;
use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::config::AttachmentConfig;
use crate::gitlab::GitLabError;

static MARKDOWN_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!?\[[^\]]*\]\(([^)\s]+)(?:\s+"[^"]*")?\)"#).expect("static regex is valid")
});

const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "instance-data",
    "instance-data.ec2.internal",
];

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("invalid attachment URL '{0}'")]
    InvalidUrl(String),
    #[error("scheme '{0}' is not allowed")]
    DisallowedScheme(String),
    #[error("host '{host}' is not allowed: {reason}")]
    BlockedHost { host: String, reason: String },
    #[error("host '{host}' resolves to blocked address {addr}")]
    BlockedAddress { host: String, addr: IpAddr },
    #[error("failed to resolve '{host}': {message}")]
    Resolve { host: String, message: String },
    #[error("more than {0} redirects")]
    TooManyRedirects(u32),
    #[error("attachment exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("download failed with HTTP {status}")]
    Http { status: u16 },
    #[error("download failed: {0}")]
    Transport(String),
    #[error("upload failed: {0}")]
    Upload(#[from] GitLabError),
}

/// Credentials sent only to hops on the source instance's host.
#[derive(Debug, Clone)]
pub struct SourceAuth {
    pub host: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, auth: Option<&SourceAuth>) -> Result<FetchedFile, AttachmentError>;
}

/// Unique link targets in `markdown` that look like attachments: absolute
/// http(s) URLs and GitLab project-relative `/uploads/` paths, in order of
/// first appearance.
pub fn extract_attachment_urls(markdown: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for captures in MARKDOWN_LINK.captures_iter(markdown) {
        let Some(target) = captures.get(1) else {
            continue;
        };
        let target = target.as_str();
        let lower = target.to_ascii_lowercase();
        let candidate = lower.starts_with("http://")
            || lower.starts_with("https://")
            || lower.starts_with("/uploads/");
        if candidate && !urls.iter().any(|u| u == target) {
            urls.push(target.to_string());
        }
    }
    urls
}

/// Absolute URL for a markdown link target; `/uploads/` paths are resolved
/// against the source project's web root.
pub fn resolve_attachment_url(
    raw: &str,
    instance_base_url: &str,
    project_path: &str,
) -> Result<Url, AttachmentError> {
    let absolute = if raw.starts_with("/uploads/") {
        format!(
            "{}/{}{}",
            instance_base_url.trim_end_matches('/'),
            project_path.trim_matches('/'),
            raw
        )
    } else {
        raw.to_string()
    };
    Url::parse(&absolute).map_err(|_| AttachmentError::InvalidUrl(raw.to_string()))
}

/// `host[:port]`, lowercased.
pub fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

pub fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || octets[0] == 0
        // 100.64.0.0/10 carrier-grade NAT, includes 100.100.100.200
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 192.0.0.0/24 protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || octets[0] >= 240
}

pub fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(mapped);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local, includes fd00:ec2::254
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

/// Downloads attachments over reqwest with per-hop validation.
#[derive(Debug, Clone)]
pub struct HttpAttachmentFetcher {
    config: AttachmentConfig,
}

impl HttpAttachmentFetcher {
    pub fn new(config: AttachmentConfig) -> Self {
        Self { config }
    }

    fn is_allowed_host(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default().to_lowercase();
        let key = host_key(url);
        self.config
            .allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&host) || allowed.eq_ignore_ascii_case(&key))
    }

    /// Validate one hop, returning the addresses a connection may use.
    pub async fn validate(&self, url: &Url) -> Result<Vec<SocketAddr>, AttachmentError> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(AttachmentError::DisallowedScheme(scheme.to_string()));
        }
        let host = url
            .host()
            .ok_or_else(|| AttachmentError::InvalidUrl(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AttachmentError::InvalidUrl(url.to_string()))?;
        let allowed = self.is_allowed_host(url);

        let addrs: Vec<SocketAddr> = match host {
            Host::Ipv4(ip) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
            Host::Ipv6(ip) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
            Host::Domain(domain) => {
                let name = domain.trim_end_matches('.').to_lowercase();
                if !allowed
                    && (BLOCKED_HOSTNAMES.contains(&name.as_str()) || name.ends_with(".localhost"))
                {
                    return Err(AttachmentError::BlockedHost {
                        host: name,
                        reason: "reserved or metadata hostname".to_string(),
                    });
                }
                let resolved: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), port))
                    .await
                    .map_err(|e| AttachmentError::Resolve {
                        host: name.clone(),
                        message: e.to_string(),
                    })?
                    .collect();
                if resolved.is_empty() {
                    return Err(AttachmentError::Resolve {
                        host: name,
                        message: "no addresses".to_string(),
                    });
                }
                resolved
            }
        };

        if !allowed
            && let Some(blocked) = addrs.iter().find(|addr| is_blocked_ip(addr.ip()))
        {
            return Err(AttachmentError::BlockedAddress {
                host: url.host_str().unwrap_or_default().to_string(),
                addr: blocked.ip(),
            });
        }
        Ok(addrs)
    }

    fn client_for_hop(&self, url: &Url, addrs: &[SocketAddr]) -> Result<reqwest::Client, AttachmentError> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(Duration::from_secs(self.config.download_timeout_seconds));
        if let Some(Host::Domain(domain)) = url.host()
            && let Some(addr) = addrs.first()
        {
            builder = builder.resolve(domain, *addr);
        }
        builder
            .build()
            .map_err(|e| AttachmentError::Transport(e.to_string()))
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>, AttachmentError> {
        let limit = self.config.max_size_bytes;
        if let Some(length) = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            && length > limit
        {
            return Err(AttachmentError::TooLarge { limit });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AttachmentError::Transport(e.to_string()))?
        {
            if (bytes.len() + chunk.len()) as u64 > limit {
                return Err(AttachmentError::TooLarge { limit });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl AttachmentFetcher for HttpAttachmentFetcher {
    async fn fetch(&self, url: &Url, auth: Option<&SourceAuth>) -> Result<FetchedFile, AttachmentError> {
        let mut current = url.clone();
        let mut redirects = 0u32;

        loop {
            let addrs = self.validate(&current).await?;
            let client = self.client_for_hop(&current, &addrs)?;

            let mut request = client.get(current.clone());
            if let Some(auth) = auth
                && auth.host.eq_ignore_ascii_case(&host_key(&current))
            {
                request = request.header("PRIVATE-TOKEN", auth.token.as_str());
            }

            let response = request
                .send()
                .await
                .map_err(|e| AttachmentError::Transport(e.to_string()))?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(AttachmentError::Http {
                        status: status.as_u16(),
                    })?;
                if redirects >= self.config.max_redirects {
                    return Err(AttachmentError::TooManyRedirects(self.config.max_redirects));
                }
                let next = current
                    .join(location)
                    .map_err(|_| AttachmentError::InvalidUrl(location.to_string()))?;
                debug!(from = %current, to = %next, "Following attachment redirect");
                current = next;
                redirects += 1;
                continue;
            }

            if !status.is_success() {
                warn!(url = %current, status = status.as_u16(), "Attachment download failed");
                return Err(AttachmentError::Http {
                    status: status.as_u16(),
                });
            }

            let bytes = self.read_capped(response).await?;
            return Ok(FetchedFile {
                filename: filename_from_url(url),
                bytes,
            });
        }
    }
}

/// Last non-empty path segment of the originally referenced URL.
pub fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| segment.to_string())
        .unwrap_or_else(|| "attachment".to_string())
}
