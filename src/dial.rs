//! Proxy resolution and the TCP dialer used to reach SSH servers.
//!
//! A SOCKS5 proxy is picked up from the conventional environment variables;
//! everything else dials direct TCP. The dialer is resolved fresh before
//! every connection attempt so environment changes take effect on the next
//! retry.

use std::io;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::warn;
use url::Url;

/// Environment variables consulted for a proxy, in priority order.
const PROXY_ENV_VARS: [&str; 6] = [
    "ALL_PROXY",
    "all_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
];

/// Default SOCKS5 port when the proxy URL carries none.
const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Resolve a proxy URL from the process environment.
///
/// The first non-empty variable in [`PROXY_ENV_VARS`] order wins. A value
/// without a scheme is treated as `socks5://<value>`. Unparseable values are
/// warned about and ignored.
pub fn resolve_proxy() -> Option<Url> {
    resolve_proxy_from(|name| std::env::var(name).ok())
}

fn resolve_proxy_from(lookup: impl Fn(&str) -> Option<String>) -> Option<Url> {
    let (name, raw) = PROXY_ENV_VARS
        .iter()
        .find_map(|name| lookup(name).filter(|v| !v.is_empty()).map(|v| (*name, v)))?;
    let candidate = if raw.contains("://") {
        raw.clone()
    } else {
        format!("socks5://{raw}")
    };
    match Url::parse(&candidate) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Ignoring unparseable proxy {name}={raw}: {e}");
            None
        }
    }
}

/// How outbound TCP connections are made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialer {
    /// Plain TCP.
    Direct,
    /// TCP through a SOCKS5 proxy at `proxy` (`host:port`).
    Socks5 { proxy: String },
}

impl Dialer {
    /// Build a dialer from the process environment.
    pub fn from_env() -> Self {
        Self::from_proxy(resolve_proxy())
    }

    /// Build a dialer from an already-resolved proxy URL.
    ///
    /// Only `socks5`/`socks5h` proxies are honored. HTTP-scheme proxies are
    /// rejected with a warning instead of being spoken to as SOCKS5.
    fn from_proxy(proxy: Option<Url>) -> Self {
        let Some(url) = proxy else {
            return Dialer::Direct;
        };
        if !matches!(url.scheme(), "socks5" | "socks5h") {
            warn!(
                "Proxy scheme {:?} is not socks5, dialing direct",
                url.scheme()
            );
            return Dialer::Direct;
        }
        let Some(host) = url.host_str() else {
            warn!("Proxy url {url} has no host, dialing direct");
            return Dialer::Direct;
        };
        let port = url.port().unwrap_or(DEFAULT_SOCKS_PORT);
        Dialer::Socks5 {
            proxy: format!("{host}:{port}"),
        }
    }

    /// Human-readable mode, logged before each session attempt.
    pub fn mode(&self) -> String {
        match self {
            Dialer::Direct => "direct".to_string(),
            Dialer::Socks5 { proxy } => format!("socks5 via {proxy}"),
        }
    }

    /// Open a TCP connection to `addr` (`host:port`), possibly through the
    /// proxy. After the SOCKS handshake the inner stream carries the
    /// tunneled connection, so both arms yield a plain [`TcpStream`].
    pub async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        match self {
            Dialer::Direct => TcpStream::connect(addr).await,
            Dialer::Socks5 { proxy } => {
                let stream = Socks5Stream::connect(proxy.as_str(), addr)
                    .await
                    .map_err(io::Error::other)?;
                Ok(stream.into_inner())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_priority_order() {
        let url = resolve_proxy_from(env(&[
            ("HTTPS_PROXY", "socks5://second:1080"),
            ("ALL_PROXY", "socks5://first:1080"),
        ]))
        .unwrap();
        assert_eq!(url.host_str(), Some("first"));
    }

    #[test]
    fn test_lowercase_variant_wins_over_later_uppercase() {
        let url = resolve_proxy_from(env(&[
            ("all_proxy", "socks5://lower:1080"),
            ("HTTP_PROXY", "http://upper:8080"),
        ]))
        .unwrap();
        assert_eq!(url.host_str(), Some("lower"));
    }

    #[test]
    fn test_schemeless_value_defaults_to_socks5() {
        let url = resolve_proxy_from(env(&[("ALL_PROXY", "10.0.0.1:7777")])).unwrap();
        assert_eq!(url.scheme(), "socks5");
        assert_eq!(url.host_str(), Some("10.0.0.1"));
        assert_eq!(url.port(), Some(7777));
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let url = resolve_proxy_from(env(&[
            ("ALL_PROXY", ""),
            ("HTTPS_PROXY", "socks5://fallback:1080"),
        ]))
        .unwrap();
        assert_eq!(url.host_str(), Some("fallback"));
    }

    #[test]
    fn test_unparseable_value_yields_none() {
        assert!(resolve_proxy_from(env(&[("ALL_PROXY", "://no-scheme")])).is_none());
    }

    #[test]
    fn test_no_proxy_dials_direct() {
        assert_eq!(Dialer::from_proxy(None), Dialer::Direct);
    }

    #[test]
    fn test_socks5_proxy_with_default_port() {
        let url = Url::parse("socks5://proxy.example").unwrap();
        assert_eq!(
            Dialer::from_proxy(Some(url)),
            Dialer::Socks5 {
                proxy: "proxy.example:1080".to_string()
            }
        );
    }

    #[test]
    fn test_http_proxy_is_rejected() {
        let url = Url::parse("http://proxy.example:8080").unwrap();
        assert_eq!(Dialer::from_proxy(Some(url)), Dialer::Direct);
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(Dialer::Direct.mode(), "direct");
        let dialer = Dialer::Socks5 {
            proxy: "p:1080".to_string(),
        };
        assert_eq!(dialer.mode(), "socks5 via p:1080");
    }
}
