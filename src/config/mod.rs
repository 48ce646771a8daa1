use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api_server: ServerConfig,
    pub cors: CorsConfig,
    pub client_ip: ClientIpConfig,
    pub tracking: TrackingConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// `["*"]` allows any origin
    pub allowed_origins: Vec<String>,
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.len() == 1 && self.allowed_origins[0] == "*"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    None,
    Standard,
    Cloudflare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIpConfig {
    pub trusted_proxy_mode: TrustedProxyMode,
    /// CIDR ranges of proxies allowed to set forwarding headers
    pub trusted_proxies: Vec<IpNet>,
    /// Fixed number of proxy hops to skip from the right
    pub num_trusted_proxies: Option<usize>,
}

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            trusted_proxy_mode: TrustedProxyMode::None,
            trusted_proxies: vec![],
            num_trusted_proxies: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Inactivity after which a session is no longer reused
    pub session_timeout_secs: i64,
    /// Deadline for one beacon, from body read to commit
    pub request_timeout_ms: u64,
}

impl TrackingConfig {
    pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 30 * 60;
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: Self::DEFAULT_SESSION_TIMEOUT_SECS,
            request_timeout_ms: Self::DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 0 disables the site cache
    pub site_cache_max_entries: u64,
    pub site_cache_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            _ => DatabaseBackend::Sqlite,
        };

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./trackveil.db".to_string());

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u32>()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?;

        let api_host = std::env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let api_port = std::env::var("API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("API_PORT must be a valid port")?;

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let trusted_proxy_mode = match std::env::var("TRUSTED_PROXY_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "none" => TrustedProxyMode::None,
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let trusted_proxies = match std::env::var("TRUSTED_PROXIES") {
            Ok(list) => parse_cidrs(&list)?,
            Err(_) => vec![],
        };

        let num_trusted_proxies = std::env::var("NUM_TRUSTED_PROXIES")
            .ok()
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("NUM_TRUSTED_PROXIES must be a non-negative integer")?;

        let session_timeout_secs = std::env::var("SESSION_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse::<i64>())
            .transpose()
            .context("SESSION_TIMEOUT_SECS must be an integer")?
            .unwrap_or(TrackingConfig::DEFAULT_SESSION_TIMEOUT_SECS);

        if session_timeout_secs <= 0 {
            anyhow::bail!("SESSION_TIMEOUT_SECS must be positive");
        }

        let request_timeout_ms = std::env::var("REQUEST_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("REQUEST_TIMEOUT_MS must be a non-negative integer")?
            .unwrap_or(TrackingConfig::DEFAULT_REQUEST_TIMEOUT_MS);

        let site_cache_max_entries = std::env::var("SITE_CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000);

        let site_cache_ttl_secs = std::env::var("SITE_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            cors: CorsConfig { allowed_origins },
            client_ip: ClientIpConfig {
                trusted_proxy_mode,
                trusted_proxies,
                num_trusted_proxies,
            },
            tracking: TrackingConfig {
                session_timeout_secs,
                request_timeout_ms,
            },
            cache: CacheConfig {
                site_cache_max_entries,
                site_cache_ttl_secs,
            },
        })
    }
}

/// Parse a comma separated CIDR list. Bare addresses become host routes.
pub fn parse_cidrs(list: &str) -> anyhow::Result<Vec<IpNet>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<std::net::IpAddr>().map(IpNet::from))
                .with_context(|| format!("invalid entry '{entry}' in TRUSTED_PROXIES"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidrs() {
        let nets = parse_cidrs("10.0.0.0/8, 192.168.1.5 ,,2001:db8::/32").unwrap();
        assert_eq!(nets.len(), 3);
        assert!(nets[1].contains(&"192.168.1.5".parse::<std::net::IpAddr>().unwrap()));
        assert!(!nets[1].contains(&"192.168.1.6".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn test_parse_cidrs_rejects_garbage() {
        assert!(parse_cidrs("10.0.0.0/8,proxy.internal").is_err());
    }

    #[test]
    fn test_wildcard_origin() {
        let any = CorsConfig {
            allowed_origins: vec!["*".to_string()],
        };
        let listed = CorsConfig {
            allowed_origins: vec!["https://a.test".to_string(), "https://b.test".to_string()],
        };
        assert!(any.allows_any_origin());
        assert!(!listed.allows_any_origin());
    }

    #[test]
    fn test_client_ip_config_serde() {
        let config = ClientIpConfig {
            trusted_proxy_mode: TrustedProxyMode::Standard,
            trusted_proxies: parse_cidrs("10.0.0.0/8,2001:db8::/32").unwrap(),
            num_trusted_proxies: Some(1),
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["trusted_proxy_mode"], "standard");
        assert_eq!(json["trusted_proxies"][0], "10.0.0.0/8");

        let back: ClientIpConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.trusted_proxies, config.trusted_proxies);
        assert_eq!(back.num_trusted_proxies, Some(1));
    }

    #[test]
    fn test_tracking_defaults() {
        let tracking = TrackingConfig::default();
        assert_eq!(tracking.session_timeout_secs, 1800);
        assert_eq!(tracking.request_timeout_ms, 5000);
    }
}
