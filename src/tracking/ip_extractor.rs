//! Client IP extraction from transport metadata and proxy headers
//!
//! - `none`: the socket peer address is the client.
//! - `cloudflare`: `CF-Connecting-IP`, falling back to the socket address.
//! - `standard`: RFC 7239 `Forwarded`, then `X-Forwarded-For`, walked right
//!   to left past trusted hops. When trusted CIDRs are configured, headers
//!   are ignored unless the socket peer is itself one of them.

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{ClientIpConfig, TrustedProxyMode};

pub fn extract_client_ip(
    headers: &HeaderMap,
    socket_addr: IpAddr,
    config: &ClientIpConfig,
) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => {
            extract_standard_ip(headers, socket_addr, config).unwrap_or(socket_addr)
        }
        TrustedProxyMode::None => socket_addr,
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

fn extract_standard_ip(
    headers: &HeaderMap,
    socket_addr: IpAddr,
    config: &ClientIpConfig,
) -> Option<IpAddr> {
    if !config.trusted_proxies.is_empty() && !is_trusted(socket_addr, config) {
        return None;
    }

    let chain = forwarded_chain(headers).or_else(|| x_forwarded_for_chain(headers))?;
    pick_client(&chain, config)
}

fn is_trusted(ip: IpAddr, config: &ClientIpConfig) -> bool {
    config.trusted_proxies.iter().any(|net| net.contains(&ip))
}

/// Choose the client from a left-to-right hop chain
fn pick_client(chain: &[IpAddr], config: &ClientIpConfig) -> Option<IpAddr> {
    if let Some(num_trusted) = config.num_trusted_proxies {
        if chain.len() > num_trusted {
            return Some(chain[chain.len() - num_trusted - 1]);
        }
        // Not enough hops, the leftmost entry is the best guess
        return chain.first().copied();
    }

    if !config.trusted_proxies.is_empty() {
        return chain
            .iter()
            .rev()
            .find(|ip| !is_trusted(**ip, config))
            .or_else(|| chain.first())
            .copied();
    }

    chain.last().copied()
}

/// `for=` values of an RFC 7239 `Forwarded` header, in order
fn forwarded_chain(headers: &HeaderMap) -> Option<Vec<IpAddr>> {
    let forwarded = headers.get("forwarded")?.to_str().ok()?;

    let chain: Vec<IpAddr> = forwarded
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            if key.trim().eq_ignore_ascii_case("for") {
                parse_node(value)
            } else {
                None
            }
        })
        .collect();

    (!chain.is_empty()).then_some(chain)
}

fn x_forwarded_for_chain(headers: &HeaderMap) -> Option<Vec<IpAddr>> {
    let xff = headers.get("x-forwarded-for")?.to_str().ok()?;

    let chain: Vec<IpAddr> = xff.split(',').filter_map(parse_node).collect();

    (!chain.is_empty()).then_some(chain)
}

/// Parse `1.2.3.4`, `1.2.3.4:80`, `2001:db8::1` or `"[2001:db8::1]:80"`
fn parse_node(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"');

    if let Some(rest) = value.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }

    let (host, _port) = value.rsplit_once(':')?;
    host.parse().ok()
}
