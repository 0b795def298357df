//! 远程图片主机检查
//!
//! 只看 URL 中的字面主机，不做 DNS 解析。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// 禁止访问的 IPv4 网段 (网络地址, 前缀长度)
const BLOCKED_V4: &[(Ipv4Addr, u32)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// 禁止访问的 IPv6 网段
const BLOCKED_V6: &[(Ipv6Addr, u32)] = &[
    (Ipv6Addr::UNSPECIFIED, 128),
    (Ipv6Addr::LOCALHOST, 128),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

/// 主机被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostRejection {
    #[error("missing host")]
    Missing,
    #[error("localhost")]
    Localhost,
    #[error("private address {0}")]
    PrivateAddress(IpAddr),
}

/// 检查 URL 的主机是否允许访问
pub fn check_url(url: &Url) -> Result<(), HostRejection> {
    match url.host() {
        None => Err(HostRejection::Missing),
        Some(Host::Domain(domain)) => check_domain(domain),
        Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip)),
    }
}

fn check_domain(domain: &str) -> Result<(), HostRejection> {
    let host = domain.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(HostRejection::Missing);
    }
    if host == "localhost" || host.ends_with(".localhost") {
        return Err(HostRejection::Localhost);
    }
    // url 会把大多数 IP 字面量解析成 Host::Ipv4/Ipv6，这里兜底
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return check_ip(ip);
    }
    Ok(())
}

pub fn check_ip(ip: IpAddr) -> Result<(), HostRejection> {
    if is_blocked(ip) {
        Err(HostRejection::PrivateAddress(ip))
    } else {
        Ok(())
    }
}

fn is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_blocked_v4(v4),
            None => is_blocked_v6(v6),
        },
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let addr = u32::from(ip);
    BLOCKED_V4.iter().any(|(net, prefix)| {
        let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
        addr & mask == u32::from(*net) & mask
    })
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    let addr = u128::from(ip);
    BLOCKED_V6.iter().any(|(net, prefix)| {
        let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
        addr & mask == u128::from(*net) & mask
    })
}
