//! Deriving the rate-limit key for an inbound request.

use std::collections::{BTreeMap, HashMap};

/// Case-insensitive header lookup over whatever header container the host framework uses.
pub trait HeaderSource {
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderSource for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

impl HeaderSource for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

impl HeaderSource for [(&str, &str)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| *v)
    }
}

impl<const N: usize> HeaderSource for [(&str, &str); N] {
    fn header(&self, name: &str) -> Option<&str> {
        self.as_slice().header(name)
    }
}

/// Rate-limit key for a request.
///
/// `user:<id>` when the caller is authenticated, otherwise `ip:<addr>` from the first
/// `x-forwarded-for` entry (falling back to `x-real-ip`), otherwise `"unknown"`.
pub fn client_identifier<H>(headers: &H, user_id: Option<&str>) -> String
where
    H: HeaderSource + ?Sized,
{
    if let Some(id) = user_id.map(str::trim).filter(|id| !id.is_empty()) {
        return format!("user:{id}");
    }
    let forwarded = headers
        .header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let real_ip = || headers.header("x-real-ip").map(str::trim).filter(|ip| !ip.is_empty());
    match forwarded.or_else(real_ip) {
        Some(ip) => format!("ip:{ip}"),
        None => "unknown".to_string(),
    }
}
