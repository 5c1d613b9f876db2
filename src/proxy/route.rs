//! Inbound path → upstream URL resolution and the host allow-list.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "fqphp.gxom.cn",
    "api.cenguigui.cn",
    "lsjk.zyii.xyz",
    "nu1.jingluo.love",
    "nu2.jingluo.love",
    "fanqienovel.com",
];

/// Hostnames the proxy may forward to. Fixed after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowedHostSet(HashSet<String>);

impl AllowedHostSet {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            hosts
                .into_iter()
                .map(|host| host.into().to_ascii_lowercase())
                .collect(),
        )
    }

    pub fn permits(&self, host: &str) -> bool {
        self.0.contains(&host.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for AllowedHostSet {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_HOSTS.iter().copied())
    }
}

/// One entry of the ordered routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteRule {
    /// Paths starting with `prefix` go to `origin` with the path kept as is.
    Prefix { prefix: String, origin: String },
    /// A path made only of digits becomes `<endpoint>?<param>=<digits>`.
    NumericId { endpoint: String, param: String },
}

impl RouteRule {
    pub fn defaults() -> Vec<RouteRule> {
        vec![
            RouteRule::Prefix {
                prefix: "/content".to_string(),
                origin: "https://fqphp.gxom.cn".to_string(),
            },
            RouteRule::Prefix {
                prefix: "/api/tomato/".to_string(),
                origin: "https://api.cenguigui.cn".to_string(),
            },
            RouteRule::NumericId {
                endpoint: "https://lsjk.zyii.xyz:3666/content".to_string(),
                param: "item_id".to_string(),
            },
        ]
    }

    fn apply(&self, path: &str, query: Option<&str>) -> Option<String> {
        match self {
            RouteRule::Prefix { prefix, origin } => path
                .starts_with(prefix.as_str())
                .then(|| format!("{}{path}{}", origin.trim_end_matches('/'), query_suffix(query))),
            RouteRule::NumericId { endpoint, param } => {
                let id = path.strip_prefix('/')?;
                if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
                    return None;
                }
                let extra = match query {
                    Some(query) if !query.is_empty() => format!("&{query}"),
                    _ => String::new(),
                };
                Some(format!("{endpoint}?{param}={id}{extra}"))
            }
        }
    }
}

/// Resolve an inbound path (and raw query, without `?`) to an upstream URL.
///
/// A first segment that looks like a hostname names the upstream directly;
/// otherwise the rules are tried in order. `None` means no route matched.
pub fn resolve_target(
    path: &str,
    query: Option<&str>,
    rules: &[RouteRule],
    literal_scheme: &str,
) -> Option<Url> {
    if let Some((host, rest)) = literal_host(path) {
        let target = format!("{literal_scheme}://{host}{rest}{}", query_suffix(query));
        return Url::parse(&target).ok();
    }

    rules
        .iter()
        .find_map(|rule| rule.apply(path, query))
        .and_then(|target| Url::parse(&target).ok())
}

/// `/<host.with.dot>/rest` → (`host.with.dot`, `/rest`).
fn literal_host(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let (segment, rest) = match trimmed.find('/') {
        Some(index) => trimmed.split_at(index),
        None => (trimmed, ""),
    };
    // Needs at least one character on both sides of some dot.
    let has_inner_dot = segment
        .char_indices()
        .any(|(index, ch)| ch == '.' && index > 0 && index < segment.len() - 1);
    has_inner_dot.then_some((segment, rest))
}

fn query_suffix(query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("?{query}"),
        _ => String::new(),
    }
}
