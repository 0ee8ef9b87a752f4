use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// 默认分组名
pub const DEFAULT_GROUP_NAME: &str = "_DEFAULT";

pub const ATTR_VERSION: &str = "version";
pub const ATTR_GROUP: &str = "group";
pub const ATTR_WEIGHT: &str = "weight";
pub const ATTR_SERIALIZATION: &str = "serialization";
pub const ATTR_APP_NAME: &str = "appName";
pub const ATTR_DYNAMIC: &str = "dynamic";
pub const ATTR_INTERFACE: &str = "interface";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid provider url `{url}`: {reason}")]
pub struct ParseProviderError {
    pub url: String,
    pub reason: &'static str,
}

/// 单个服务端点，按结构（协议+地址+端口+属性）判等
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderInfo {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub attributes: BTreeMap<String, String>,
}

impl ProviderInfo {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// host:port 形式的地址
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 生成规范 url，属性按 key 排序
    pub fn to_url(&self) -> String {
        let mut url = format!("{}://{}", self.protocol, self.host);
        if self.port != 0 {
            url.push(':');
            url.push_str(&self.port.to_string());
        }
        if !self.attributes.is_empty() {
            let query = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    pub fn parse(url: &str) -> Result<Self, ParseProviderError> {
        let invalid = |reason| ParseProviderError {
            url: url.to_string(),
            reason,
        };
        let (protocol, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if protocol.is_empty() {
            return Err(invalid("empty protocol"));
        }
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        // 忽略 path 部分
        let authority = authority.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            ),
            None => (authority, 0),
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let mut attributes = BTreeMap::new();
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).map_err(|_| invalid("invalid attribute key"))?;
            let value = urlencoding::decode(value).map_err(|_| invalid("invalid attribute value"))?;
            attributes.insert(key.into_owned(), value.into_owned());
        }

        Ok(Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            attributes,
        })
    }
}

impl fmt::Display for ProviderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl FromStr for ProviderInfo {
    type Err = ParseProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProviderInfo {
    type Error = ParseProviderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProviderInfo> for String {
    fn from(value: ProviderInfo) -> Self {
        value.to_url()
    }
}

/// 一个服务 key 下的全部端点，与顺序无关，按内容判等
///
/// 空分组与“没有分组”不同：表示服务已知但当前没有存活端点。
#[derive(Debug, Clone, Default)]
pub struct ProviderGroup {
    name: String,
    providers: BTreeSet<ProviderInfo>,
}

impl ProviderGroup {
    pub fn new() -> Self {
        Self::named(DEFAULT_GROUP_NAME)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: BTreeSet::new(),
        }
    }

    pub fn from_providers(providers: impl IntoIterator<Item = ProviderInfo>) -> Self {
        let mut group = Self::new();
        group.providers.extend(providers);
        group
    }

    pub fn name(&self) -> &str {
        if self.name.is_empty() {
            DEFAULT_GROUP_NAME
        } else {
            &self.name
        }
    }

    /// 返回是否为新增
    pub fn add(&mut self, provider: ProviderInfo) -> bool {
        self.providers.insert(provider)
    }

    /// 返回是否真的移除了
    pub fn remove(&mut self, provider: &ProviderInfo) -> bool {
        self.providers.remove(provider)
    }

    pub fn contains(&self, provider: &ProviderInfo) -> bool {
        self.providers.contains(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderInfo> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl PartialEq for ProviderGroup {
    fn eq(&self, other: &Self) -> bool {
        self.providers == other.providers
    }
}

impl Eq for ProviderGroup {}

impl FromIterator<ProviderInfo> for ProviderGroup {
    fn from_iter<T: IntoIterator<Item = ProviderInfo>>(iter: T) -> Self {
        Self::from_providers(iter)
    }
}
