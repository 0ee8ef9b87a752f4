use crate::config::{PARAM_ADD_AUTH, PARAM_AUTH_SCHEME, RegistryConfig};
use crate::services::model::interface_config::DEFAULT_VERSION;
use crate::services::model::provider::{ATTR_GROUP, ATTR_VERSION};
use crate::services::model::{ProviderInfo, ServiceKey};

use super::client::AuthInfo;

/// 节点数据：下线
pub const PROVIDER_OFFLINE: &[u8] = b"0";
/// 节点数据：上线
pub const PROVIDER_ONLINE: &[u8] = b"1";

pub const PROVIDERS: &str = "providers";
pub const CONSUMERS: &str = "consumers";
pub const CONFIGS: &str = "configs";
pub const OVERRIDES: &str = "overrides";

/// 把 `host:port[,host:port][/root]` 拆成连接串和以 `/` 结尾的根路径
pub fn split_address(address: &str) -> (String, String) {
    let address = address.trim();
    match address.find('/') {
        Some(idx) => {
            let mut root = address[idx..].to_string();
            if !root.ends_with('/') {
                root.push('/');
            }
            (address[..idx].to_string(), root)
        }
        None => (address.to_string(), "/".to_string()),
    }
}

pub fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

pub fn decode(value: &str) -> Option<String> {
    urlencoding::decode(value).ok().map(|v| v.into_owned())
}

/// 接口级节点：`<root><interface>`
pub fn service_path(root: &str, interface: &str) -> String {
    format!("{root}{}", encode(interface))
}

pub fn subtree_path(root: &str, interface: &str, subtree: &str) -> String {
    format!("{}/{subtree}", service_path(root, interface))
}

/// 子节点名字是编码后的 url
pub fn node_name(provider: &ProviderInfo) -> String {
    encode(&provider.to_url())
}

pub fn node_path(subtree_path: &str, provider: &ProviderInfo) -> String {
    format!("{subtree_path}/{}", node_name(provider))
}

/// 解析子节点名字为端点，非法时返回 None
pub fn parse_node(name: &str) -> Option<ProviderInfo> {
    let url = decode(name)?;
    match ProviderInfo::parse(&url) {
        Ok(provider) => Some(provider),
        Err(e) => {
            tracing::warn!(node = %name, error = %e, "Ignore unparsable registry node");
            None
        }
    }
}

/// 节点数据为 `0` 时表示下线
pub fn is_online(data: &[u8]) -> bool {
    data != PROVIDER_OFFLINE
}

pub fn status_data(online: bool) -> Vec<u8> {
    let data = if online { PROVIDER_ONLINE } else { PROVIDER_OFFLINE };
    data.to_vec()
}

/// 配置节点名为 `key=value`
pub fn parse_config_entry(name: &str) -> Option<(String, String)> {
    let decoded = decode(name)?;
    let (key, value) = decoded.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// 由端点得到它所属的服务 key
pub fn service_key_of(interface: &str, provider: &ProviderInfo) -> ServiceKey {
    ServiceKey::new(
        interface,
        provider.attribute(ATTR_VERSION).unwrap_or(DEFAULT_VERSION),
        provider.attribute(ATTR_GROUP).unwrap_or_default(),
        &provider.protocol,
    )
}

/// `scheme` + `addAuth`（user1:pw1,user2:pw2）生成鉴权信息
pub fn build_auth_info(config: &RegistryConfig) -> Vec<AuthInfo> {
    let scheme = config.parameter(PARAM_AUTH_SCHEME).unwrap_or_default().trim();
    let add_auth = config.parameter(PARAM_ADD_AUTH).unwrap_or_default().trim();
    if scheme.is_empty() || add_auth.is_empty() {
        return Vec::new();
    }
    add_auth
        .split(',')
        .map(str::trim)
        .filter(|auth| !auth.is_empty())
        .map(|auth| AuthInfo::new(scheme, auth.as_bytes().to_vec()))
        .collect()
}
