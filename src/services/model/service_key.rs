use serde::{Deserialize, Serialize};
use std::fmt;

/// 服务 key，由 接口名:版本[:分组]@协议 组成，是注册/订阅/通知的最小单位
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKey(String);

impl ServiceKey {
    pub fn new(interface: &str, version: &str, group: &str, protocol: &str) -> Self {
        let mut key = format!("{interface}:{version}");
        if !group.is_empty() {
            key.push(':');
            key.push_str(group);
        }
        key.push('@');
        key.push_str(protocol);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ServiceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ServiceKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let key = ServiceKey::new("Echo", "1.0", "", "bolt");
        assert_eq!(key.as_str(), "Echo:1.0@bolt");
        assert_eq!(key, ServiceKey::new("Echo", "1.0", "", "bolt"));

        let grouped = ServiceKey::new("Echo", "1.0", "blue", "bolt");
        assert_eq!(grouped.to_string(), "Echo:1.0:blue@bolt");
        assert_ne!(key, grouped);
    }
}
