use std::collections::HashMap;

use super::provider::ProviderGroup;
use super::service_key::ServiceKey;

pub type ProviderMapping = HashMap<ServiceKey, ProviderGroup>;

/// 两份 服务key -> 分组 映射的差异
///
/// 新增与变化的条目携带新值；被移除的 key 以空分组的形式给出，下游无需区分
/// “分组消失”和“分组变空”。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingDiff {
    pub added: Vec<(ServiceKey, ProviderGroup)>,
    pub removed: Vec<(ServiceKey, ProviderGroup)>,
    pub changed: Vec<(ServiceKey, ProviderGroup)>,
}

impl MappingDiff {
    pub fn between(old: &ProviderMapping, new: &ProviderMapping) -> Self {
        let mut diff = Self::default();

        for (key, group) in new {
            match old.get(key) {
                None => diff.added.push((key.clone(), group.clone())),
                Some(previous) if previous != group => {
                    diff.changed.push((key.clone(), group.clone()))
                }
                Some(_) => {}
            }
        }

        for key in old.keys() {
            if !new.contains_key(key) {
                diff.removed.push((key.clone(), ProviderGroup::new()));
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// 按 新增、移除、变化 的顺序遍历需要通知的条目
    pub fn notifications(&self) -> impl Iterator<Item = &(ServiceKey, ProviderGroup)> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .chain(self.changed.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::model::ProviderInfo;

    fn group(hosts: &[&str]) -> ProviderGroup {
        hosts
            .iter()
            .map(|host| ProviderInfo::new("bolt", *host, 22000))
            .collect()
    }

    fn mapping(entries: &[(&str, &[&str])]) -> ProviderMapping {
        entries
            .iter()
            .map(|(key, hosts)| (ServiceKey::from(*key), group(hosts)))
            .collect()
    }

    #[test]
    fn test_disjoint_mappings() {
        let old = mapping(&[("A:1.0@bolt", &["10.0.0.1"]), ("B:1.0@bolt", &[])]);
        let new = mapping(&[("C:1.0@bolt", &["10.0.0.3"])]);
        let diff = MappingDiff::between(&old, &new);

        assert_eq!(diff.added, vec![(ServiceKey::from("C:1.0@bolt"), group(&["10.0.0.3"]))]);
        let mut removed: Vec<_> = diff.removed.iter().map(|(k, _)| k.as_str()).collect();
        removed.sort();
        assert_eq!(removed, vec!["A:1.0@bolt", "B:1.0@bolt"]);
        assert!(diff.removed.iter().all(|(_, g)| g.is_empty()));
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_identical_mappings() {
        let old = mapping(&[("A:1.0@bolt", &["10.0.0.1", "10.0.0.2"])]);
        let new = mapping(&[("A:1.0@bolt", &["10.0.0.2", "10.0.0.1"])]);
        let diff = MappingDiff::between(&old, &new);
        assert!(diff.is_empty());
        assert_eq!(diff.len(), 0);
    }

    #[test]
    fn test_changed_carries_new_value() {
        let old = mapping(&[("A:1.0@bolt", &["10.0.0.1"]), ("B:1.0@bolt", &["10.0.0.5"])]);
        let new = mapping(&[("A:1.0@bolt", &["10.0.0.2"]), ("B:1.0@bolt", &["10.0.0.5"])]);
        let diff = MappingDiff::between(&old, &new);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.changed, vec![(ServiceKey::from("A:1.0@bolt"), group(&["10.0.0.2"]))]);
    }

    #[test]
    fn test_group_becoming_empty_is_a_change() {
        let old = mapping(&[("A:1.0@bolt", &["10.0.0.1"])]);
        let new = mapping(&[("A:1.0@bolt", &[])]);
        let diff = MappingDiff::between(&old, &new);
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.changed[0].1.is_empty());
        assert_eq!(diff.notifications().count(), 1);
    }
}
