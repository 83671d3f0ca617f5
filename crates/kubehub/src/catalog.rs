//! Kind catalogs: where each kind's watch endpoint lives.

use anyhow::{Context, Result};
use kube::discovery::{verbs, Discovery};
use kube::Client;
use kwatch_core::{KindCatalog, KindDescriptor};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Catalog over a fixed set of descriptors. First descriptor wins on duplicate kind names.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    order: Vec<KindDescriptor>,
    by_kind: FxHashMap<String, usize>,
}

impl StaticCatalog {
    pub fn new(kinds: impl IntoIterator<Item = KindDescriptor>) -> Self {
        let mut me = Self::default();
        for k in kinds {
            me.insert(k);
        }
        me
    }

    pub fn insert(&mut self, kind: KindDescriptor) {
        if self.by_kind.contains_key(&kind.kind) {
            debug!(kind = %kind.kind, base = %kind.base_path, "catalog: duplicate kind ignored");
            return;
        }
        self.by_kind.insert(kind.kind.clone(), self.order.len());
        self.order.push(kind);
    }

    pub fn len(&self) -> usize { self.order.len() }

    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

impl KindCatalog for StaticCatalog {
    fn lookup(&self, kind: &str) -> Option<KindDescriptor> {
        self.by_kind.get(kind).map(|&i| self.order[i].clone())
    }

    fn kinds(&self) -> Vec<KindDescriptor> { self.order.clone() }
}

/// API base path for a group/version: `api/v1` for the core group, `apis/<group>/<version>` otherwise.
pub fn base_path(group: &str, version: &str) -> String {
    if group.is_empty() { format!("api/{}", version) } else { format!("apis/{}/{}", group, version) }
}

/// Catalog populated from cluster API discovery; only watchable kinds are kept.
pub struct DiscoveryCatalog;

impl DiscoveryCatalog {
    pub async fn discover() -> Result<StaticCatalog> {
        let client = Client::try_default().await.context("building kube client")?;
        let discovery = Discovery::new(client).run().await.context("running api discovery")?;
        let mut found = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::WATCH) {
                    continue;
                }
                found.push(KindDescriptor {
                    kind: ar.kind.clone(),
                    base_path: base_path(&ar.group, &ar.version),
                    plural: ar.plural.clone(),
                });
            }
        }
        // Core group first so bare kind names resolve to v1 (e.g. `Event`).
        found.sort_by(|a, b| {
            let core = |k: &KindDescriptor| !k.base_path.starts_with("api/");
            core(a).cmp(&core(b)).then(a.base_path.cmp(&b.base_path)).then(a.kind.cmp(&b.kind))
        });
        let catalog = StaticCatalog::new(found);
        info!(kinds = catalog.len(), "catalog: discovery complete");
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kd(kind: &str, base: &str, plural: &str) -> KindDescriptor {
        KindDescriptor { kind: kind.into(), base_path: base.into(), plural: plural.into() }
    }

    #[test]
    fn lookup_prefers_first_registration() {
        let cat = StaticCatalog::new([
            kd("Event", "api/v1", "events"),
            kd("Event", "apis/events.k8s.io/v1", "events"),
            kd("Deployment", "apis/apps/v1", "deployments"),
        ]);
        assert_eq!(cat.len(), 2);
        assert_eq!(cat.lookup("Event").unwrap().base_path, "api/v1");
        assert_eq!(cat.lookup("Deployment").unwrap().plural, "deployments");
        assert!(cat.lookup("Pod").is_none());
        assert_eq!(cat.kinds().iter().map(|k| k.kind.as_str()).collect::<Vec<_>>(), ["Event", "Deployment"]);
    }

    #[test]
    fn base_paths() {
        assert_eq!(base_path("", "v1"), "api/v1");
        assert_eq!(base_path("apps", "v1"), "apis/apps/v1");
    }
}
