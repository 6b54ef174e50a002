use std::collections::HashMap;

use crate::config::RouteConfig;

/// Static source chat → destination chats mapping, fixed at startup
#[derive(Debug, Clone, Default)]
pub struct MirrorMapping {
    routes: HashMap<i64, Vec<i64>>,
}

impl MirrorMapping {
    #[cfg(test)]
    pub fn new(routes: HashMap<i64, Vec<i64>>) -> Self {
        Self { routes }
    }

    /// Build from configured routes. Repeated sources are merged in order, duplicates dropped.
    pub fn from_routes(routes: &[RouteConfig]) -> Self {
        let mut merged: HashMap<i64, Vec<i64>> = HashMap::new();
        for route in routes {
            let targets = merged.entry(route.source).or_default();
            for &target in &route.targets {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        Self { routes: merged }
    }

    /// Destinations for a source chat, in configured order. Unknown chats have none.
    pub fn destinations(&self, source: i64) -> &[i64] {
        self.routes.get(&source).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn sources(&self) -> impl Iterator<Item = i64> + '_ {
        self.routes.keys().copied()
    }
}
