// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::sync::Arc;

use crewdesk_domain::ReportKind;
use tracing::info;

use crate::ports::ReportGenerator;

/// Lookup table mapping report kinds to generator implementations.
/// Populated once at startup, read-only afterwards.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn ReportGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, generator: impl ReportGenerator + 'static) {
        let generator = Arc::new(generator) as Arc<dyn ReportGenerator>;
        info!(
            target: "registry",
            kind = generator.kind(),
            name = %generator.name(),
            "registering report generator"
        );
        self.generators
            .insert(generator.kind().to_string(), generator);
    }

    pub fn get(&self, kind: &ReportKind) -> Option<Arc<dyn ReportGenerator>> {
        self.generators.get(kind.as_str()).cloned()
    }

    pub fn contains(&self, kind: &ReportKind) -> bool {
        self.generators.contains_key(kind.as_str())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.generators.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}
