//! Manifest assembly
//!
//! Folds every stage's artifacts into one flat manifest in execution order.
//! The first stage to produce a key keeps it; later producers are renamed to
//! `<key>@<stage>` (then `<key>@<stage>#2`, ...) and recorded as conflicts.

use crate::core::artifact::{Manifest, ManifestConflict, ManifestEntry};
use crate::execution::result::GeneratorResult;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestAssembler;

impl ManifestAssembler {
    pub fn new() -> Self {
        Self
    }

    pub fn assemble(&self, results: &[GeneratorResult]) -> Manifest {
        let mut manifest = Manifest::new();
        // key -> stage that owns it
        let mut owners: HashMap<String, String> = HashMap::new();

        for result in results.iter().filter(|r| r.success) {
            for (key, artifact) in &result.artifacts {
                let resolved = match owners.get(key) {
                    None => key.clone(),
                    Some(original_stage) => {
                        let resolved = Self::free_key(&owners, key, &result.stage);
                        warn!(
                            stage = %result.stage,
                            "Artifact key '{}' already produced by '{}'; storing as '{}'",
                            key,
                            original_stage,
                            resolved
                        );
                        manifest.conflicts.push(ManifestConflict {
                            key: key.clone(),
                            original_stage: original_stage.clone(),
                            conflicting_stage: result.stage.clone(),
                            resolved_key: resolved.clone(),
                        });
                        resolved
                    }
                };

                owners.insert(resolved.clone(), result.stage.clone());
                manifest.entries.push(ManifestEntry {
                    key: resolved,
                    stage: result.stage.clone(),
                    artifact: artifact.clone(),
                });
            }
        }

        manifest
    }

    fn free_key(owners: &HashMap<String, String>, key: &str, stage: &str) -> String {
        let base = format!("{}@{}", key, stage);
        if !owners.contains_key(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}#{}", base, n))
            .find(|candidate| !owners.contains_key(candidate))
            .unwrap_or(base)
    }
}
