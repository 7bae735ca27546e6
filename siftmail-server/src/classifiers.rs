//! Builds [`ClassifierDef`]s from the loaded configuration's statfile list
//! (spec §4.6, §6.5 "Statfiles"), grouping entries that share a classifier
//! name and opening each statfile's backend connection.

use std::collections::HashMap;
use std::sync::Arc;

use siftmail_config::schema::{StatBackendKind, StatfileConfig};
use siftmail_core::error::Result;
use siftmail_core::stats::backend::postgres::PostgresStatBackend;
use siftmail_core::stats::backend::redis::RedisStatBackend;
use siftmail_core::stats::backend::StatBackend;
use siftmail_core::stats::classifier::{ClassifierDef, StatfileDef};

async fn open_backend(kind: &StatBackendKind) -> Result<Arc<dyn StatBackend>> {
    match kind {
        StatBackendKind::Redis { url } => {
            let backend = RedisStatBackend::new(url, "sm:").await?;
            Ok(Arc::new(backend))
        }
        StatBackendKind::Postgres { dsn } => {
            let backend = PostgresStatBackend::new(dsn).await?;
            backend.migrate().await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Groups `statfiles` by classifier name, opening each one's backend and
/// calling `StatBackend::init` once per statfile (spec §4.6 step 1).
///
/// Returns each classifier wrapped in an `Arc` so the same definition can be
/// shared between `AppState` (learn/stat routes) and the scan-time
/// `ClassifierScanRule` registered into the symbol cache, without cloning
/// the statfiles' backend handles.
pub async fn build_classifiers(statfiles: &[StatfileConfig]) -> Result<Vec<Arc<ClassifierDef>>> {
    let mut grouped: HashMap<&str, Vec<&StatfileConfig>> = HashMap::new();
    for statfile in statfiles {
        grouped.entry(statfile.classifier.as_str()).or_default().push(statfile);
    }

    let mut classifiers = Vec::with_capacity(grouped.len());
    for (name, entries) in grouped {
        let min_tokens = entries.iter().map(|e| e.min_tokens).min().unwrap_or(0);
        let max_tokens = entries.iter().map(|e| e.max_tokens).max().unwrap_or(usize::MAX);

        let mut defs = Vec::with_capacity(entries.len());
        for entry in entries {
            let backend = open_backend(&entry.backend).await?;
            backend.init(&entry.symbol).await?;
            defs.push(StatfileDef {
                symbol: entry.symbol.clone(),
                is_spam: entry.is_spam,
                backend,
                path: entry.symbol.clone(),
            });
        }

        classifiers.push(Arc::new(ClassifierDef { name: name.to_string(), statfiles: defs, min_tokens, max_tokens }));
    }

    Ok(classifiers)
}
