use std::collections::{BTreeMap, HashSet};

use bson::Document;
use mongodb::error::ErrorKind;
use mongodb::Database;
use serde::Serialize;

use super::error::Result;
use super::indexes::{self, IndexSpec};
use super::{CONVERSATIONS_COLLECTION_NAME, MESSAGES_COLLECTION_NAME};

const NAMESPACE_NOT_FOUND: i32 = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ValidateMode {
    /// Report missing indexes, change nothing.
    Check,
    Create,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub present: Vec<&'static str>,
    pub created: Vec<&'static str>,
    pub missing: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub collections: BTreeMap<&'static str, CollectionReport>,
}

impl IndexReport {
    /// Every catalogued index exists after the run.
    pub fn is_complete(&self) -> bool {
        self.collections.values().all(|c| c.missing.is_empty())
    }

    pub fn created(&self) -> usize {
        self.collections.values().map(|c| c.created.len()).sum()
    }
}

/// Splits the catalogue for `collection` into indexes already present and
/// indexes still to build.
pub fn plan_missing(
    collection: &str,
    existing: &HashSet<String>,
) -> (Vec<&'static IndexSpec>, Vec<&'static IndexSpec>) {
    indexes::for_collection(collection).partition(|spec| existing.contains(spec.name))
}

fn is_namespace_missing(e: &mongodb::error::Error) -> bool {
    matches!(e.kind.as_ref(), ErrorKind::Command(c) if c.code == NAMESPACE_NOT_FOUND)
}

async fn validate_collection(
    db: &Database,
    collection: &'static str,
    mode: ValidateMode,
) -> Result<CollectionReport> {
    log::info!("Validating collection {}", collection);

    let col = db.collection::<Document>(collection);
    let existing = match col.list_index_names().await {
        Ok(names) => names.into_iter().collect::<HashSet<_>>(),
        Err(e) if is_namespace_missing(&e) => {
            log::info!("Collection {} does not exist yet", collection);
            HashSet::new()
        }
        Err(e) => {
            log::error!(target: "db_utils::validate", "Can't list indexes of {}: {}", collection, e);
            return Err(e.into());
        }
    };

    let (present, missing) = plan_missing(collection, &existing);
    let mut report = CollectionReport {
        present: present.iter().map(|s| s.name).collect(),
        ..Default::default()
    };
    for name in &report.present {
        log::info!("Index {} found", name);
    }

    for spec in missing {
        match mode {
            ValidateMode::Check => {
                log::warn!("Index {} is missing", spec.name);
                report.missing.push(spec.name);
            }
            ValidateMode::Create => {
                log::info!("Creating index {}", spec.name);
                col.create_index(spec.to_model(), None).await.map_err(|e| {
                    log::error!(target: "db_utils::validate", "Can't create index {}: {}", spec.name, e);
                    e
                })?;
                report.created.push(spec.name);
            }
        }
    }

    log::info!("Collection {} checked", collection);
    Ok(report)
}

/// Brings the chat collections in line with the index catalogue.
/// Running it again once everything exists changes nothing.
pub async fn ensure_indexes(db: &Database, mode: ValidateMode) -> Result<IndexReport> {
    log::info!("Validating database {} ({} mode)", db.name(), mode);

    let mut report = IndexReport::default();
    for collection in [MESSAGES_COLLECTION_NAME, CONVERSATIONS_COLLECTION_NAME] {
        let col = validate_collection(db, collection, mode).await?;
        report.collections.insert(collection, col);
    }

    if report.is_complete() {
        log::info!("Database {} is valid", db.name());
    } else {
        log::warn!("Database {} is missing indexes", db.name());
    }
    Ok(report)
}
