//! Model registry.
//!
//! Artifacts are keyed by (entity, training-window version). At most one
//! artifact per entity is promoted; promotion retires the previous one in
//! the same critical section, so readers never see zero or two promoted
//! artifacts for an entity that has been promoted once.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, instrument};

use super::journal::Journal;
use crate::domain::{ModelArtifact, PromotionStatus};
use crate::error::{NotFoundError, RegistryError};

/// Journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RegistryEntry {
    Stored {
        artifact: ModelArtifact,
    },
    Promoted {
        entity_id: String,
        version: String,
        retired: Option<String>,
        at: DateTime<Utc>,
    },
}

/// Result of the promotion policy
#[derive(Debug, Clone, PartialEq)]
pub enum PromotionDecision {
    /// The candidate is now promoted; `retired` is the version it replaced
    Promoted { retired: Option<String> },

    /// The version was already the promoted one
    AlreadyPromoted,

    /// Candidate scored worse than the promoted model beyond the tolerance
    Held {
        candidate_score: f64,
        promoted_score: f64,
    },
}

impl PromotionDecision {
    pub fn is_promoted(&self) -> bool {
        !matches!(self, PromotionDecision::Held { .. })
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Artifacts per entity in store order
    artifacts: HashMap<String, Vec<ModelArtifact>>,
}

impl RegistryState {
    fn find(&self, entity_id: &str, version: &str) -> Option<&ModelArtifact> {
        self.artifacts
            .get(entity_id)?
            .iter()
            .find(|a| a.version == version)
    }

    fn promoted(&self, entity_id: &str) -> Option<&ModelArtifact> {
        self.artifacts.get(entity_id)?.iter().find(|a| a.is_promoted())
    }

    fn apply(&mut self, entry: RegistryEntry) {
        match entry {
            RegistryEntry::Stored { artifact } => {
                self.artifacts
                    .entry(artifact.entity_id.clone())
                    .or_default()
                    .push(artifact);
            }
            RegistryEntry::Promoted {
                entity_id,
                version,
                at,
                ..
            } => {
                if let Some(artifacts) = self.artifacts.get_mut(&entity_id) {
                    for artifact in artifacts.iter_mut() {
                        if artifact.version == version {
                            artifact.status = PromotionStatus::Promoted;
                            artifact.promoted_at = Some(at);
                        } else if artifact.is_promoted() {
                            artifact.status = PromotionStatus::Retired;
                            artifact.retired_at = Some(at);
                        }
                    }
                }
            }
        }
    }
}

fn not_found(entity_id: &str, version: Option<&str>) -> RegistryError {
    RegistryError::NotFound(NotFoundError {
        kind: if version.is_some() { "model artifact" } else { "promoted model" },
        key: match version {
            Some(v) => format!("{}@{}", entity_id, v),
            None => entity_id.to_string(),
        },
    })
}

/// Stores model artifacts and serves the promoted one per entity
#[derive(Debug)]
pub struct ModelRegistry {
    state: RwLock<RegistryState>,
    journal: Option<Journal<RegistryEntry>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ModelRegistry {
    /// Registry without persistence
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            journal: None,
        }
    }

    /// Open a journaled registry, replaying existing entries
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let journal = Journal::open(path).await?;
        let mut state = RegistryState::default();
        for entry in journal.replay().await? {
            state.apply(entry);
        }
        Ok(Self {
            state: RwLock::new(state),
            journal: Some(journal),
        })
    }

    async fn record(&self, entry: &RegistryEntry) -> Result<(), RegistryError> {
        if let Some(journal) = &self.journal {
            journal.append(entry).await?;
        }
        Ok(())
    }

    /// Persist a new candidate artifact
    #[instrument(skip(self, artifact), fields(entity_id = %artifact.entity_id, version = %artifact.version))]
    pub async fn store(&self, mut artifact: ModelArtifact) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        if state.find(&artifact.entity_id, &artifact.version).is_some() {
            return Err(RegistryError::Duplicate {
                entity_id: artifact.entity_id,
                version: artifact.version,
            });
        }

        artifact.status = PromotionStatus::Candidate;
        artifact.promoted_at = None;
        artifact.retired_at = None;

        let entry = RegistryEntry::Stored { artifact };
        self.record(&entry).await?;
        state.apply(entry);
        info!("Stored candidate model");
        Ok(())
    }

    /// Promote a version, retiring the previously promoted one
    pub async fn promote(
        &self,
        entity_id: &str,
        version: &str,
    ) -> Result<PromotionDecision, RegistryError> {
        self.promote_at(entity_id, version, Utc::now()).await
    }

    #[instrument(skip(self, at))]
    pub async fn promote_at(
        &self,
        entity_id: &str,
        version: &str,
        at: DateTime<Utc>,
    ) -> Result<PromotionDecision, RegistryError> {
        let mut state = self.state.write().await;
        self.flip(&mut state, entity_id, version, at).await
    }

    /// Promotion policy: promote when nothing is promoted yet or the
    /// candidate scores no worse than the promoted model plus `tolerance`.
    /// Check and flip happen under one write lock.
    #[instrument(skip(self))]
    pub async fn auto_promote(
        &self,
        entity_id: &str,
        version: &str,
        tolerance: f64,
    ) -> Result<PromotionDecision, RegistryError> {
        let mut state = self.state.write().await;

        let candidate_score = state
            .find(entity_id, version)
            .ok_or_else(|| not_found(entity_id, Some(version)))?
            .quality_score();

        if let Some(current) = state.promoted(entity_id) {
            if current.version != version {
                let promoted_score = current.quality_score();
                if candidate_score > promoted_score + tolerance {
                    info!(candidate_score, promoted_score, tolerance, "Candidate held for review");
                    return Ok(PromotionDecision::Held {
                        candidate_score,
                        promoted_score,
                    });
                }
            }
        }

        self.flip(&mut state, entity_id, version, Utc::now()).await
    }

    async fn flip(
        &self,
        state: &mut RegistryState,
        entity_id: &str,
        version: &str,
        at: DateTime<Utc>,
    ) -> Result<PromotionDecision, RegistryError> {
        let target = state
            .find(entity_id, version)
            .ok_or_else(|| not_found(entity_id, Some(version)))?;

        match target.status {
            PromotionStatus::Promoted => return Ok(PromotionDecision::AlreadyPromoted),
            PromotionStatus::Retired => {
                return Err(RegistryError::Retired {
                    entity_id: entity_id.to_string(),
                    version: version.to_string(),
                })
            }
            PromotionStatus::Candidate => {}
        }

        let retired = state.promoted(entity_id).map(|a| a.version.clone());
        let entry = RegistryEntry::Promoted {
            entity_id: entity_id.to_string(),
            version: version.to_string(),
            retired: retired.clone(),
            at,
        };
        self.record(&entry).await?;
        state.apply(entry);

        info!(entity_id, version, retired = ?retired, "Promoted model");
        Ok(PromotionDecision::Promoted { retired })
    }

    /// The promoted artifact of an entity
    pub async fn get_promoted(&self, entity_id: &str) -> Result<ModelArtifact, RegistryError> {
        self.state
            .read()
            .await
            .promoted(entity_id)
            .cloned()
            .ok_or_else(|| not_found(entity_id, None))
    }

    pub async fn get(&self, entity_id: &str, version: &str) -> Result<ModelArtifact, RegistryError> {
        self.state
            .read()
            .await
            .find(entity_id, version)
            .cloned()
            .ok_or_else(|| not_found(entity_id, Some(version)))
    }

    /// Every artifact of an entity, in store order
    pub async fn list(&self, entity_id: &str) -> Vec<ModelArtifact> {
        self.state
            .read()
            .await
            .artifacts
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Entities with at least one artifact, sorted
    pub async fn entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = self.state.read().await.artifacts.keys().cloned().collect();
        entities.sort();
        entities
    }
}
