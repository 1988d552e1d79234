use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use crate::action::Action;
use crate::config::{Config, Domain};
use crate::envelope::EntitySnapshotEnvelope;
use crate::error::ReadModelStoreError;
use crate::registry::{ProjectionInfo, ProjectionInfoReason, ProjectionRegistration, ProjectionTarget};
use crate::store::{LastProjectionInfo, ReadModelFilter, ReadModelMetadata, ReadModelRecord, ReadModelStoreAdapter};
use crate::types::{ReadModelId, SequenceKey};

/// Projects entity snapshots into read models.
pub struct ReadModelStore<D: Domain> {
    config: Arc<Config<D>>,
    adapter: Arc<dyn ReadModelStoreAdapter<D::ReadModel>>,
}

impl<D: Domain> Clone for ReadModelStore<D> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<D: Domain> ReadModelStore<D> {
    pub fn new(config: Arc<Config<D>>, adapter: impl ReadModelStoreAdapter<D::ReadModel> + 'static) -> Self {
        Self {
            config,
            adapter: Arc::new(adapter),
        }
    }

    pub fn config(&self) -> &Config<D> {
        &self.config
    }

    /// Runs every projection registered for the entity type of the snapshot, in registration
    /// order. Deleted snapshots go through the unprojections instead.
    ///
    /// The read model ids a projection resolves to are processed concurrently, each one with its
    /// own fetch, project and store cycle guarded by optimistic concurrency.
    ///
    /// # Errors
    ///
    /// A failing read model id doesn't stop the others: all the failures are collected in a
    /// [`ReadModelStoreError::Failed`].
    #[tracing::instrument(skip_all, fields(entity_type_name = %snapshot.entity_type_name, entity_id = %snapshot.entity_id), err)]
    pub async fn project(&self, snapshot: &EntitySnapshotEnvelope<D::Entity>) -> Result<(), ReadModelStoreError> {
        let registry = self.config.registry();

        let (registrations, reason): (&[ProjectionRegistration<D>], ProjectionInfoReason) = if snapshot.is_deleted() {
            (
                registry.unprojections_for(&snapshot.entity_type_name),
                ProjectionInfoReason::EntityDeleted,
            )
        } else {
            (
                registry.projections_for(&snapshot.entity_type_name),
                ProjectionInfoReason::EntityProjected,
            )
        };

        if registrations.is_empty() {
            tracing::debug!("no projections registered");
            return Ok(());
        }

        let info = ProjectionInfo { reason };
        let mut failures: Vec<ReadModelStoreError> = vec![];

        for registration in registrations {
            let targets: Vec<ProjectionTarget> = match registration.targets(&snapshot.value) {
                Ok(targets) => targets,
                Err(error) => {
                    failures.push(error);
                    continue;
                }
            };

            if targets.is_empty() {
                tracing::debug!(projection = %registration.qualified_name(), "entity carries no join key");
                continue;
            }

            let sequence_key: Option<SequenceKey> =
                registry.sequence_key_for(registration.read_model_name(), &snapshot.value);

            let cycles = targets.iter().map(|target| {
                let span = tracing::debug_span!(
                    "evolve.projection",
                    projection = %registration.qualified_name(),
                    read_model_id = %target.id,
                );

                self.project_with_retries(snapshot, registration, target, sequence_key.as_ref(), &info)
                    .instrument(span)
            });

            failures.extend(
                futures::future::join_all(cycles)
                    .await
                    .into_iter()
                    .filter_map(Result::err),
            );
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReadModelStoreError::Failed {
                entity_type_name: snapshot.entity_type_name.clone(),
                entity_id: snapshot.entity_id.clone(),
                failures,
            })
        }
    }

    async fn project_with_retries(
        &self,
        snapshot: &EntitySnapshotEnvelope<D::Entity>,
        registration: &ProjectionRegistration<D>,
        target: &ProjectionTarget,
        sequence_key: Option<&SequenceKey>,
        info: &ProjectionInfo,
    ) -> Result<(), ReadModelStoreError> {
        let policy = self.config.retry_policy();
        let mut attempt: u32 = 1;

        loop {
            match self.project_once(snapshot, registration, target, sequence_key, info).await {
                Err(ReadModelStoreError::Adapter(error)) if error.is_version_conflict() => {
                    if attempt >= policy.max_attempts() {
                        return Err(ReadModelStoreError::RetriesExhausted {
                            read_model_name: registration.read_model_name().to_string(),
                            read_model_id: target.id.clone(),
                            attempts: attempt,
                            source: error,
                        });
                    }

                    tracing::warn!({
                        attempt = attempt,
                        error = %error,
                    }, "read model version conflict, retrying");

                    let delay = policy.delay(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }

                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn project_once(
        &self,
        snapshot: &EntitySnapshotEnvelope<D::Entity>,
        registration: &ProjectionRegistration<D>,
        target: &ProjectionTarget,
        sequence_key: Option<&SequenceKey>,
        info: &ProjectionInfo,
    ) -> Result<(), ReadModelStoreError> {
        let read_model_name: &str = registration.read_model_name();

        let current: Option<ReadModelRecord<D::ReadModel>> = self
            .adapter
            .fetch(read_model_name, &target.id, sequence_key)
            .await?
            .and_then(|records| records.into_iter().next());

        let expected_version: u64 = current.as_ref().map_or(0, ReadModelRecord::version);

        let action: Action<D::ReadModel> = registration
            .project(&snapshot.value, target, current.map(|record| record.value), info)
            .map_err(|source| ReadModelStoreError::Projection {
                method: registration.qualified_name(),
                read_model_id: target.id.clone(),
                source,
            })?;

        match action {
            Action::Value(value) => {
                let record = ReadModelRecord {
                    id: target.id.clone(),
                    sequence_key: sequence_key.cloned(),
                    value,
                    metadata: ReadModelMetadata {
                        version: expected_version + 1,
                        schema_version: self.config.registry().schema_version(read_model_name),
                        last_update_at: Utc::now(),
                        last_projection_info: Some(LastProjectionInfo {
                            entity_id: snapshot.entity_id.clone(),
                            entity_name: snapshot.entity_type_name.clone(),
                            entity_updated_at: snapshot.snapshotted_event_created_at,
                            projection_method: registration.qualified_name(),
                        }),
                    },
                };

                self.adapter.store(read_model_name, record, expected_version).await?;
            }
            Action::Delete => {
                self.adapter.delete(read_model_name, &target.id, sequence_key).await?;
            }
            Action::Skip => tracing::debug!("projection skipped"),
        }

        Ok(())
    }

    /// Loads a single read model, the first one stored under the given id (and sequence key).
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the adapter fails.
    pub async fn fetch_read_model(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_key: Option<&SequenceKey>,
    ) -> Result<Option<D::ReadModel>, ReadModelStoreError> {
        Ok(self
            .adapter
            .fetch(read_model_name, id, sequence_key)
            .await?
            .and_then(|records| records.into_iter().next())
            .map(|record| record.value))
    }

    /// # Errors
    ///
    /// Will return an `Err` if the adapter fails.
    pub async fn search(
        &self,
        read_model_name: &str,
        filter: &ReadModelFilter,
    ) -> Result<Vec<D::ReadModel>, ReadModelStoreError> {
        Ok(self
            .adapter
            .search(read_model_name, filter)
            .await?
            .into_iter()
            .map(|record| record.value)
            .collect())
    }
}
