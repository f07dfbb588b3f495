//! Load-file generation through the worker bus
//!
//! Staging files are published in batches; workers convert them to
//! warehouse-specific load files and reply with the ids of the rows they
//! wrote to `wh_load_files`. All batches are published before any reply is
//! awaited, and reply collection runs concurrently per batch.

use crate::notifier::{
    Notifier, NotifierMessage, NotifierPayload, RESPONSE_ABORTED,
};
use crate::{Error, Result};
use granary_core::schema::Schema;
use granary_core::state_machine::StagingFileStatus;
use granary_core::warehouse::Warehouse;
use granary_storage::{StagingFileModel, UploadModel, UploadStore};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Dispatches one upload's staging files to the worker fleet and collects
/// the emitted load-file ids.
pub(crate) struct LoadFileBuilder {
    store: Arc<dyn UploadStore>,
    notifier: Arc<dyn Notifier>,
    publish_batch_size: usize,
}

impl LoadFileBuilder {
    pub(crate) fn new(
        store: Arc<dyn UploadStore>,
        notifier: Arc<dyn Notifier>,
        publish_batch_size: usize,
    ) -> Self {
        Self {
            store,
            notifier,
            publish_batch_size: publish_batch_size.max(1),
        }
    }

    /// Generate load files for the batch. Returns the emitted ids sorted
    /// ascending; fails with [`Error::NoLoadFilesGenerated`] when every
    /// batch came back empty or aborted.
    #[instrument(
        skip_all,
        fields(upload_id = %upload.id, staging_files = staging_files.len())
    )]
    pub(crate) async fn create_load_files(
        &self,
        upload: &UploadModel,
        warehouse: &Warehouse,
        upload_schema: &Schema,
        staging_files: &[StagingFileModel],
    ) -> Result<Vec<i64>> {
        let staging_ids: Vec<i64> = staging_files.iter().map(|f| f.id).collect();
        self.store
            .set_staging_files_status(&staging_ids, StagingFileStatus::Executing, None)
            .await?;

        // Tags every load file emitted for this invocation, so workers can
        // distinguish re-runs of the same staging files.
        let load_gen_id = Uuid::new_v4().to_string();

        let mut pending = Vec::new();
        for chunk in staging_files.chunks(self.publish_batch_size) {
            let messages = chunk
                .iter()
                .map(|staging_file| self.message_for(upload, warehouse, upload_schema, staging_file, &load_gen_id))
                .collect::<Result<Vec<NotifierMessage>>>()?;

            debug!(
                batch_size = messages.len(),
                warehouse = %warehouse.identifier(),
                "Publishing staging-file batch to notifier"
            );
            let receiver = self
                .notifier
                .publish(messages)
                .await
                .map_err(|e| Error::Notifier(e.to_string()))?;
            pending.push((chunk[0].id, chunk[chunk.len() - 1].id, receiver));
        }

        // Every batch is in flight; collect replies concurrently.
        let collected: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (first_id, last_id, receiver) in pending {
            let collected = Arc::clone(&collected);
            handles.push(tokio::spawn(async move {
                let responses = match receiver.await {
                    Ok(responses) => responses,
                    Err(_) => {
                        warn!(
                            first_staging_file_id = first_id,
                            last_staging_file_id = last_id,
                            "Notifier reply channel closed without a response"
                        );
                        return;
                    }
                };
                debug!(
                    first_staging_file_id = first_id,
                    last_staging_file_id = last_id,
                    responses = responses.len(),
                    "Received notifier responses for staging-file batch"
                );
                for response in responses {
                    if response.status == RESPONSE_ABORTED {
                        error!(
                            error = response.error.as_deref().unwrap_or("unknown"),
                            "Worker aborted load-file generation"
                        );
                        continue;
                    }
                    match response.load_file_ids() {
                        Some(ids) => {
                            let mut collected =
                                collected.lock().expect("load file id lock poisoned");
                            collected.extend(ids);
                        }
                        None => warn!("Worker response carried no load-file ids"),
                    }
                }
            }));
        }
        for handle in handles {
            if handle.await.is_err() {
                return Err(Error::InternalProcessing(
                    "load-file response collector panicked".to_string(),
                ));
            }
        }

        let mut load_file_ids = Arc::try_unwrap(collected)
            .map_err(|_| Error::InternalProcessing("load file id collector still shared".to_string()))?
            .into_inner()
            .expect("load file id lock poisoned");
        load_file_ids.sort_unstable();

        if load_file_ids.is_empty() {
            self.store
                .set_staging_files_status(
                    &staging_ids,
                    StagingFileStatus::Failed,
                    Some("no load files generated"),
                )
                .await?;
            return Err(Error::NoLoadFilesGenerated);
        }

        self.store
            .set_staging_files_status(&staging_ids, StagingFileStatus::Succeeded, None)
            .await?;
        Ok(load_file_ids)
    }

    fn message_for(
        &self,
        upload: &UploadModel,
        warehouse: &Warehouse,
        upload_schema: &Schema,
        staging_file: &StagingFileModel,
        load_gen_id: &str,
    ) -> Result<NotifierMessage> {
        let payload = NotifierPayload {
            upload_id: upload.id,
            staging_file_id: staging_file.id,
            staging_file_location: staging_file.location.clone(),
            schema: upload_schema.clone(),
            source_id: warehouse.source.id.clone(),
            source_name: warehouse.source.name.clone(),
            destination_id: warehouse.destination.id.clone(),
            destination_name: warehouse.destination.name.clone(),
            destination_type: warehouse.destination_type.to_string(),
            destination_config: warehouse.destination.config.clone(),
            unique_load_gen_id: load_gen_id.to_string(),
        };
        let payload = serde_json::to_value(&payload)
            .map_err(|e| Error::InternalProcessing(format!("payload serialisation: {}", e)))?;
        Ok(NotifierMessage { payload })
    }
}
