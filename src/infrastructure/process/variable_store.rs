//! Variable store adapter
//!
//! Variables are written as one record per (instance, object, writer); each
//! write replaces that writer's previous record wholesale. Reads merge all
//! records of the requested scope in write order, filtered by visibility.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::domain::process::variable::{merge_records, to_values};
use crate::domain::process::{
    EngineError, InstanceId, ProcessRepository, Variable, VariableRecord, WorkId,
};

#[derive(Debug, Clone)]
pub struct VariableStore {
    repository: Arc<dyn ProcessRepository>,
}

impl VariableStore {
    pub fn new(repository: Arc<dyn ProcessRepository>) -> Self {
        Self { repository }
    }

    /// Replace everything `writer` stored on `object_id`
    pub async fn write(
        &self,
        instance_id: &InstanceId,
        object_id: &str,
        writer: &str,
        variables: Vec<Variable>,
    ) -> Result<VariableRecord, EngineError> {
        debug!(
            instance_id = %instance_id,
            object_id = %object_id,
            writer = %writer,
            count = variables.len(),
            "Writing variables"
        );
        let record = VariableRecord::new(instance_id.clone(), object_id, writer, variables);
        Ok(self.repository.write_variables(record).await?)
    }

    /// Write plain values, skipping the call when there is nothing to store
    pub async fn write_values(
        &self,
        instance_id: &InstanceId,
        object_id: &str,
        writer: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        if values.is_empty() {
            return Ok(());
        }
        self.write(instance_id, object_id, writer, Variable::from_map(values))
            .await?;
        Ok(())
    }

    /// Merged variables of one object, or of the whole instance
    pub async fn read(
        &self,
        instance_id: &InstanceId,
        object_id: Option<&str>,
        viewer: Option<&str>,
    ) -> Result<BTreeMap<String, Variable>, EngineError> {
        let records = self.repository.read_variables(instance_id, object_id).await?;
        Ok(merge_records(&records, viewer))
    }

    /// Instance-wide values as seen by the engine itself
    pub async fn values(&self, instance_id: &InstanceId) -> Result<BTreeMap<String, Value>, EngineError> {
        Ok(to_values(&self.read(instance_id, None, None).await?))
    }

    /// Drop non-durable variables written on the given works
    pub async fn purge_works(
        &self,
        instance_id: &InstanceId,
        work_ids: &[WorkId],
    ) -> Result<usize, EngineError> {
        if work_ids.is_empty() {
            return Ok(0);
        }
        let objects: Vec<String> = work_ids.iter().map(|w| w.as_str().to_string()).collect();
        Ok(self.repository.purge_variables(instance_id, &objects).await?)
    }
}
