use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use pa_common::graph::{GraphError, GraphStore, RecommendationEdge, VisitorFlags};
use serde_json::json;

/// Graph-store stand-in for batch runs: serializes every upsert operation as
/// one JSON line, for the external graph loader to apply. Keeps the engine
/// decoupled from the database while preserving the operation stream.
pub struct OpLogStore {
    path: PathBuf,
    /// Graph property name carrying the control flag, from the control
    /// group configuration.
    control_property: String,
    writer: BufWriter<File>,
}

impl OpLogStore {
    pub fn create(path: &Path, control_property: &str) -> anyhow::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            control_property: control_property.to_string(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn write_op(&mut self, op: serde_json::Value) -> Result<(), GraphError> {
        serde_json::to_writer(&mut self.writer, &op)
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| GraphError::Unavailable(e.to_string()))
    }
}

impl GraphStore for OpLogStore {
    fn upsert_visitor_flags(
        &mut self,
        visitor_id: &str,
        flags: &VisitorFlags,
    ) -> Result<(), GraphError> {
        let mut op = serde_json::Map::new();
        op.insert("op".into(), json!("upsert_visitor_flags"));
        op.insert("visitor_id".into(), json!(visitor_id));
        op.insert("has_recommendation".into(), json!(flags.has_recommendation));
        op.insert(self.control_property.clone(), json!(flags.control_group));
        op.insert("generated_at".into(), json!(flags.generated_at.to_rfc3339()));
        self.write_op(serde_json::Value::Object(op))
    }

    fn upsert_recommendation_edge(&mut self, edge: &RecommendationEdge) -> Result<(), GraphError> {
        self.write_op(json!({
            "op": "upsert_recommendation_edge",
            "visitor_id": edge.visitor_id,
            "session_id": edge.session_id,
            "score": edge.score,
            "generated_at": edge.generated_at.to_rfc3339(),
        }))
    }

    fn delete_existing_recommendation_edges(
        &mut self,
        visitor_id: &str,
    ) -> Result<(), GraphError> {
        self.write_op(json!({
            "op": "delete_existing_recommendation_edges",
            "visitor_id": visitor_id,
        }))
    }
}
