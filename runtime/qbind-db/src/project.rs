use serde::{Deserialize, Serialize};

use crate::{ExecutionResult, ResultEnvelope, Row};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemPayload {
    Result(ResultEnvelope),
    Row(Row),
}

/// One emitted item; `json` holds a single row or the whole result envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    pub json: ItemPayload,
}

/// One item per row, or a single item wrapping the full result.
pub fn project(result: ExecutionResult) -> Vec<OutputItem> {
    match result {
        ExecutionResult::RowSet(rows) => rows
            .into_iter()
            .map(|row| OutputItem {
                json: ItemPayload::Row(row),
            })
            .collect(),
        ExecutionResult::FullResult(envelope) => vec![OutputItem {
            json: ItemPayload::Result(envelope),
        }],
    }
}
