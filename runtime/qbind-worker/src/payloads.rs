use qbind_db::{Credentials, ParameterDescriptor, QueryOptions, QueryRequest};
use serde::{Deserialize, Serialize};

/// Payload of a `query` request: where to connect and what to run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryPayload {
    #[serde(default)]
    pub credentials: Credentials,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<ParameterDescriptor>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryPayload {
    pub fn into_parts(self) -> (Credentials, QueryRequest) {
        let request = QueryRequest {
            sql: self.sql,
            params: self.params,
            options: self.options,
        };
        (self.credentials, request)
    }
}
