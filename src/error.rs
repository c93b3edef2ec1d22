use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("document store quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("write batch holds {ops} operations (max {max})")]
    BatchTooLarge { ops: usize, max: usize },

    #[error("could not decode document at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode document at {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("document store error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    StoreUnavailable,
    QuotaExceeded,
    IngestionFailure,
}

impl ErrorClass {
    pub fn status(self) -> u16 {
        match self {
            ErrorClass::Validation => 400,
            ErrorClass::StoreUnavailable => 503,
            ErrorClass::QuotaExceeded => 429,
            ErrorClass::IngestionFailure => 500,
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Validation => 2,
            ErrorClass::StoreUnavailable => 3,
            ErrorClass::QuotaExceeded => 4,
            ErrorClass::IngestionFailure => 1,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, ErrorClass::StoreUnavailable | ErrorClass::QuotaExceeded)
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid {field}: {value} (expected {min}-{max})")]
    InvalidField {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("no file uploaded")]
    MissingFile,

    #[error("missing required columns")]
    MissingColumns {
        required: Vec<String>,
        found: Vec<String>,
    },

    #[error("csv has no data rows")]
    EmptyInput,

    #[error("malformed csv: {0}")]
    MalformedCsv(#[from] csv::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ingestion failed: {0}")]
    Failure(#[from] anyhow::Error),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::InvalidField { .. }
            | IngestError::MissingFile
            | IngestError::MissingColumns { .. }
            | IngestError::EmptyInput
            | IngestError::MalformedCsv(_) => ErrorClass::Validation,
            IngestError::Store(StoreError::Unavailable(_)) => ErrorClass::StoreUnavailable,
            IngestError::Store(StoreError::QuotaExceeded(_)) => ErrorClass::QuotaExceeded,
            IngestError::Store(_) | IngestError::Failure(_) => ErrorClass::IngestionFailure,
        }
    }

    pub fn body(&self) -> serde_json::Value {
        match self {
            IngestError::MissingColumns { required, found } => json!({
                "error": self.to_string(),
                "required": required,
                "found": found,
            }),
            _ => match self.class() {
                ErrorClass::IngestionFailure => json!({ "error": "upload failed" }),
                _ => json!({ "error": self.to_string() }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_map_to_http_statuses() {
        let validation = IngestError::EmptyInput;
        assert_eq!(validation.class(), ErrorClass::Validation);
        assert_eq!(validation.class().status(), 400);

        let unavailable = IngestError::Store(StoreError::Unavailable("pool timed out".into()));
        assert_eq!(unavailable.class().status(), 503);
        assert!(unavailable.class().retryable());

        let quota = IngestError::Store(StoreError::QuotaExceeded("too many connections".into()));
        assert_eq!(quota.class().status(), 429);

        let failure = IngestError::Failure(anyhow::anyhow!("boom"));
        assert_eq!(failure.class().status(), 500);
        assert!(!failure.class().retryable());
    }

    #[test]
    fn missing_columns_body_lists_headers() {
        let err = IngestError::MissingColumns {
            required: vec!["externalId".into(), "rollClass".into(), "pctPresent".into()],
            found: vec!["Name".into()],
        };
        let body = err.body();
        assert_eq!(body["error"], "missing required columns");
        assert_eq!(body["required"][1], "rollClass");
        assert_eq!(body["found"][0], "Name");
    }

    #[test]
    fn internal_failures_hide_detail() {
        let err = IngestError::Failure(anyhow::anyhow!("secret connection string"));
        assert_eq!(err.body(), json!({ "error": "upload failed" }));
    }
}
