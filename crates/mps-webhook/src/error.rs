use mps_schemas::WebhookStatus;
use uuid::Uuid;

/// Rejections and failures of the ingestion path. Each maps to one HTTP
/// status; see [`IngestError::http_status`].
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    #[error("tenant not resolvable from payload")]
    UnknownTenant,

    #[error("signature required for tenant {0}")]
    SignatureRequired(String),

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("webhook event {0} not found")]
    NotFound(Uuid),

    #[error("webhook event {id} is {status} and cannot be retried")]
    NotRetryable { id: Uuid, status: &'static str },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IngestError {
    pub fn http_status(&self) -> u16 {
        match self {
            IngestError::PayloadTooLarge { .. }
            | IngestError::Malformed(_)
            | IngestError::MissingHeader(_) => 400,
            IngestError::SignatureRequired(_) | IngestError::SignatureInvalid => 401,
            IngestError::UnknownTenant | IngestError::NotFound(_) => 404,
            IngestError::NotRetryable { .. } => 409,
            IngestError::Internal(_) => 500,
        }
    }

    pub(crate) fn not_retryable(id: Uuid, status: WebhookStatus) -> Self {
        IngestError::NotRetryable {
            id,
            status: status.as_str(),
        }
    }
}
