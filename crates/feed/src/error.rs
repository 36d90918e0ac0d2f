use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FeedError {
    #[snafu(display("feed transport unavailable on `{stage}`: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("feed denied access to collection '{collection}' on `{stage}`"))]
    PermissionDenied {
        stage: &'static str,
        collection: String,
    },
    #[snafu(display("feed rejected write to collection '{collection}': {details}"))]
    Rejected {
        stage: &'static str,
        collection: String,
        details: String,
    },
    #[snafu(display("feed document '{id}' was not found in '{collection}'"))]
    NotFound {
        stage: &'static str,
        collection: String,
        id: String,
    },
    #[snafu(display("feed id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("feed listener for '{collection}' was closed by the store"))]
    ListenerClosed {
        stage: &'static str,
        collection: String,
    },
}

impl FeedError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Unavailable { stage, .. }
            | Self::PermissionDenied { stage, .. }
            | Self::Rejected { stage, .. }
            | Self::NotFound { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::ListenerClosed { stage, .. } => stage,
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
