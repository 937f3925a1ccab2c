#[derive(snafu::Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("SerializationError: {source}"))]
    SerializationError { source: serde_json::Error },

    #[snafu(display("{msg}: {source}"))]
    KubeError { msg: String, source: kube::Error },

    #[snafu(display("Finalizer Error: {source}"))]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError {
        #[snafu(source(from(kube::runtime::finalizer::Error<AppError>, Box::new)))]
        source: Box<kube::runtime::finalizer::Error<AppError>>,
    },

    #[snafu(display("{msg}: {source}"))]
    BackendError { msg: String, source: object_store::Error },

    #[snafu(display("invalid size: {size}"))]
    InvalidSize { size: i64 },

    #[snafu(display("requested size too large: {size} exceeds maximum allowable"))]
    SizeTooLarge { size: i64 },

    #[snafu(display("unknown snapshotting phase: {phase}"))]
    UnknownPhase { phase: String },

    #[snafu(display("{kind} {name} is missing {field}"))]
    MissingField { kind: &'static str, name: String, field: &'static str },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        backtrace: snafu::Backtrace,
    },
}

impl AppError {
    pub fn metric_label(&self) -> String {
        match self {
            Self::SerializationError { .. } => "serialization",
            Self::KubeError { .. } => "kube",
            Self::FinalizerError { .. } => "finalizer",
            Self::BackendError { .. } => "backend",
            Self::InvalidSize { .. } | Self::SizeTooLarge { .. } => "size",
            Self::UnknownPhase { .. } => "unknown_phase",
            Self::MissingField { .. } => "missing_field",
            Self::Whatever { .. } => "other",
        }
        .to_string()
    }

    /// True when the error is the API server reporting the object doesn't exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KubeError { source, .. } if crate::snapshotting::is_not_found(source))
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
