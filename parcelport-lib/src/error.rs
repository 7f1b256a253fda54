use syscalls::Errno;

use crate::api::Locality;

pub type Result<T> = std::result::Result<T, ParcelportError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ParcelportError {
    #[error("{0}")]
    Fabric(#[from] FabricError),
    #[error("CompletionError: {0}")]
    Completion(FabricError),
    #[error("RegistrationError: {0}")]
    Registration(String),
    #[error(
        "HeaderOverflow: {num_chunks} chunk descriptors need {needed} bytes, header budget is {budget}"
    )]
    HeaderOverflow { num_chunks: usize, needed: usize, budget: usize },
    #[error("Unknown locality {0}")]
    UnknownLocality(Locality),
    #[error("Stale handle: slot {index} generation {generation}")]
    StaleHandle { index: u32, generation: u32 },
    #[error("Parcelport stopped")]
    Stopped,
    #[error("{0}")]
    Errno(#[from] Errno),
    #[error("ParcelportError: {0}")]
    Custom(&'static str),
}

pub const FI_EAGAIN: i32 = 11;
pub const FI_EINVAL: i32 = 22;
pub const FI_EACCES: i32 = 13;
pub const FI_ENOENT: i32 = 2;
pub const FI_ETRUNC: i32 = 265;
pub const FI_ECANCELED: i32 = 125;

/// A provider return code. Provider calls report errors as negative codes,
/// `code` stores the magnitude.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FabricError {
    pub code: i32,
    pub context: &'static str,
}

impl FabricError {
    pub fn new(code: i32, context: &'static str) -> Self {
        Self { code: code.abs(), context }
    }

    pub fn again(context: &'static str) -> Self {
        Self::new(FI_EAGAIN, context)
    }

    pub fn is_again(&self) -> bool {
        self.code == FI_EAGAIN
    }

    fn describe(&self) -> &'static str {
        match self.code {
            FI_EAGAIN => "Resource temporarily unavailable",
            FI_EINVAL => "Invalid argument",
            FI_EACCES => "Permission denied",
            FI_ENOENT => "No such file or directory",
            FI_ETRUNC => "Truncation error",
            FI_ECANCELED => "Operation canceled",
            _ => "Unknown error",
        }
    }
}

impl std::fmt::Display for FabricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FabricError: code {} ({}), context: {}",
            self.code,
            self.describe(),
            self.context
        )
    }
}

impl std::error::Error for FabricError {}
