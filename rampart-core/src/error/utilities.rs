use crate::{Error, error::StorageError};

/// Extension trait for serde results produced when records are persisted as JSON.
///
/// Storage backends use this to turn encoding failures into rampart storage
/// errors without repeating the conversion at every call site.
///
/// # Example
///
/// ```rust,ignore
/// use rampart_core::error::utilities::SerializationResultExt;
///
/// let json = serde_json::to_string(&record).map_serialization_err()?;
/// ```
pub trait SerializationResultExt<T> {
    fn map_serialization_err(self) -> Result<T, Error>;
}

impl<T> SerializationResultExt<T> for Result<T, serde_json::Error> {
    fn map_serialization_err(self) -> Result<T, Error> {
        self.map_err(|e| Error::Storage(StorageError::Serialization(e.to_string())))
    }
}
