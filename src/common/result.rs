use crate::common::error::FleetError;

/// Result alias used across the crate.
///
/// # Examples
///
/// ```
/// use repofleet::common::result::FleetResult;
/// use repofleet::common::error::FleetError;
///
/// fn example_function() -> FleetResult<String> {
///     Ok("success".to_string())
/// }
///
/// fn example_with_error() -> FleetResult<()> {
///     Err(FleetError::internal_error("Something went wrong"))
/// }
/// ```
pub type FleetResult<T> = Result<T, FleetError>;

/// Conversions from `Option` into `FleetResult`.
pub trait OptionExt<T> {
    fn ok_or_internal_error(self, message: impl Into<String>) -> FleetResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_internal_error(self, message: impl Into<String>) -> FleetResult<T> {
        self.ok_or_else(|| FleetError::internal_error(message))
    }
}

/// Conversions from I/O results into `FleetResult`.
pub trait ResultExt<T> {
    /// Wrap an I/O failure with a message and the path it concerned.
    ///
    /// # Examples
    ///
    /// ```
    /// use repofleet::common::result::{FleetResult, ResultExt};
    ///
    /// let result: Result<String, std::io::Error> = Err(std::io::Error::new(
    ///     std::io::ErrorKind::NotFound, "file not found"
    /// ));
    /// let fleet_result: FleetResult<String> = result.with_filesystem_error("read failed", None);
    /// assert!(fleet_result.is_err());
    /// ```
    fn with_filesystem_error(
        self,
        message: impl Into<String>,
        path: Option<std::path::PathBuf>,
    ) -> FleetResult<T>;
}

impl<T> ResultExt<T> for std::io::Result<T> {
    fn with_filesystem_error(
        self,
        message: impl Into<String>,
        path: Option<std::path::PathBuf>,
    ) -> FleetResult<T> {
        self.map_err(|e| FleetError::filesystem_error_with_source(message, path, e))
    }
}
