//! Small shared helpers.

/// Crop a Bitcoin address or extended key for log output.
///
/// Shows the first and last six characters: `bc1qwa...y2qpqy`. Addresses are
/// never logged in full.
pub fn crop(value: &str) -> String {
    if value.len() <= 12 {
        return value.to_string();
    }
    format!("{}...{}", &value[..6], &value[value.len() - 6..])
}
