pub mod config;
pub mod constants;
pub mod error;
pub mod primitives;

/// Identifier for a block device. Needs to be unique across all devices known to a given
/// partition scheme.
pub type BlockDeviceId = String;

/// Returns true if the given value is equal to its default value.
/// Useful for #[serde(skip_serializing_if = "default")]
#[allow(dead_code)]
fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    *t == Default::default()
}
