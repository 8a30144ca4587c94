//! Trait that every value stored in the managed cache must implement.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Type names that are never accepted as cache values.
///
/// Caching a bare primitive wastes the `{tag}-{type}-{key}` namespace: two
/// unrelated callers caching a `u64` under the same key would collide.
const PRIMITIVE_TYPES: &[&str] = &[
    "bool", "char", "str", "String", "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16",
    "u32", "u64", "u128", "usize", "f32", "f64", "()",
];

/// A value that can live in both cache tiers.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use coord_kit::CacheValue;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct Session {
///     pub user_id: String,
///     pub device: String,
/// }
///
/// impl CacheValue for Session {}
///
/// assert_eq!(Session::type_name(), "Session");
/// ```
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name used as the middle segment of the fully-qualified key.
    ///
    /// Defaults to the last path segment of the Rust type name, so
    /// `my_app::model::Session` becomes `Session`. Override when two types
    /// with the same short name share one cache.
    fn type_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Reject primitive and trait-object values before touching any tier.
///
/// This is a configuration error and is never retried.
pub fn guard<T: CacheValue>() -> Result<()> {
    let full = std::any::type_name::<T>();
    let name = T::type_name();

    if full.contains("dyn ") || name.contains("dyn ") {
        return Err(Error::ConfigError(format!(
            "Trait object type {} cannot be cached: its concrete type would be lost",
            full
        )));
    }
    if PRIMITIVE_TYPES.contains(&name) || PRIMITIVE_TYPES.contains(&full) {
        return Err(Error::ConfigError(format!(
            "Primitive type {} cannot be cached; wrap it in a named type",
            full
        )));
    }
    if name.is_empty() {
        return Err(Error::ConfigError(format!(
            "Cache type name for {} is empty",
            full
        )));
    }
    Ok(())
}

fn short_type_name(full: &'static str) -> &'static str {
    // Generic arguments can contain `::` themselves; only strip the path of
    // the outer type.
    let outer_end = full.find('<').unwrap_or(full.len());
    let start = full[..outer_end].rfind("::").map(|i| i + 2).unwrap_or(0);
    &full[start..]
}

// ============================================================================
// Generic implementations for collections of cacheable values
// ============================================================================

impl<T: CacheValue> CacheValue for Vec<T> {}

impl<T: CacheValue> CacheValue for Option<T> {}
