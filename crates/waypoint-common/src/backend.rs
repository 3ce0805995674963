//! Storage backend contract
//!
//! The minimal capability set every engine implements. The registry layer
//! and any other collaborator only ever talk to engines through these
//! traits.

use crate::codec::{self, ValueDecoder};
use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Visitor passed to [`Store::each`]. Returning `Ok(false)` stops the
/// iteration without error; returning `Err` stops it and surfaces the error.
pub type Visitor<'v> = dyn FnMut(&str, ValueDecoder<'_>) -> Result<bool> + 'v;

/// A named collection of entries.
///
/// Implementations must be safe for concurrent use from many threads. After
/// `close` every operation fails with [`Error::StoreClosed`].
pub trait Store: Send + Sync {
    /// Name the store was opened under
    fn name(&self) -> &str;

    fn has(&self, key: &str) -> Result<bool>;

    /// Fetch the stored value. Missing keys yield [`Error::KeyUnknown`].
    fn get_value(&self, key: &str) -> Result<Value>;

    /// Insert or fully replace the value under `key`.
    fn set_value(&self, key: &str, value: Value) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Visit every entry in an order that is stable for the duration of the
    /// call. The visitor must not call back into the same store.
    fn each(&self, visit: &mut Visitor<'_>) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Typed convenience layer over [`Store`]
pub trait StoreExt: Store {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        codec::decode(self.get_value(key)?)
    }

    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set_value(key, codec::encode(value)?)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// A storage engine able to open stores by name.
pub trait Backend: Send + Sync + 'static {
    type Store: Store + 'static;

    /// Open or create the named store.
    fn access(&self, name: &str) -> Result<Arc<Self::Store>>;

    /// Close every store this backend still owns and stop its background
    /// work. Blocks until maintenance tasks have stopped.
    fn close(&self) -> Result<()>;
}

/// Store names become file or directory names, so they must not escape the
/// engine's root directory.
pub fn validate_store_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::access_failed(name, "store name is empty"));
    }
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(Error::access_failed(
            name,
            "store name must not start with '.' or contain path separators",
        ));
    }
    Ok(())
}
