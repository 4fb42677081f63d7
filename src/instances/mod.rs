//! Instance file pair.
//!
//! Each persisted collection (one CIM class in one namespace) owns an index
//! file describing where every instance lives and a data file holding the
//! encoded instance bytes. The two files are independent resources; only the
//! [`Compactor`](crate::compactor::Compactor) and the façade's call ordering
//! tie them together.

mod data;
mod index;

pub use data::DataStore;
pub use index::IndexStore;

use std::path::{Path, PathBuf};

/// `path` with `suffix` appended to the file name (`a.idx` -> `a.idx.tmp`).
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
