pub mod sqlite;
pub mod trait_def;

pub use sqlite::{SqliteMirrorStore, SqliteRawStore, SqliteTotalsStore};
pub use trait_def::{MirrorStore, RawStore, StorageError, StorageResult, TotalsStore};
