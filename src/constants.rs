//! Shared constants used across the application.

/// User agent string used for crawl and download requests.
pub const ARCHIVAL_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Namespace holding one zip bundle per resource, awaiting repack.
pub const UNARCHIVED_DIR: &str = "unarchived";

/// Namespace holding consolidated packs.
pub const PACKS_DIR: &str = "packs";

/// JSON array of every resource id folded into a pack.
pub const ARCHIVED_FILE: &str = "archived.json";

/// JSON array of `{filename, size}` for every pack.
pub const INDEX_FILE: &str = "index.json";

/// Summary table regenerated on every repack.
pub const README_FILE: &str = "README.md";
