use std::path::PathBuf;

use burrow_db::{
    utils, Database, DbFlags, DbParams, EnvFlags, EnvParams, Environment,
};
use tempfile::TempDir;

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Creating a scratch directory for the data file.
pub fn setup() -> TempDir {
    utils::init_log();
    TempDir::new().unwrap()
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.db")
}

/// Create an environment with one database named 1, using the default
/// parameters.
pub fn create_simple(dir: &TempDir) -> (Environment, Database) {
    let env = Environment::create(db_path(dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let db = env
        .create_db(1, DbFlags::empty(), &DbParams::default())
        .unwrap();
    (env, db)
}

/// Reopen the environment and database created by `create_simple`.
pub fn open_simple(dir: &TempDir, flags: EnvFlags) -> (Environment, Database) {
    let env = Environment::open(db_path(dir), flags, &EnvParams::default()).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    (env, db)
}

/// Big-endian encoded integer key, handy for ordered scans.
pub fn int_key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}
