use std::sync::{Arc, RwLock};

use crate::error::Error;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type Result<T> = std::result::Result<T, Error>;
pub type DbResult = Result<()>;
