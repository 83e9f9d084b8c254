//! Optional process-wide default engine
//!
//! Libraries that cannot thread an `Arc<Engine>` through their APIs can use
//! the default instance instead. It exists only between [`init`] and
//! [`teardown`].

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::Engine;
use crate::error::{Error, Result};

static GLOBAL: Lazy<RwLock<Option<Arc<Engine>>>> = Lazy::new(|| RwLock::new(None));

/// Install `engine` as the default instance
pub fn init(engine: Arc<Engine>) -> Result<()> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(Error::Config(
            "global engine is already initialized".to_string(),
        ));
    }
    *global = Some(engine);
    Ok(())
}

/// The default instance, if initialized
pub fn get() -> Option<Arc<Engine>> {
    GLOBAL.read().clone()
}

/// Remove the default instance and shut it down
pub fn teardown() {
    let engine = GLOBAL.write().take();
    if let Some(engine) = engine {
        engine.shutdown();
    }
}
