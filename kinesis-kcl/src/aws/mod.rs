pub mod kinesis;

use rusoto_core::Region;

use crate::error::{KclError, Result};

/// Parses a region name, falling back to the environment's default region.
pub fn region(name: Option<&str>) -> Result<Region> {
    match name {
        Some(name) => name.parse::<Region>().map_err(|e| KclError::Config {
            message: e.to_string(),
        }),
        None => Ok(Region::default()),
    }
}
