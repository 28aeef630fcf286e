//! Spin binary image handling.
use std::path::Path;

use anyhow::Result;

use crate::constants::HUB_MEMORY_SIZE;
use crate::protocol::Error;

/// Read a spin binary and check it against the target's limits, before
/// the protocol engine is ever invoked.
pub fn read_spin_binary<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    log::info!("Read {} ({} bytes)", p.display(), raw.len());
    validate_image(&raw)?;
    Ok(raw)
}

/// The image must be long-aligned and fit in hub memory.
pub fn validate_image(image: &[u8]) -> Result<()> {
    anyhow::ensure!(!image.is_empty(), "image is empty");
    if image.len() % 4 != 0 {
        return Err(Error::UnalignedImage { size: image.len() }.into());
    }
    if image.len() > HUB_MEMORY_SIZE {
        return Err(Error::ImageTooLarge {
            size: image.len(),
            max: HUB_MEMORY_SIZE,
        }
        .into());
    }
    Ok(())
}
