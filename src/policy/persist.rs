//! Parameter file format.
//!
//! One file per parameter set: a JSON schema header (version counter, state
//! and action dims, layer shapes) followed by the flat little-endian f32
//! weight blob. Writers go through a temp path and rename so a crashed save
//! never leaves a torn file; loaders refuse any schema mismatch instead of
//! reinterpreting bytes.

use crate::policy::network::Network;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"MOBW";
const FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaHeader {
    pub format: u32,
    /// Trainer version counter at save time.
    pub version: u64,
    pub state_dim: usize,
    pub action_dim: usize,
    pub layer_shapes: Vec<(usize, usize)>,
}

pub fn save_params(path: &Path, net: &Network, version: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let header = SchemaHeader {
        format: FORMAT,
        version,
        state_dim: net.state_dim,
        action_dim: net.action_dim,
        layer_shapes: net.layer_shapes(),
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let flat = net.to_flat();

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(MAGIC)?;
        file.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&header_bytes)?;
        let mut blob = Vec::with_capacity(flat.len() * 4);
        for w in &flat {
            blob.extend_from_slice(&w.to_le_bytes());
        }
        file.write_all(&blob)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

pub fn load_params(
    path: &Path,
    expected_state_dim: usize,
    expected_action_dim: usize,
) -> Result<(Network, u64)> {
    let mut file =
        fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        anyhow::bail!("{} is not a parameter file", path.display());
    }
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > 64 * 1024 {
        anyhow::bail!("parameter header in {} is implausibly large", path.display());
    }
    let mut header_bytes = vec![0u8; header_len];
    file.read_exact(&mut header_bytes)?;
    let header: SchemaHeader = serde_json::from_slice(&header_bytes)
        .with_context(|| format!("parse schema header of {}", path.display()))?;

    if header.format != FORMAT {
        anyhow::bail!(
            "unsupported parameter format {} in {}",
            header.format,
            path.display()
        );
    }
    if header.state_dim != expected_state_dim || header.action_dim != expected_action_dim {
        anyhow::bail!(
            "parameter schema mismatch in {}: file is {}x{}, run expects {}x{}",
            path.display(),
            header.state_dim,
            header.action_dim,
            expected_state_dim,
            expected_action_dim
        );
    }

    let mut blob = Vec::new();
    file.read_to_end(&mut blob)?;
    if blob.len() % 4 != 0 {
        anyhow::bail!("truncated weight blob in {}", path.display());
    }
    let flat: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let net = Network::from_flat(header.state_dim, header.action_dim, &flat)?;
    if net.layer_shapes() != header.layer_shapes {
        anyhow::bail!(
            "layer shapes in {} do not match this build's architecture",
            path.display()
        );
    }
    Ok((net, header.version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn net(state_dim: usize, action_dim: usize) -> Network {
        let mut rng = StdRng::seed_from_u64(11);
        Network::init(state_dim, action_dim, &mut rng)
    }

    #[test]
    fn save_load_round_trip_is_bit_identical() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("shared.mobw");
        let original = net(32, 8);
        save_params(&path, &original, 17).expect("save");
        let (loaded, version) = load_params(&path, 32, 8).expect("load");
        assert_eq!(version, 17);
        assert_eq!(original.to_flat(), loaded.to_flat());
    }

    #[test]
    fn mismatched_dims_are_refused() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("shared.mobw");
        save_params(&path, &net(32, 8), 1).expect("save");
        assert!(load_params(&path, 64, 8).is_err());
        assert!(load_params(&path, 32, 9).is_err());
    }

    #[test]
    fn garbage_file_is_refused_cleanly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("junk.mobw");
        std::fs::write(&path, b"not a parameter file at all").expect("write");
        assert!(load_params(&path, 32, 8).is_err());
    }

    #[test]
    fn truncated_blob_is_refused() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("shared.mobw");
        save_params(&path, &net(16, 4), 1).expect("save");
        let bytes = std::fs::read(&path).expect("read");
        std::fs::write(&path, &bytes[..bytes.len() - 5]).expect("truncate");
        assert!(load_params(&path, 16, 4).is_err());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("shared.mobw");
        save_params(&path, &net(16, 4), 1).expect("save");
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["shared.mobw".to_string()]);
    }
}
