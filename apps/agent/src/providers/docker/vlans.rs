//! Per-lab VLAN allocation snapshots under `{workspace}/vlans/{lab}.json`.
//!
//! A redeploy after an agent restart must not retag interfaces that live
//! containers still use, so deploys first recover these allocations and
//! prune entries whose containers no longer exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabVlanFile {
    /// container name -> interface -> vlan tag
    #[serde(default)]
    pub allocations: HashMap<String, HashMap<String, u16>>,
    #[serde(default)]
    pub next_vlan: u16,
}

fn vlans_dir(workspace: &Path) -> PathBuf {
    workspace.join("vlans")
}

fn lab_file(workspace: &Path, lab_id: &str) -> PathBuf {
    vlans_dir(workspace).join(format!("{lab_id}.json"))
}

pub fn save(workspace: &Path, lab_id: &str, file: &LabVlanFile) -> Result<()> {
    let dir = vlans_dir(workspace);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = lab_file(workspace, lab_id);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn load(workspace: &Path, lab_id: &str) -> Result<Option<LabVlanFile>> {
    let path = lab_file(workspace, lab_id);
    let body = match std::fs::read(&path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    Ok(Some(serde_json::from_slice(&body).with_context(|| {
        format!("corrupt vlan file {}", path.display())
    })?))
}

pub fn remove(workspace: &Path, lab_id: &str) {
    let _ = std::fs::remove_file(lab_file(workspace, lab_id));
}

/// Drop allocations whose containers no longer exist. Returns how many
/// entries were pruned.
pub fn prune<F: Fn(&str) -> bool>(file: &mut LabVlanFile, container_exists: F) -> usize {
    let before = file.allocations.len();
    file.allocations.retain(|container, _| container_exists(container));
    before - file.allocations.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = LabVlanFile::default();
        file.next_vlan = 150;
        file.allocations
            .entry("archetype-lab1-r1".into())
            .or_default()
            .insert("eth1".into(), 120);
        save(dir.path(), "lab1", &file).unwrap();

        let loaded = load(dir.path(), "lab1").unwrap().unwrap();
        assert_eq!(loaded.next_vlan, 150);
        assert_eq!(loaded.allocations["archetype-lab1-r1"]["eth1"], 120);
    }

    #[test]
    fn prune_drops_dead_containers() {
        let mut file = LabVlanFile::default();
        file.allocations.insert("alive".into(), HashMap::new());
        file.allocations.insert("dead".into(), HashMap::new());
        let pruned = prune(&mut file, |name| name == "alive");
        assert_eq!(pruned, 1);
        assert!(file.allocations.contains_key("alive"));
        assert!(!file.allocations.contains_key("dead"));
    }

    #[test]
    fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), "nope").unwrap().is_none());
    }
}
