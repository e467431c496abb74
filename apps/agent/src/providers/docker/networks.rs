//! Per-interface Docker networks backed by the OVS plugin driver.
//!
//! Each lab gets one Docker network per data interface (`{lab}-eth1` ..
//! `{lab}-ethN`), all carrying the plugin driver plus the lab/interface
//! generic options the driver records in NetworkState.

use anyhow::{Context, Result};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use std::collections::HashMap;

use crate::plugin::PLUGIN_NAME;

pub fn lab_network_name(lab_id: &str, interface: &str) -> String {
    let prefix: String = lab_id.chars().take(12).collect();
    format!("{prefix}-{interface}")
}

/// Create the lab's interface networks `eth1..=count`. Existing networks are
/// kept (idempotent re-deploy).
pub async fn create_lab_networks(docker: &Docker, lab_id: &str, count: u32) -> Result<Vec<String>> {
    let existing = list_lab_networks(docker, lab_id).await?;
    let mut names = Vec::new();
    for index in 1..=count {
        let interface = format!("eth{index}");
        let name = lab_network_name(lab_id, &interface);
        if existing.contains_key(&name) {
            names.push(name);
            continue;
        }
        let mut options = HashMap::new();
        options.insert("lab_id", lab_id);
        options.insert("interface_name", interface.as_str());
        docker
            .create_network(CreateNetworkOptions {
                name: name.as_str(),
                driver: PLUGIN_NAME,
                options,
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to create network {name}"))?;
        names.push(name);
    }
    Ok(names)
}

/// Map of network name -> network id for every lab-scoped network.
pub async fn list_lab_networks(docker: &Docker, lab_id: &str) -> Result<HashMap<String, String>> {
    let prefix: String = lab_id.chars().take(12).collect();
    let networks = docker
        .list_networks(None::<ListNetworksOptions<String>>)
        .await?;
    Ok(networks
        .into_iter()
        .filter_map(|net| {
            let name = net.name?;
            let id = net.id?;
            if name.starts_with(&format!("{prefix}-eth")) {
                Some((name, id))
            } else {
                None
            }
        })
        .collect())
}

/// Delete every lab-scoped Docker network. Containers must be gone first.
pub async fn delete_lab_networks(docker: &Docker, lab_id: &str) -> Result<usize> {
    let mut removed = 0;
    for (name, _) in list_lab_networks(docker, lab_id).await? {
        match docker.remove_network(&name).await {
            Ok(()) => removed += 1,
            Err(err) => tracing::warn!(network = %name, error = %err, "failed to remove lab network"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_names_truncate_lab_id() {
        let name = lab_network_name("0123456789abcdefffff", "eth3");
        assert_eq!(name, "0123456789ab-eth3");
    }
}
