//! Host inventory: capacity answers for the controller's resource check
//! and local image availability for the image-sync gate.

use archetype_types::{CapacityRequest, CapacityResponse, ImageCheckResponse};
use axum::extract::Query;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use crate::vendors::vendor_config;

use super::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/capacity", post(capacity))
        .route("/images/check", get(images_check))
}

/// MemAvailable from /proc/meminfo, in MB.
fn available_memory_mb() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

/// Whether this host can take the given device kinds right now. VM kinds
/// dominate the bill; container kinds are charged a small flat footprint.
pub fn capacity_for(kinds: &[String], available_cpus: u32, available_mem_mb: u64) -> CapacityResponse {
    let mut required_cpus = 0u32;
    let mut required_mem_mb = 0u64;
    for kind in kinds {
        let vendor = vendor_config(kind);
        if vendor.vcpus > 0 {
            required_cpus += vendor.vcpus;
            required_mem_mb += vendor.memory_mb;
        } else {
            required_cpus += 1;
            required_mem_mb += 1024;
        }
    }
    CapacityResponse {
        sufficient: required_cpus <= available_cpus && required_mem_mb <= available_mem_mb,
        available_cpus,
        available_mem_mb,
        required_cpus,
        required_mem_mb,
    }
}

async fn capacity(Json(req): Json<CapacityRequest>) -> Json<CapacityResponse> {
    let available_cpus = num_cpus::get() as u32;
    let available_mem_mb = available_memory_mb();
    Json(capacity_for(&req.device_kinds, available_cpus, available_mem_mb))
}

#[derive(Debug, Deserialize)]
struct ImagesQuery {
    #[serde(default)]
    images: String,
}

async fn images_check(
    Extension(st): Extension<AppState>,
    Query(query): Query<ImagesQuery>,
) -> Json<ImageCheckResponse> {
    let images: Vec<String> = query
        .images
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let (mut present, mut missing) = st.docker.images_present(&images).await;

    // qcow2 paths are checked on the filesystem, not in Docker.
    let mut still_missing = Vec::new();
    for image in missing.drain(..) {
        if image.ends_with(".qcow2") && st.libvirt.resolve_base_image(&image).exists() {
            present.push(image);
        } else {
            still_missing.push(image);
        }
    }

    Json(ImageCheckResponse {
        present,
        missing: still_missing,
        syncing: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rejects_oversubscription() {
        // Two N9Kv (4 vcpu / 10 GB each) on an 8-core 16 GB host: memory
        // is the binding constraint.
        let kinds = vec!["cisco_n9kv".to_string(), "cisco_n9kv".to_string()];
        let response = capacity_for(&kinds, 8, 16_384);
        assert!(!response.sufficient);
        assert_eq!(response.required_cpus, 8);
        assert_eq!(response.required_mem_mb, 20_480);
    }

    #[test]
    fn capacity_accepts_container_kinds() {
        let kinds = vec!["ceos".to_string(), "linux".to_string()];
        let response = capacity_for(&kinds, 4, 8_192);
        assert!(response.sufficient);
    }
}
