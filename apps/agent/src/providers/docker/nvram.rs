//! IOL NVRAM parsing.
//!
//! IOL containers persist their config in a binary NVRAM image
//! (`iol-data/nvram_00001`). The ASCII config sits between a binary header
//! and trailing NUL padding; we find it by looking for a plausible IOS
//! config marker and cut at the last `end` line before the next NUL.

const CONFIG_MARKERS: &[&str] = &[
    "version ",
    "hostname ",
    "no service ",
    "service ",
    "boot-start-marker",
    "Current configuration",
];

const MIN_CONFIG_LEN: usize = 10;

/// Extract the ASCII configuration from raw NVRAM bytes. Returns None when
/// no plausible config section is present.
pub fn parse_iol_nvram(data: &[u8]) -> Option<String> {
    if data.len() < 64 {
        return None;
    }

    // Find the earliest config marker in the raw bytes.
    let text_lossy = String::from_utf8_lossy(data);
    let start = CONFIG_MARKERS
        .iter()
        .filter_map(|marker| text_lossy.find(marker))
        .min()?;

    // Rewind to the start of the marker's line.
    let start = text_lossy[..start].rfind('\n').map(|i| i + 1).unwrap_or(start);

    // Section ends at the next NUL after the marker.
    let tail = &data[start.min(data.len())..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    let section = String::from_utf8_lossy(&tail[..end]);

    // Trim at the last `end` line so trailing binary noise never leaks.
    let trimmed = match section
        .lines()
        .enumerate()
        .filter(|(_, line)| line.trim() == "end")
        .map(|(i, _)| i)
        .last()
    {
        Some(last_end) => section
            .lines()
            .take(last_end + 1)
            .collect::<Vec<_>>()
            .join("\n"),
        None => section.trim_end().to_string(),
    };

    let trimmed = trimmed.trim().to_string();
    if trimmed.len() < MIN_CONFIG_LEN {
        return None;
    }
    if !CONFIG_MARKERS.iter().any(|marker| trimmed.contains(marker)) {
        return None;
    }
    Some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_tiny_inputs_return_none() {
        assert!(parse_iol_nvram(b"").is_none());
        assert!(parse_iol_nvram(&[0u8; 32]).is_none());
    }

    #[test]
    fn binary_noise_without_markers_returns_none() {
        let data: Vec<u8> = (0..=99u8).collect();
        assert!(parse_iol_nvram(&data).is_none());
    }

    #[test]
    fn extracts_config_between_header_and_padding() {
        let mut data = vec![0u8; 76];
        data.extend_from_slice(b"\nhostname Router1\n!\ninterface Ethernet0/0\n no shutdown\n!\nend");
        data.extend_from_slice(&[0u8; 100]);

        let config = parse_iol_nvram(&data).expect("config found");
        assert!(config.contains("hostname Router1"));
        assert!(config.contains("interface Ethernet0/0"));
        assert!(config.ends_with("end"));
    }

    #[test]
    fn version_marker_starts_section() {
        let mut data = vec![0xffu8; 80];
        data.extend_from_slice(b"\nversion 15.6\nhostname TestRouter\n!\nend");
        data.extend_from_slice(&[0u8; 50]);

        let config = parse_iol_nvram(&data).expect("config found");
        assert!(config.starts_with("version 15.6"));
        assert!(config.contains("hostname TestRouter"));
    }

    #[test]
    fn stops_at_null_after_config() {
        let mut data = vec![0u8; 80];
        data.extend_from_slice(b"hostname R1\n!\nend\n");
        data.push(0);
        data.extend_from_slice(b"garbage after null");

        let config = parse_iol_nvram(&data).expect("config found");
        assert!(!config.contains("garbage"));
        assert!(config.ends_with("end"));
    }

    #[test]
    fn too_short_sections_rejected() {
        let mut data = vec![0u8; 80];
        data.extend_from_slice(b"version ");
        data.extend_from_slice(&[0u8; 10]);
        assert!(parse_iol_nvram(&data).is_none());
    }
}
