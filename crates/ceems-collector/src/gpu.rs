//! GPU ownership resolution
//!
//! Maps GPU device ordinals to the compute unit that owns them, either
//! from the CSV output of a vendor query tool or from a side-channel
//! directory the scheduler prolog populates with one file per ordinal.
//! An unknown ordinal is simply unmapped, never an error.

use crate::config::GpuConfig;
use crate::{CollectorError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Resolves GPU ordinal ownership at scrape time.
pub enum GpuResolver {
    /// Parse `ordinal, uuid` rows from a vendor tool
    Smi(SmiResolver),
    /// Read one file per ordinal from a sidecar directory
    Sidecar(SidecarResolver),
}

impl GpuResolver {
    /// Build the resolver selected by configuration. The sidecar takes
    /// precedence when both sources are configured, since the scheduler
    /// view is authoritative for ownership.
    pub fn new(config: &GpuConfig) -> Result<Self> {
        if let Some(dir) = &config.sidecar_dir {
            return Ok(GpuResolver::Sidecar(SidecarResolver { dir: dir.clone() }));
        }

        if let Some(command) = &config.smi_command {
            return SmiResolver::new(command).map(GpuResolver::Smi);
        }

        Err(CollectorError::configuration(
            "GPU resolution requires smi_command or sidecar_dir",
        ))
    }

    /// Current map of GPU ordinal to owning unit UUID.
    pub fn resolve(&self) -> Result<HashMap<u32, String>> {
        match self {
            GpuResolver::Smi(resolver) => resolver.resolve(),
            GpuResolver::Sidecar(resolver) => resolver.resolve(),
        }
    }
}

/// Vendor-tool-backed resolver.
pub struct SmiResolver {
    program: String,
    args: Vec<String>,
}

impl SmiResolver {
    fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| CollectorError::configuration("empty GPU query command"))?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn resolve(&self) -> Result<HashMap<u32, String>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| CollectorError::Subprocess(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(CollectorError::Subprocess(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        Ok(parse_smi_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `ordinal, uuid` CSV rows. Lines that do not match the expected
/// shape are skipped with a trace, so header rows and vendor banners are
/// tolerated.
fn parse_smi_output(raw: &str) -> HashMap<u32, String> {
    let mut map = HashMap::new();

    for line in raw.lines() {
        let mut fields = line.splitn(2, ',');
        let (Some(index), Some(uuid)) = (fields.next(), fields.next()) else {
            continue;
        };

        match index.trim().parse::<u32>() {
            Ok(ordinal) => {
                let uuid = uuid.trim();
                if !uuid.is_empty() {
                    map.insert(ordinal, uuid.to_string());
                }
            }
            Err(_) => debug!(line, "Skipping unparseable GPU query row"),
        }
    }

    map
}

/// Sidecar-directory-backed resolver: `dir/<ordinal>` contains the
/// owning unit UUID.
pub struct SidecarResolver {
    dir: PathBuf,
}

impl SidecarResolver {
    fn resolve(&self) -> Result<HashMap<u32, String>> {
        let mut map = HashMap::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // Directory appears once the first GPU job starts
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(map),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let Ok(ordinal) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };

            if let Ok(raw) = fs::read_to_string(entry.path()) {
                let uuid = raw.trim().to_string();
                if !uuid.is_empty() {
                    map.insert(ordinal, uuid);
                }
            }
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_smi_output() {
        let raw = "0, 1481508\n1, 1481508\n2, 1990233\n";
        let map = parse_smi_output(raw);

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&0).map(String::as_str), Some("1481508"));
        assert_eq!(map.get(&1).map(String::as_str), Some("1481508"));
        assert_eq!(map.get(&2).map(String::as_str), Some("1990233"));
    }

    #[test]
    fn test_parse_smi_output_skips_headers_and_blanks() {
        let raw = "index, uuid\n\n0, 1481508\nnot a row\n";
        let map = parse_smi_output(raw);

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&0).map(String::as_str), Some("1481508"));
    }

    #[test]
    fn test_sidecar_resolver() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0"), "1481508\n").unwrap();
        fs::write(dir.path().join("1"), "1481508").unwrap();
        fs::write(dir.path().join("README"), "not an ordinal").unwrap();

        let resolver = SidecarResolver {
            dir: dir.path().to_path_buf(),
        };
        let map = resolver.resolve().unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&0).map(String::as_str), Some("1481508"));
        assert_eq!(map.get(&1).map(String::as_str), Some("1481508"));
    }

    #[test]
    fn test_sidecar_missing_dir_is_empty() {
        let resolver = SidecarResolver {
            dir: PathBuf::from("/nonexistent/gpustat"),
        };
        assert!(resolver.resolve().unwrap().is_empty());
    }

    #[test]
    fn test_resolver_prefers_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let config = GpuConfig {
            enabled: true,
            smi_command: Some("/usr/bin/nvidia-smi --query-gpu=index,uuid --format=csv,noheader".to_string()),
            sidecar_dir: Some(dir.path().to_path_buf()),
        };

        assert!(matches!(GpuResolver::new(&config).unwrap(), GpuResolver::Sidecar(_)));
    }
}
