pub mod topology;

pub use topology::{
    parse_topology, validate_document, validate_topology, HostRoute, NameRef, NamedTopology,
    NetworkDef, RouterDef, RuleTemplate, SecurityGroupDef, ServerGroupDef, SubnetDef, TenantDef,
    TopologyDocument, TopologyError, TopologySpec,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Topology error: {0}")]
    TopologyError(#[from] TopologyError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a topology file from disk.
/// This is the I/O boundary - it reads the file and delegates to pure parsing functions.
pub fn load_topology_file(path: &Path) -> Result<TopologyDocument, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let document = TopologyDocument::from_str(&content)?;
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_topology_file() {
        let content = r#"
networks:
  - name: net1
    subnets:
      - name: sub1
security_groups:
  - name: sg1
servers:
  - name: backend
    networks: [net1]
    security_groups: [sg1]
"#;

        let file = create_temp_file(content);
        let result = load_topology_file(file.path());
        assert!(result.is_ok());
    }

    #[test]
    fn test_load_json_topology_file() {
        let content = r#"{"networks": [{"name": "net1"}], "gateway": true}"#;
        let file = create_temp_file(content);
        let document = load_topology_file(file.path()).unwrap();
        assert!(matches!(document, TopologyDocument::Single(ref s) if s.gateway));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_topology_file(Path::new("/nonexistent/topology.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_load_invalid_topology() {
        let file = create_temp_file("networks:\n  - name: a\n  - name: a\n");
        let result = load_topology_file(file.path());
        assert!(matches!(result, Err(ConfigError::TopologyError(_))));
    }
}
