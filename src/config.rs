use std::io::prelude::*;

use crate::error::{Error, Result};
use crate::link::NodeId;

/// Static node table: an ordered list of fabric addresses indexed by node id,
/// plus the local node's own id. Immutable after startup.
#[derive(Debug, Clone)]
pub struct NodeTable {
    peers: Vec<String>,
    local: NodeId,
}

impl NodeTable {
    /// Create a node table from an explicit peer list and the local id.
    pub fn new(peers: Vec<String>, local: NodeId) -> Result<Self> {
        if peers.is_empty() {
            return Err(Error::Config("empty node table".into()));
        }
        if local >= peers.len() {
            return Err(Error::Config(format!(
                "local id {} is out of bounds (nodes = {})",
                local,
                peers.len()
            )));
        }
        for (i, addr) in peers.iter().enumerate() {
            if addr.is_empty() {
                return Err(Error::Config(format!("node {} has an empty address", i)));
            }
            if peers[..i].contains(addr) {
                return Err(Error::Config(format!("duplicate address {:?}", addr)));
            }
        }
        Ok(Self { peers, local })
    }

    /// Load a node table from a TOML file of the form:
    ///
    /// ```toml
    /// [dkmsg]
    /// peers = ["node0", "node1", "node2"]
    /// local = 1
    /// ```
    pub fn load_toml(config_file: &str) -> Result<Self> {
        let mut file =
            std::fs::File::open(config_file).map_err(|e| Error::Config(e.to_string()))?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)
            .map_err(|e| Error::Config(e.to_string()))?;
        Self::parse_toml(&toml_str)
    }

    fn parse_toml(toml_str: &str) -> Result<Self> {
        let toml: toml::Value =
            toml::from_str(toml_str).map_err(|e| Error::Config(e.to_string()))?;
        let table = toml
            .get("dkmsg")
            .and_then(|v| v.as_table())
            .ok_or_else(|| Error::Config("dkmsg configuration not found".into()))?;
        let peers = table
            .get("peers")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Config("bad dkmsg configuration: peers".into()))?
            .iter()
            .map(|x| {
                x.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| Error::Config("peer address must be a string".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        let local = table
            .get("local")
            .and_then(|v| v.as_integer())
            .ok_or_else(|| Error::Config("bad dkmsg configuration: local".into()))?;
        Self::new(peers, local as NodeId)
    }

    /// The local node's id.
    #[inline]
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// The number of nodes, local node included.
    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The fabric address of the given node.
    #[inline]
    pub fn addr(&self, id: NodeId) -> Result<&str> {
        self.peers
            .get(id)
            .map(String::as_str)
            .ok_or(Error::NoSuchNode(id))
    }

    /// The fabric address of the local node.
    #[inline]
    pub fn local_addr(&self) -> &str {
        &self.peers[self.local]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let table = NodeTable::parse_toml(
            r#"
            [dkmsg]
            peers = ["n0", "n1", "n2"]
            local = 2
            "#,
        )
        .unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.local_id(), 2);
        assert_eq!(table.addr(0).unwrap(), "n0");
        assert_eq!(table.local_addr(), "n2");
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(NodeTable::new(vec![], 0).is_err());
        assert!(NodeTable::new(vec!["a".into()], 1).is_err());
        assert!(NodeTable::new(vec!["a".into(), "a".into()], 0).is_err());
    }
}
