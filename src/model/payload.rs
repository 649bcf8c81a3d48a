use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Placeholder string inside `positions` lists that carries no ticker.
const EMPTY_SLOT: &str = "Empty";

/// An opaque strategy tree. The evaluator interprets the semantics; the core
/// only walks it to discover which tickers a system can ever hold.
///
/// A node is either a leaf holding a list of candidate positions, or a branch
/// whose children are grouped under named slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadNode {
    Branch {
        children: BTreeMap<String, Vec<PayloadNode>>,
    },
    Leaf {
        #[serde(default)]
        positions: Vec<String>,
    },
}

impl PayloadNode {
    /// Depth-first walk collecting every ticker mentioned anywhere in the
    /// tree. `"Empty"` placeholders are skipped; tickers are uppercased.
    pub fn tickers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tickers(&mut out);
        out
    }

    fn collect_tickers(&self, out: &mut BTreeSet<String>) {
        match self {
            PayloadNode::Leaf { positions } => {
                for p in positions {
                    if p != EMPTY_SLOT && !p.is_empty() {
                        out.insert(p.to_uppercase());
                    }
                }
            }
            PayloadNode::Branch { children } => {
                for nodes in children.values() {
                    for node in nodes {
                        node.collect_tickers(out);
                    }
                }
            }
        }
    }

    /// Decode a stored payload blob. Blobs may be gzip-compressed (older
    /// rows) or raw JSON; the gzip magic bytes decide.
    pub fn from_blob(blob: &[u8]) -> Result<PayloadNode> {
        let json = if blob.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = flate2::read::GzDecoder::new(blob);
            let mut buf = String::new();
            decoder
                .read_to_string(&mut buf)
                .context("decompressing payload blob")?;
            buf
        } else {
            String::from_utf8(blob.to_vec()).context("payload blob is not utf8")?
        };

        serde_json::from_str(&json).context("parsing payload json")
    }

    pub fn to_blob(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("payload serialization")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(positions: &[&str]) -> PayloadNode {
        PayloadNode::Leaf {
            positions: positions.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn walk_skips_empty_and_uppercases() {
        let tree = PayloadNode::Branch {
            children: BTreeMap::from([
                ("then".to_string(), vec![leaf(&["spy", "Empty"])]),
                (
                    "else".to_string(),
                    vec![PayloadNode::Branch {
                        children: BTreeMap::from([(
                            "then".to_string(),
                            vec![leaf(&["bil", "SPY"])],
                        )]),
                    }],
                ),
            ]),
        };

        let tickers: Vec<String> = tree.tickers().into_iter().collect();
        assert_eq!(tickers, vec!["BIL", "SPY"]);
    }

    #[test]
    fn blob_roundtrip_plain_and_gzip() {
        let tree = leaf(&["QQQ"]);
        let blob = tree.to_blob();
        assert_eq!(PayloadNode::from_blob(&blob).unwrap(), tree);

        use std::io::Write;
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&blob).unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(PayloadNode::from_blob(&gz).unwrap(), tree);
    }
}
