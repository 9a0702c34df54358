// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pupil topology descriptor consumed by the permutation manager and the cores.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

/// Network sizes reported by the pupil.
///
/// `num_output_nodes` lists the widths *between* output layers, so a pupil
/// with `n` entries has `n + 1` output layers; the last one projects onto the
/// vocabulary and is never permuted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSize {
    pub num_nodes: Vec<usize>,
    #[serde(default)]
    pub num_output_nodes: Vec<usize>,
    #[serde(default)]
    pub embedding_size: Option<usize>,
}

/// Named coordinate axis that receives its own permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    Embedding,
    /// Hidden/cell coordinates of LSTM layer `i`.
    Cell(usize),
    /// Width after output layer `i`.
    Hidden(usize),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Embedding => write!(f, "embedding"),
            GroupKey::Cell(idx) => write!(f, "c_{idx}"),
            GroupKey::Hidden(idx) => write!(f, "h_{idx}"),
        }
    }
}

/// Pupil layer addressed by an optimizer-input record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerKey {
    Embedding,
    Lstm(usize),
    Output(usize),
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKey::Embedding => write!(f, "embedding_layer"),
            LayerKey::Lstm(idx) => write!(f, "lstm_layer_{idx}"),
            LayerKey::Output(idx) => write!(f, "output_layer_{idx}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateGroup {
    pub key: GroupKey,
    pub size: usize,
}

/// Groups whose permutations act on a layer's input (`o`) and output (`sigma`) axes.
///
/// An empty list means the axis is left in its original order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub key: LayerKey,
    pub in_groups: Vec<GroupKey>,
    pub out_groups: Vec<GroupKey>,
}

/// Layers and coordinate groups of one pupil, computed once per optimizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    groups: Vec<CoordinateGroup>,
    layers: Vec<LayerSpec>,
}

/// LSTM gate blocks sharing one coordinate permutation.
pub const LSTM_GATES: usize = 4;

impl Topology {
    pub fn from_net_size(net: &NetSize) -> Result<Self> {
        if net.num_nodes.is_empty() {
            return Err(MetaError::config("pupil reports no LSTM layers"));
        }
        let widths = net
            .num_nodes
            .iter()
            .chain(net.num_output_nodes.iter())
            .chain(net.embedding_size.iter());
        if widths.into_iter().any(|&w| w == 0) {
            return Err(MetaError::config(format!(
                "pupil reports a zero-width layer: {net:?}"
            )));
        }

        let mut groups = Vec::new();
        let mut layers = Vec::new();

        if let Some(size) = net.embedding_size {
            groups.push(CoordinateGroup {
                key: GroupKey::Embedding,
                size,
            });
            layers.push(LayerSpec {
                key: LayerKey::Embedding,
                in_groups: Vec::new(),
                out_groups: vec![GroupKey::Embedding],
            });
        }

        for (idx, &size) in net.num_nodes.iter().enumerate() {
            groups.push(CoordinateGroup {
                key: GroupKey::Cell(idx),
                size,
            });
            let previous = if idx == 0 {
                net.embedding_size.map(|_| GroupKey::Embedding)
            } else {
                Some(GroupKey::Cell(idx - 1))
            };
            layers.push(LayerSpec {
                key: LayerKey::Lstm(idx),
                in_groups: previous.into_iter().chain([GroupKey::Cell(idx)]).collect(),
                out_groups: vec![GroupKey::Cell(idx); LSTM_GATES],
            });
        }

        let last_cell = GroupKey::Cell(net.num_nodes.len() - 1);
        for (idx, &size) in net.num_output_nodes.iter().enumerate() {
            groups.push(CoordinateGroup {
                key: GroupKey::Hidden(idx),
                size,
            });
        }
        for idx in 0..=net.num_output_nodes.len() {
            let input = if idx == 0 {
                last_cell
            } else {
                GroupKey::Hidden(idx - 1)
            };
            let out_groups = if idx < net.num_output_nodes.len() {
                vec![GroupKey::Hidden(idx)]
            } else {
                Vec::new()
            };
            layers.push(LayerSpec {
                key: LayerKey::Output(idx),
                in_groups: vec![input],
                out_groups,
            });
        }

        Ok(Self { groups, layers })
    }

    pub fn groups(&self) -> &[CoordinateGroup] {
        &self.groups
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn group_size(&self, key: GroupKey) -> Option<usize> {
        self.groups.iter().find(|g| g.key == key).map(|g| g.size)
    }

    pub fn layer(&self, key: LayerKey) -> Option<&LayerSpec> {
        self.layers.iter().find(|l| l.key == key)
    }

    /// Total width of the concatenated groups, e.g. the `o` width of an LSTM layer.
    pub fn span(&self, keys: &[GroupKey]) -> Option<usize> {
        keys.iter().map(|&k| self.group_size(k)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> NetSize {
        NetSize {
            num_nodes: vec![8, 6],
            num_output_nodes: vec![5],
            embedding_size: Some(4),
        }
    }

    #[test]
    fn groups_cover_embedding_cells_and_hidden_outputs() {
        let topology = Topology::from_net_size(&net()).unwrap();
        let names: Vec<String> = topology.groups().iter().map(|g| g.key.to_string()).collect();
        assert_eq!(names, vec!["embedding", "c_0", "c_1", "h_0"]);
    }

    #[test]
    fn first_lstm_layer_reads_embedding_and_its_own_cell() {
        let topology = Topology::from_net_size(&net()).unwrap();
        let lstm0 = topology.layer(LayerKey::Lstm(0)).unwrap();
        assert_eq!(lstm0.in_groups, vec![GroupKey::Embedding, GroupKey::Cell(0)]);
        assert_eq!(topology.span(&lstm0.in_groups), Some(12));
        assert_eq!(topology.span(&lstm0.out_groups), Some(32));
    }

    #[test]
    fn output_chain_passes_last_cell_and_leaves_final_layer_unpermuted() {
        let topology = Topology::from_net_size(&net()).unwrap();
        let out0 = topology.layer(LayerKey::Output(0)).unwrap();
        assert_eq!(out0.in_groups, vec![GroupKey::Cell(1)]);
        assert_eq!(out0.out_groups, vec![GroupKey::Hidden(0)]);
        let out1 = topology.layer(LayerKey::Output(1)).unwrap();
        assert_eq!(out1.in_groups, vec![GroupKey::Hidden(0)]);
        assert!(out1.out_groups.is_empty());
    }

    #[test]
    fn pupils_without_embedding_start_from_the_first_cell() {
        let topology = Topology::from_net_size(&NetSize {
            num_nodes: vec![3],
            num_output_nodes: vec![],
            embedding_size: None,
        })
        .unwrap();
        assert!(topology.layer(LayerKey::Embedding).is_none());
        assert_eq!(
            topology.layer(LayerKey::Lstm(0)).unwrap().in_groups,
            vec![GroupKey::Cell(0)]
        );
    }

    #[test]
    fn zero_width_layers_are_rejected() {
        let err = Topology::from_net_size(&NetSize {
            num_nodes: vec![0],
            num_output_nodes: vec![],
            embedding_size: None,
        })
        .unwrap_err();
        assert!(matches!(err, MetaError::Configuration(_)));
    }

    #[test]
    fn net_size_deserializes_with_optional_fields() {
        let net: NetSize = serde_json::from_str(r#"{"num_nodes": [100]}"#).unwrap();
        assert_eq!(net.embedding_size, None);
        assert!(net.num_output_nodes.is_empty());
    }
}
