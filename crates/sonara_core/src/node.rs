//! Device nodes
//!
//! A node is one selectable endpoint on a device: a headphone jack, the
//! internal speaker, a microphone. Nodes carry the per-endpoint volume and
//! gain state the engine folds into its software volume decisions.

use std::time::Instant;

use sonara_proto::{NodePosition, NodeType};

/// One input/output endpoint on a device.
#[derive(Debug, Clone)]
pub struct Node {
    pub idx: u32,
    pub name: String,
    pub node_type: NodeType,
    pub position: NodePosition,
    pub plugged: bool,
    pub plugged_time: Option<Instant>,
    /// Output volume 0..=100.
    pub volume: u32,
    /// Capture gain in centi-dB.
    pub capture_gain: i32,
    pub left_right_swapped: bool,
    /// Microphone positions "x1 y1 z1 ..." for mic-array nodes.
    pub mic_positions: String,
    pub active_hotword_model: String,
    /// Per-node scaler table indexed by volume; None uses the default curve.
    pub softvol_scalers: Option<Vec<f32>>,
    /// Output: hardware volume range too small. Input: needs software gain.
    pub software_volume_needed: bool,
    /// Maximum software gain in centi-dB when software gain is needed.
    pub max_software_gain: i32,
    /// Survives unplug/replug and reboot.
    pub stable_id: u32,
}

impl Node {
    pub fn new(idx: u32, name: &str, node_type: NodeType) -> Self {
        Self {
            idx,
            name: name.to_string(),
            node_type,
            position: NodePosition::External,
            plugged: false,
            plugged_time: None,
            volume: 100,
            capture_gain: 0,
            left_right_swapped: false,
            mic_positions: String::new(),
            active_hotword_model: String::new(),
            softvol_scalers: None,
            software_volume_needed: false,
            max_software_gain: 0,
            stable_id: stable_id_for(name, 0),
        }
    }

    /// System volume adjusted by this node's own volume: the node volume
    /// acts as an offset from the top of the range.
    pub fn adjust_volume(&self, system_volume: u32) -> u32 {
        let offset = 100 - self.volume.min(100);
        system_volume.saturating_sub(offset)
    }

    /// Scaler for `volume` from this node's table or the default curve.
    pub fn softvol_scaler(&self, volume: u32) -> f32 {
        let volume = volume.min(100);
        match &self.softvol_scalers {
            Some(table) => table
                .get(volume as usize)
                .copied()
                .unwrap_or_else(|| crate::softvol::get_scaler(volume)),
            None => crate::softvol::get_scaler(volume),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.node_type.as_str(self.position)
    }
}

/// Stable id from the node name; unchanged across unplug/replug.
pub fn stable_id_for(name: &str, salt: u32) -> u32 {
    // FNV-1a, good enough for a stable identifier space of this size.
    let mut hash: u32 = 0x811c_9dc5 ^ salt;
    for b in name.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
