//! JSON exporter for offline replay of a run.
//!
//! Each frame holds the packets broadcast that tick and the quadtree cell
//! layout, which is everything a display client would draw.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tmap_core::{SpatialIndex, TargetPacket};

/// A single frame of broadcast data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub tick: u64,

    /// Virtual time in seconds
    pub time_sec: f64,

    /// Packets as sent, before any loss
    pub targets: Vec<TargetPacket>,

    /// Quadtree cells, parents before children
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<CellFrame>,

    /// Operator and network events this tick
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

/// One quadtree cell, corners in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellFrame {
    pub depth: usize,
    pub lat_min: f64,
    pub lon_min: f64,
    pub lat_max: f64,
    pub lon_max: f64,
}

impl CellFrame {
    /// Collects every cell of `spatial` in visit order.
    pub fn collect(spatial: &SpatialIndex<'_>) -> Vec<Self> {
        let mut cells = Vec::new();
        spatial.visit_cells(|boundary, depth| {
            let (min, max) = (boundary.min(), boundary.max());
            cells.push(CellFrame {
                depth,
                lat_min: min.y,
                lon_min: min.x,
                lat_max: max.y,
                lon_max: max.x,
            });
        });
        cells
    }
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotExport {
    /// Engine name
    pub name: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SnapshotFrame>,

    /// Records in the index at shutdown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_records: Option<usize>,
}

impl SnapshotExport {
    /// Creates a new export container.
    pub fn new(name: &str, seed: u64) -> Self {
        Self {
            name: name.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            final_records: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SnapshotFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    pub fn finalize(&mut self, records: usize) {
        self.final_records = Some(records);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmap_core::{Bounds, TargetRecord, TrackIndex};

    #[test]
    fn test_cells_follow_quadtree() {
        let mut index = TrackIndex::new();
        // One target per quadrant plus a second in NE: the root splits once.
        let fixes = [
            (37.55, 126.95),
            (37.55, 127.05),
            (37.56, 127.06),
            (37.45, 126.95),
            (37.45, 127.05),
        ];
        for (id, (lat, lon)) in (1..).zip(fixes) {
            let mut r = TargetRecord::new(id, 5);
            r.append_sample(lat, lon, 0);
            index.insert(r);
        }
        let spatial = SpatialIndex::build(Bounds::default().to_rect(), &index);
        let cells = CellFrame::collect(&spatial);

        assert_eq!(cells.len(), 5);
        assert_eq!(cells[0].depth, 0);
        assert_eq!(cells[0].lat_min, 37.40);
        assert!(cells[1..].iter().all(|c| c.depth == 1));
    }

    #[test]
    fn test_export_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let mut export = SnapshotExport::new("tmap-engine", 42);
        export.add_frame(SnapshotFrame {
            tick: 1,
            time_sec: 0.1,
            targets: vec![TargetPacket {
                id: 7,
                lat: 37.5,
                lon: 127.0,
                threat_level: 6,
                status: 1,
            }],
            cells: Vec::new(),
            events: vec!["Target #0007 deployed".to_string()],
        });
        export.finalize(1);
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: SnapshotExport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.frames.len(), 1);
        assert_eq!(parsed.frames[0].targets[0].id, 7);
        assert_eq!(parsed.duration_sec, 0.1);
        assert_eq!(parsed.final_records, Some(1));
        assert!(!text.contains("\"cells\""));
    }
}
