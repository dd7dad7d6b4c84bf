//! JSON model files.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::IrError;
use crate::graph::ComputeGraph;

impl ComputeGraph {
    /// Load a graph, with its parameters, from a JSON model file.
    pub fn load_json(path: &Path) -> Result<Self, IrError> {
        let file = File::open(path).map_err(|source| IrError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| IrError::Format {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the graph, with its parameters, to a JSON model file.
    pub fn save_json(&self, path: &Path) -> Result<(), IrError> {
        let file = File::create(path).map_err(|source| IrError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::to_writer(BufWriter::new(file), self).map_err(|source| IrError::Format {
            path: path.to_path_buf(),
            source,
        })
    }
}
