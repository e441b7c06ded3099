//! Whitespace-separated text matrices, one point per line.
//!
//! Blank lines and lines starting with `#` are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tsne_core::{Embedding, Matrix};

use crate::error::{Result, StoreError};

pub fn read_matrix(r: impl BufRead) -> Result<Matrix> {
    let mut data = Vec::new();
    let mut cols = None;
    let mut rows = 0;

    for (lineno, line) in r.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let before = data.len();
        for field in line.split_whitespace() {
            let v: f64 = field.parse().map_err(|_| {
                StoreError::InvalidData(format!("line {}: not a number: {field:?}", lineno + 1))
            })?;
            data.push(v);
        }
        let width = data.len() - before;
        match cols {
            None => cols = Some(width),
            Some(c) if c != width => {
                return Err(StoreError::InvalidData(format!(
                    "line {}: expected {c} columns, found {width}",
                    lineno + 1
                )));
            }
            Some(_) => {}
        }
        rows += 1;
    }

    let cols = cols.ok_or_else(|| StoreError::InvalidData("no data rows".to_string()))?;
    Ok(Matrix::from_flat(rows, cols, data)?)
}

pub fn write_embedding(w: &mut impl Write, embedding: &Embedding) -> Result<()> {
    for point in embedding.iter_points() {
        let line: Vec<String> = point.iter().map(|v| v.to_string()).collect();
        writeln!(w, "{}", line.join("\t"))?;
    }
    Ok(())
}

pub fn load_matrix(path: &Path) -> Result<Matrix> {
    let matrix = read_matrix(BufReader::new(File::open(path)?))?;
    tracing::info!(
        "read {} x {} matrix from {}",
        matrix.rows(),
        matrix.cols(),
        path.display()
    );
    Ok(matrix)
}

pub fn save_embedding(path: &Path, embedding: &Embedding) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_embedding(&mut w, embedding)?;
    w.flush()?;
    tracing::info!("wrote {} points to {}", embedding.n(), path.display());
    Ok(())
}
