//! Binary exchange files for running the engine as a separate process.
//!
//! All values are little-endian.
//!
//! Data file:
//! `i32 N | i32 D | f64 theta | f64 perplexity | i32 no_dims | i32 max_iter |
//!  N·D f64 samples | [i32 seed]`
//!
//! Result file:
//! `i32 N | i32 dims | N·dims f64 coordinates | N i32 landmarks | N f64 costs`
//!
//! Landmarks are the original row indices; readers hand rows back sorted by
//! landmark.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tsne_core::{Embedding, Matrix, TsneParams, TsneResult};

use crate::error::{Result, StoreError};

/// Seed value meaning "not set".
pub const NO_SEED: i32 = -1;

/// Chunk size for preallocation; corrupt headers can't force huge buffers.
const MAX_PREALLOC: usize = 1 << 20;

/// The run parameters carried in a data file header.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeParams {
    pub theta: f64,
    pub perplexity: f64,
    pub no_dims: usize,
    pub max_iter: usize,
    pub seed: Option<u64>,
}

impl ExchangeParams {
    pub fn from_params(params: &TsneParams) -> Self {
        Self {
            theta: params.theta,
            perplexity: params.perplexity,
            no_dims: params.no_dims,
            max_iter: params.max_iter,
            seed: params.seed,
        }
    }

    /// The header as TOML keys, for layering a config file over it.
    pub fn to_table(&self) -> toml::Table {
        let mut table = toml::Table::new();
        table.insert("theta".to_string(), toml::Value::Float(self.theta));
        table.insert("perplexity".to_string(), toml::Value::Float(self.perplexity));
        table.insert("no_dims".to_string(), toml::Value::Integer(self.no_dims as i64));
        table.insert("max_iter".to_string(), toml::Value::Integer(self.max_iter as i64));
        if let Some(seed) = self.seed {
            table.insert("seed".to_string(), toml::Value::Integer(seed as i64));
        }
        table
    }

    fn is_plausible(&self) -> bool {
        self.theta.is_finite()
            && self.theta >= 0.0
            && self.perplexity.is_finite()
            && self.perplexity > 0.0
            && (2..=3).contains(&self.no_dims)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataFile {
    pub samples: Matrix,
    pub params: ExchangeParams,
}

impl DataFile {
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        let p = &self.params;
        write_i32(w, to_i32(self.samples.rows(), "N")?)?;
        write_i32(w, to_i32(self.samples.cols(), "D")?)?;
        w.write_all(&p.theta.to_le_bytes())?;
        w.write_all(&p.perplexity.to_le_bytes())?;
        write_i32(w, to_i32(p.no_dims, "no_dims")?)?;
        write_i32(w, to_i32(p.max_iter, "max_iter")?)?;
        for v in self.samples.values() {
            w.write_all(&v.to_le_bytes())?;
        }
        if let Some(seed) = p.seed {
            let seed = i32::try_from(seed).map_err(|_| {
                StoreError::InvalidData(format!("seed {seed} does not fit the exchange format"))
            })?;
            write_i32(w, seed)?;
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let n = read_count(r, "N")?;
        let d = read_count(r, "D")?;
        let theta = read_f64(r)?;
        let perplexity = read_f64(r)?;
        let no_dims = read_count(r, "no_dims")?;
        let max_iter = read_count(r, "max_iter")?;

        let len = n
            .checked_mul(d)
            .ok_or_else(|| StoreError::InvalidData(format!("N×D overflows: {n}×{d}")))?;
        let samples = read_f64s(r, len)?;
        let seed = match read_optional_i32(r)? {
            Some(s) if s >= 0 => Some(s as u64),
            _ => None,
        };

        Ok(Self {
            samples: Matrix::from_flat(n, d, samples)?,
            params: ExchangeParams {
                theta,
                perplexity,
                no_dims,
                max_iter,
                seed,
            },
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        tracing::info!(
            "wrote data file {} ({} x {})",
            path.display(),
            self.samples.rows(),
            self.samples.cols()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultFile {
    pub embedding: Embedding,
    /// Original row index of each embedded point.
    pub landmarks: Vec<usize>,
    /// Per-point KL divergence contribution.
    pub costs: Vec<f64>,
}

impl ResultFile {
    pub fn from_result(result: &TsneResult) -> Self {
        let n = result.embedding.n();
        Self {
            embedding: result.embedding.clone(),
            landmarks: (0..n).collect(),
            costs: result.cost.per_point.clone(),
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        let n = self.embedding.n();
        if self.landmarks.len() != n || self.costs.len() != n {
            return Err(StoreError::InvalidData(format!(
                "result has {n} points but {} landmarks and {} costs",
                self.landmarks.len(),
                self.costs.len()
            )));
        }
        write_i32(w, to_i32(n, "N")?)?;
        write_i32(w, to_i32(self.embedding.dims(), "dims")?)?;
        for v in self.embedding.as_slice() {
            w.write_all(&v.to_le_bytes())?;
        }
        for &l in &self.landmarks {
            write_i32(w, to_i32(l, "landmark")?)?;
        }
        for c in &self.costs {
            w.write_all(&c.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read a result file, reordering rows by landmark.
    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let n = read_count(r, "N")?;
        let dims = read_count(r, "dims")?;
        let len = n
            .checked_mul(dims)
            .ok_or_else(|| StoreError::InvalidData(format!("N×dims overflows: {n}×{dims}")))?;
        let coords = read_f64s(r, len)?;
        let mut landmarks = Vec::with_capacity(n.min(MAX_PREALLOC));
        for _ in 0..n {
            landmarks.push(read_count(r, "landmark")?);
        }
        let costs = read_f64s(r, n)?;

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| landmarks[i]);
        if order.windows(2).any(|w| landmarks[w[0]] == landmarks[w[1]]) {
            return Err(StoreError::InvalidData("duplicate landmarks".to_string()));
        }

        let mut sorted_coords = Vec::with_capacity(len);
        for &i in &order {
            sorted_coords.extend_from_slice(&coords[i * dims..(i + 1) * dims]);
        }
        Ok(Self {
            embedding: Embedding::from_flat(n, dims, sorted_coords)?,
            landmarks: order.iter().map(|&i| landmarks[i]).collect(),
            costs: order.iter().map(|&i| costs[i]).collect(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        tracing::info!("wrote result file {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r)
    }
}

/// Which layout an exchange file has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Data,
    Result,
}

/// Tell data and result files apart from the header and the file length.
///
/// A two-point data file without a seed has the same length as a two-point
/// result file. Then the content decides: a result must carry landmarks
/// 0..N, a data header must hold usable parameters.
pub fn identify(path: &Path) -> Result<ExchangeKind> {
    let len = std::fs::metadata(path)?.len();
    let mut r = BufReader::new(File::open(path)?);
    let n = read_count(&mut r, "N")?;
    let d = read_count(&mut r, "D")?;
    match kinds_for_len(len, n, d).as_slice() {
        [] => Err(StoreError::InvalidData(format!(
            "{len} bytes matches neither layout for N={n}, D={d}"
        ))),
        [kind] => Ok(*kind),
        _ => disambiguate(path, n).ok_or_else(|| {
            StoreError::InvalidData(format!(
                "{len} bytes is ambiguous: fits both layouts for N={n}, D={d}"
            ))
        }),
    }
}

fn kinds_for_len(len: u64, n: usize, d: usize) -> Vec<ExchangeKind> {
    let (len, n, d) = (len as u128, n as u128, d as u128);
    let data = 32 + n * d * 8;
    let mut kinds = Vec::new();
    if len == data || len == data + 4 {
        kinds.push(ExchangeKind::Data);
    }
    if len == 8 + n * d * 8 + n * 12 {
        kinds.push(ExchangeKind::Result);
    }
    kinds
}

fn disambiguate(path: &Path, n: usize) -> Option<ExchangeKind> {
    let as_data = DataFile::load(path)
        .is_ok_and(|f| f.params.is_plausible() && f.samples.values().all(|v| v.is_finite()));
    let as_result = ResultFile::load(path).is_ok_and(|f| {
        f.landmarks.iter().copied().eq(0..n)
            && f.embedding.as_slice().iter().all(|v| v.is_finite())
            && f.costs.iter().all(|c| c.is_finite())
    });
    match (as_data, as_result) {
        (true, false) => Some(ExchangeKind::Data),
        (false, true) => Some(ExchangeKind::Result),
        _ => None,
    }
}

fn to_i32(v: usize, what: &str) -> Result<i32> {
    i32::try_from(v)
        .map_err(|_| StoreError::InvalidData(format!("{what} = {v} exceeds the i32 range")))
}

fn write_i32(w: &mut impl Write, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => StoreError::InvalidData("file is truncated".to_string()),
        _ => StoreError::Io(e),
    })
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> Result<f64> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// A non-negative i32 header field.
fn read_count(r: &mut impl Read, what: &str) -> Result<usize> {
    let v = read_i32(r)?;
    usize::try_from(v).map_err(|_| StoreError::InvalidData(format!("negative {what}: {v}")))
}

fn read_f64s(r: &mut impl Read, len: usize) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(len.min(MAX_PREALLOC));
    for _ in 0..len {
        out.push(read_f64(r)?);
    }
    Ok(out)
}

/// Trailing i32 if present. A clean EOF means absent; a partial value is an error.
fn read_optional_i32(r: &mut impl Read) -> Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(k) => filled += k,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(None),
        4 => Ok(Some(i32::from_le_bytes(buf))),
        k => Err(StoreError::InvalidData(format!(
            "trailing seed is {k} bytes, expected 4"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_data(seed: Option<u64>) -> DataFile {
        let rows = vec![vec![1.0, 0.0, -2.5], vec![0.0, 1.0, 3.25], vec![7.0, 8.0, 9.0]];
        DataFile {
            samples: Matrix::from_rows(&rows).unwrap(),
            params: ExchangeParams {
                theta: 0.5,
                perplexity: 30.0,
                no_dims: 2,
                max_iter: 1000,
                seed,
            },
        }
    }

    #[test]
    fn test_data_header_layout() {
        let mut buf = Vec::new();
        sample_data(None).write_to(&mut buf).unwrap();
        // 4 + 4 + 8 + 8 + 4 + 4 header, 9 samples, no seed
        assert_eq!(buf.len(), 32 + 9 * 8);
        assert_eq!(&buf[0..4], &3i32.to_le_bytes());
        assert_eq!(&buf[4..8], &3i32.to_le_bytes());
        assert_eq!(&buf[8..16], &0.5f64.to_le_bytes());
    }

    #[test]
    fn test_data_roundtrip_with_and_without_seed() {
        for seed in [None, Some(1234)] {
            let data = sample_data(seed);
            let mut buf = Vec::new();
            data.write_to(&mut buf).unwrap();
            let back = DataFile::read_from(&mut Cursor::new(buf)).unwrap();
            assert_eq!(back, data);
        }
    }

    #[test]
    fn test_negative_seed_means_unset() {
        let mut buf = Vec::new();
        sample_data(None).write_to(&mut buf).unwrap();
        buf.extend_from_slice(&NO_SEED.to_le_bytes());
        let back = DataFile::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.params.seed, None);
    }

    #[test]
    fn test_seed_out_of_range_rejected() {
        let data = sample_data(Some(u64::MAX));
        let err = data.write_to(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let mut buf = Vec::new();
        sample_data(None).write_to(&mut buf).unwrap();
        buf.truncate(50);
        let err = DataFile::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn test_partial_seed_rejected() {
        let mut buf = Vec::new();
        sample_data(None).write_to(&mut buf).unwrap();
        buf.extend_from_slice(&[1, 2]);
        assert!(DataFile::read_from(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_result_sorted_by_landmark() {
        // Written out of order: landmark 2, 0, 1.
        let mut buf = Vec::new();
        for v in [3i32, 2] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [20.0f64, 21.0, 0.0, 1.0, 10.0, 11.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for l in [2i32, 0, 1] {
            buf.extend_from_slice(&l.to_le_bytes());
        }
        for c in [0.2f64, 0.0, 0.1] {
            buf.extend_from_slice(&c.to_le_bytes());
        }

        let result = ResultFile::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(result.landmarks, vec![0, 1, 2]);
        assert_eq!(result.embedding.point(0), &[0.0, 1.0]);
        assert_eq!(result.embedding.point(2), &[20.0, 21.0]);
        assert_eq!(result.costs, vec![0.0, 0.1, 0.2]);
    }

    #[test]
    fn test_result_roundtrip_via_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("result.dat");
        let result = ResultFile {
            embedding: Embedding::from_flat(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
            landmarks: vec![0, 1],
            costs: vec![0.5, 0.25],
        };
        result.save(&path).unwrap();
        assert_eq!(ResultFile::load(&path).unwrap(), result);
    }

    #[test]
    fn test_identify_by_length() {
        let dir = tempfile::TempDir::new().unwrap();
        let data_path = dir.path().join("data.dat");
        sample_data(Some(5)).save(&data_path).unwrap();
        assert_eq!(identify(&data_path).unwrap(), ExchangeKind::Data);

        let result_path = dir.path().join("result.dat");
        ResultFile {
            embedding: Embedding::from_flat(3, 2, vec![0.0; 6]).unwrap(),
            landmarks: vec![0, 1, 2],
            costs: vec![0.0; 3],
        }
        .save(&result_path)
        .unwrap();
        assert_eq!(identify(&result_path).unwrap(), ExchangeKind::Result);

        std::fs::write(&result_path, [3, 0, 0, 0, 2, 0, 0, 0, 1]).unwrap();
        assert!(identify(&result_path).is_err());
    }

    #[test]
    fn test_identify_two_points_by_content() {
        let dir = tempfile::TempDir::new().unwrap();

        // Both files are 8 + 2·2·8 + 24 = 64 bytes.
        let result_path = dir.path().join("result.dat");
        ResultFile {
            embedding: Embedding::from_flat(2, 2, vec![0.5, -0.25, -0.5, 0.25]).unwrap(),
            landmarks: vec![0, 1],
            costs: vec![0.1, 0.2],
        }
        .save(&result_path)
        .unwrap();
        assert_eq!(std::fs::metadata(&result_path).unwrap().len(), 64);
        assert_eq!(identify(&result_path).unwrap(), ExchangeKind::Result);

        let data_path = dir.path().join("data.dat");
        DataFile {
            samples: Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap(),
            params: ExchangeParams {
                theta: 0.5,
                perplexity: 0.3,
                no_dims: 2,
                max_iter: 100,
                seed: None,
            },
        }
        .save(&data_path)
        .unwrap();
        assert_eq!(std::fs::metadata(&data_path).unwrap().len(), 64);
        assert_eq!(identify(&data_path).unwrap(), ExchangeKind::Data);
    }

    #[test]
    fn test_header_table_skips_unset_seed() {
        let header = sample_data(None).params;
        let table = header.to_table();
        assert_eq!(table["perplexity"].as_float(), Some(30.0));
        assert_eq!(table["no_dims"].as_integer(), Some(2));
        assert!(!table.contains_key("seed"));

        let seeded = sample_data(Some(11)).params.to_table();
        assert_eq!(seeded["seed"].as_integer(), Some(11));
    }
}
