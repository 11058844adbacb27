//! Extinction cross-section lookup tables.
//!
//! A table file is tab separated. The first row holds the diameter grid
//! after two label cells; every following row starts with the complex
//! relative refractive index and continues with the complex cross-section
//! at each grid diameter. Only real parts are used.

use crate::error::{AppResult, DaqError};
use num_complex::Complex64;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Relative indices closer than this are treated as the same LUT row.
pub const INDEX_TOLERANCE: f64 = 5e-5;

/// Identifies one LUT file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LutKey {
    /// Laser wavelength in µm.
    pub wavelength_um: f64,
    /// Refractive index of the suspending medium.
    pub medium_index: f64,
    /// Imaginary part of the particle index; 0 selects the non-absorbing table.
    pub imaginary: f64,
}

impl LutKey {
    /// File name of the table.
    pub fn file_name(&self) -> String {
        if self.imaginary == 0.0 {
            format!(
                "LUT_Cext_l={:.2}um_nmed={:.4}_m=[1.0001-1.9534].txt",
                self.wavelength_um, self.medium_index
            )
        } else {
            format!(
                "LUT_Cext_l={:.2}um_nmed={:.4}_m=[1.0001+{:.4}j-1.9534+{:.4}j].txt",
                self.wavelength_um, self.medium_index, self.imaginary, self.imaginary
            )
        }
    }
}

/// Cross-section curves over a common diameter grid.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtinctionTable {
    diameters: Vec<f64>,
    indices: Vec<Complex64>,
    curves: Vec<Vec<f64>>,
}

impl ExtinctionTable {
    /// Table from already parsed rows; every curve must match the grid.
    pub fn new(diameters: Vec<f64>, rows: Vec<(Complex64, Vec<f64>)>) -> AppResult<Self> {
        if diameters.len() < 2 {
            return Err(DaqError::Calibration("LUT diameter grid has fewer than two points".into()));
        }
        let mut indices = Vec::with_capacity(rows.len());
        let mut curves = Vec::with_capacity(rows.len());
        for (index, curve) in rows {
            if curve.len() != diameters.len() {
                return Err(DaqError::Calibration(format!(
                    "LUT row m={} has {} values for {} diameters",
                    index,
                    curve.len(),
                    diameters.len()
                )));
            }
            indices.push(index);
            curves.push(curve);
        }
        Ok(Self {
            diameters,
            indices,
            curves,
        })
    }

    /// Parse the text format.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| DaqError::Calibration("LUT file is empty".into()))?;
        let diameters = header
            .split('\t')
            .skip(2)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| DaqError::Calibration(format!("invalid LUT diameter '{}'", token)))
            })
            .collect::<AppResult<Vec<f64>>>()?;

        let mut rows = Vec::new();
        for (n, line) in lines.enumerate() {
            let values = line
                .split('\t')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(parse_complex)
                .collect::<Option<Vec<Complex64>>>()
                .ok_or_else(|| DaqError::Calibration(format!("invalid complex value in LUT row {}", n + 1)))?;
            let Some((index, curve)) = values.split_first() else {
                continue;
            };
            rows.push((*index, curve.iter().map(|c| c.re).collect()));
        }
        Self::new(diameters, rows)
    }

    /// Read and parse a table file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            DaqError::Calibration(format!("cannot read LUT '{}': {}", path.display(), e))
        })?;
        let table = Self::parse(&text)?;
        log::info!(
            "Loaded LUT '{}': {} rows over {} diameters",
            path.display(),
            table.indices.len(),
            table.diameters.len()
        );
        Ok(table)
    }

    /// Diameter grid in µm.
    pub fn diameters(&self) -> &[f64] {
        &self.diameters
    }

    /// Number of index rows.
    pub fn len(&self) -> usize {
        self.curves.len()
    }

    /// True when the table has no index rows.
    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    fn matching(&self, m: f64) -> impl Iterator<Item = &Vec<f64>> + '_ {
        self.indices
            .iter()
            .zip(&self.curves)
            .filter(move |(index, _)| (index.re - m).abs() < INDEX_TOLERANCE)
            .map(|(_, curve)| curve)
    }

    fn not_found(m: f64) -> DaqError {
        DaqError::Calibration(format!("relative refractive index {:.4} not found in LUT", m))
    }

    /// Average of every curve whose real relative index matches `m`.
    pub fn curve_for(&self, m: f64) -> AppResult<Vec<f64>> {
        let matches: Vec<&Vec<f64>> = self.matching(m).collect();
        if matches.is_empty() {
            return Err(Self::not_found(m));
        }
        if matches.len() > 1 {
            log::debug!("{} LUT rows match m={:.4}, averaging", matches.len(), m);
        }
        let mut sum = vec![0.0; self.diameters.len()];
        for curve in &matches {
            for (acc, value) in sum.iter_mut().zip(curve.iter()) {
                *acc += value;
            }
        }
        let n = matches.len() as f64;
        Ok(sum.into_iter().map(|v| v / n).collect())
    }

    /// First curve in file order whose real relative index matches `m`.
    pub fn first_curve_for(&self, m: f64) -> AppResult<Vec<f64>> {
        self.matching(m).next().cloned().ok_or_else(|| Self::not_found(m))
    }
}

/// Accepts `(1.2+0.3j)`, `1.2+0.3j`, `1.2` and exponent forms.
fn parse_complex(token: &str) -> Option<Complex64> {
    token
        .trim_matches(|c| c == '(' || c == ')')
        .parse::<Complex64>()
        .ok()
}

/// Loads tables on first use and keeps them for later corrections.
#[derive(Debug, Default)]
pub struct LutStore {
    dir: PathBuf,
    cache: HashMap<String, Arc<ExtinctionTable>>,
}

impl LutStore {
    /// Store reading tables from `dir`.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            cache: HashMap::new(),
        }
    }

    /// Register a table without touching the filesystem.
    pub fn insert(&mut self, key: &LutKey, table: ExtinctionTable) {
        self.cache.insert(key.file_name(), Arc::new(table));
    }

    /// Cached table for `key`, loaded from disk on first use.
    pub fn get(&mut self, key: &LutKey) -> AppResult<Arc<ExtinctionTable>> {
        let name = key.file_name();
        if let Some(table) = self.cache.get(&name) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(ExtinctionTable::load(self.dir.join(&name))?);
        self.cache.insert(name, Arc::clone(&table));
        Ok(table)
    }

    /// Number of tables held in memory.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "m\\d\t-\t0.50\t1.00\t1.50\n\
        (1.1900+0j)\t(1+0j)\t(2+0j)\t(3+0j)\n\
        (1.1900+0.001j)\t(3+0j)\t(4+0j)\t(5+0j)\n\
        (1.2000+0j)\t(10+0.5j)\t(20+0j)\t(30+0j)\n";

    #[test]
    fn test_file_names() {
        let key = LutKey {
            wavelength_um: 0.67,
            medium_index: 1.331,
            imaginary: 0.0,
        };
        assert_eq!(key.file_name(), "LUT_Cext_l=0.67um_nmed=1.3310_m=[1.0001-1.9534].txt");
        let key = LutKey { imaginary: 0.1, ..key };
        assert_eq!(
            key.file_name(),
            "LUT_Cext_l=0.67um_nmed=1.3310_m=[1.0001+0.1000j-1.9534+0.1000j].txt"
        );
    }

    #[test]
    fn test_parse_and_average() {
        let table = ExtinctionTable::parse(SAMPLE).unwrap();
        assert_eq!(table.diameters(), &[0.5, 1.0, 1.5]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.curve_for(1.19).unwrap(), vec![2.0, 3.0, 4.0]);
        assert_eq!(table.curve_for(1.2).unwrap(), vec![10.0, 20.0, 30.0]);
        assert!(matches!(table.curve_for(1.3), Err(DaqError::Calibration(_))));
    }

    #[test]
    fn test_first_match_ignores_later_duplicates() {
        let text = "m\\d\t-\t1.0\t2.0\n\
            (1.2000+0j)\t(1+0j)\t(2+0j)\n\
            (1.2000+0j)\t(3+0j)\t(4+0j)\n";
        let table = ExtinctionTable::parse(text).unwrap();
        assert_eq!(table.first_curve_for(1.2).unwrap(), vec![1.0, 2.0]);
        assert_eq!(table.curve_for(1.2).unwrap(), vec![2.0, 3.0]);
        assert!(matches!(table.first_curve_for(1.3), Err(DaqError::Calibration(_))));
    }

    #[test]
    fn test_rejects_ragged_row() {
        let text = "a\tb\t1.0\t2.0\n(1.1+0j)\t(1+0j)\n";
        assert!(ExtinctionTable::parse(text).is_err());
    }

    #[test]
    fn test_store_loads_once() {
        let dir = tempdir().unwrap();
        let key = LutKey {
            wavelength_um: 0.67,
            medium_index: 1.331,
            imaginary: 0.0,
        };
        std::fs::write(dir.path().join(key.file_name()), SAMPLE).unwrap();
        let mut store = LutStore::new(dir.path());
        let first = store.get(&key).unwrap();
        std::fs::remove_file(dir.path().join(key.file_name())).unwrap();
        let second = store.get(&key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.cached(), 1);
    }

    #[test]
    fn test_missing_file_is_calibration_error() {
        let dir = tempdir().unwrap();
        let mut store = LutStore::new(dir.path());
        let key = LutKey {
            wavelength_um: 0.67,
            medium_index: 1.331,
            imaginary: 0.0,
        };
        assert!(matches!(store.get(&key), Err(DaqError::Calibration(_))));
    }
}
