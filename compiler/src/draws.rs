//! CmdStan CSV output
//!
//! Reads the draws written by `pathfinder` and `sample`, and rebuilds nested
//! Stan variables (`U_raw.1.2.3.4`) into JSON arrays suitable for init files.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Errors reading CmdStan output
#[derive(Debug, thiserror::Error)]
pub enum DrawsError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no header line in CmdStan output")]
    MissingHeader,

    #[error("line {line}: {found} values, expected {expected}")]
    RowWidth {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: invalid number `{value}`")]
    InvalidNumber { line: usize, value: String },

    #[error("malformed column name `{0}`")]
    ColumnName(String),

    #[error("variable `{0}` not present in output")]
    UnknownVariable(String),

    #[error("columns of `{0}` have different numbers of indices")]
    InconsistentRank(String),

    #[error("draw {row} out of range, output has {len} draws")]
    RowOutOfRange { row: usize, len: usize },
}

/// All draws of one CmdStan CSV file.
#[derive(Debug, Clone, PartialEq)]
pub struct StanCsv {
    pub header: Vec<String>,
    pub draws: Vec<Vec<f64>>,
}

/// Column positions of one Stan variable, with their 1-based indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableColumns {
    pub name: String,
    pub columns: Vec<(usize, Vec<usize>)>,
}

impl VariableColumns {
    /// Extent of every dimension; empty for scalars.
    pub fn dims(&self) -> Vec<usize> {
        let rank = self.columns.first().map(|(_, idx)| idx.len()).unwrap_or(0);
        (0..rank)
            .map(|d| {
                self.columns
                    .iter()
                    .filter_map(|(_, idx)| idx.get(d).copied())
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }
}

impl StanCsv {
    pub fn from_file(path: &Path) -> Result<Self, DrawsError> {
        let content = fs::read_to_string(path).map_err(|source| DrawsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse CSV content; `#` lines (config, adaptation, timing) are skipped.
    pub fn parse(content: &str) -> Result<Self, DrawsError> {
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.starts_with('#') && !line.trim().is_empty());

        let (_, header_line) = lines.next().ok_or(DrawsError::MissingHeader)?;
        let header: Vec<String> = header_line.split(',').map(|s| s.trim().to_string()).collect();

        let mut draws = Vec::new();
        for (line_idx, line) in lines {
            let row = line
                .split(',')
                .map(|s| {
                    s.trim().parse::<f64>().map_err(|_| DrawsError::InvalidNumber {
                        line: line_idx + 1,
                        value: s.trim().to_string(),
                    })
                })
                .collect::<Result<Vec<f64>, _>>()?;

            if row.len() != header.len() {
                return Err(DrawsError::RowWidth {
                    line: line_idx + 1,
                    expected: header.len(),
                    found: row.len(),
                });
            }
            draws.push(row);
        }

        Ok(StanCsv { header, draws })
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Model variables in first-appearance order; sampler and algorithm
    /// columns (`lp__`, `lp_approx__`, `treedepth__`, ...) are skipped.
    pub fn variables(&self) -> Result<Vec<VariableColumns>, DrawsError> {
        let mut order: Vec<String> = Vec::new();
        let mut by_name: BTreeMap<String, Vec<(usize, Vec<usize>)>> = BTreeMap::new();

        for (col, column_name) in self.header.iter().enumerate() {
            if column_name.ends_with("__") {
                continue;
            }
            let mut parts = column_name.split('.');
            let base = parts
                .next()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| DrawsError::ColumnName(column_name.clone()))?;
            let indices = parts
                .map(|p| match p.parse::<usize>() {
                    Ok(i) if i > 0 => Ok(i),
                    _ => Err(DrawsError::ColumnName(column_name.clone())),
                })
                .collect::<Result<Vec<usize>, _>>()?;

            if !by_name.contains_key(base) {
                order.push(base.to_string());
            }
            by_name.entry(base.to_string()).or_default().push((col, indices));
        }

        order
            .into_iter()
            .map(|name| {
                let columns = by_name.remove(&name).unwrap_or_default();
                let rank = columns.first().map(|(_, idx)| idx.len()).unwrap_or(0);
                if columns.iter().any(|(_, idx)| idx.len() != rank) {
                    return Err(DrawsError::InconsistentRank(name));
                }
                Ok(VariableColumns { name, columns })
            })
            .collect()
    }

    /// Values of column `name` across all draws.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let col = self.header.iter().position(|h| h == name)?;
        Some(self.draws.iter().map(|row| row[col]).collect())
    }

    /// Variables `names` of draw `row` as a JSON object, with arrays nested
    /// in Stan index order (`x[i][j]` is column `x.i.j`).
    pub fn draw_json(
        &self,
        row: usize,
        names: &[&str],
    ) -> Result<serde_json::Map<String, Value>, DrawsError> {
        let variables = self.variables()?;
        let draw = self.draws.get(row).ok_or(DrawsError::RowOutOfRange {
            row,
            len: self.draws.len(),
        })?;
        let mut out = serde_json::Map::new();

        for &name in names {
            let var = variables
                .iter()
                .find(|v| v.name == name)
                .ok_or_else(|| DrawsError::UnknownVariable(name.to_string()))?;
            let entries: Vec<(&[usize], f64)> = var
                .columns
                .iter()
                .map(|(col, idx)| (idx.as_slice(), draw[*col]))
                .collect();
            out.insert(name.to_string(), nest(&entries));
        }

        Ok(out)
    }
}

fn nest(entries: &[(&[usize], f64)]) -> Value {
    match entries.first() {
        None => Value::Array(Vec::new()),
        Some((idx, value)) if idx.is_empty() => serde_json::json!(value),
        Some(_) => {
            let split: Vec<(usize, &[usize], f64)> = entries
                .iter()
                .filter_map(|&(idx, value)| idx.split_first().map(|(&head, rest)| (head, rest, value)))
                .collect();
            let extent = split.iter().map(|(head, _, _)| *head).max().unwrap_or(0);
            let items = (1..=extent)
                .map(|i| {
                    let inner: Vec<(&[usize], f64)> = split
                        .iter()
                        .filter(|(head, _, _)| *head == i)
                        .map(|&(_, rest, value)| (rest, value))
                        .collect();
                    nest(&inner)
                })
                .collect();
            Value::Array(items)
        }
    }
}

/// Draw files in `dir`: every `.csv` except CmdStan profiling output, sorted.
pub fn csv_files_in(dir: &Path) -> Result<Vec<PathBuf>, DrawsError> {
    let entries = fs::read_dir(dir).map_err(|source| DrawsError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            name.ends_with(".csv") && !name.ends_with("-profile.csv")
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PATHFINDER_CSV: &str = "# model = hybrid_pmf
# method = pathfinder
lp_approx__,lp__,v.1,v.2,v_MC,U_raw.1.1.1.1,U_raw.1.1.2.1,U_raw.1.1.1.2,U_raw.1.1.2.2,scale
-10.5,-12.1,0.11,0.21,0.5,1.0,2.0,3.0,4.0,0.7
-11.0,-12.8,0.12,0.22,0.6,1.5,2.5,3.5,4.5,0.8
-9.8,-11.9,0.13,0.23,0.7,1.1,2.1,3.1,4.1,0.9
# Elapsed Time: 0.1 seconds
";

    #[test]
    fn test_parse_skips_comments() {
        let csv = StanCsv::parse(PATHFINDER_CSV).unwrap();
        assert_eq!(csv.header.len(), 10);
        assert_eq!(csv.len(), 3);
        assert_eq!(csv.column("v_MC").unwrap(), vec![0.5, 0.6, 0.7]);
    }

    #[test]
    fn test_row_width_checked() {
        let err = StanCsv::parse("a,b\n1.0,2.0\n3.0\n").unwrap_err();
        assert!(matches!(
            err,
            DrawsError::RowWidth {
                line: 3,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_variables_grouped() {
        let csv = StanCsv::parse(PATHFINDER_CSV).unwrap();
        let vars = csv.variables().unwrap();
        let names: Vec<&str> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["v", "v_MC", "U_raw", "scale"]);
        assert_eq!(vars[0].dims(), vec![2]);
        assert_eq!(vars[1].dims(), Vec::<usize>::new());
        assert_eq!(vars[2].dims(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_draw_json_nests_matrices() {
        let csv = StanCsv::parse(PATHFINDER_CSV).unwrap();
        let draw = csv.draw_json(1, &["v", "v_MC", "U_raw"]).unwrap();
        assert_eq!(draw["v"], serde_json::json!([0.12, 0.22]));
        assert_eq!(draw["v_MC"], serde_json::json!(0.6));
        // column-major columns land at [row][col]
        assert_eq!(draw["U_raw"], serde_json::json!([[[[1.5, 3.5], [2.5, 4.5]]]]));
    }

    #[test]
    fn test_unknown_variable() {
        let csv = StanCsv::parse(PATHFINDER_CSV).unwrap();
        let err = csv.draw_json(0, &["V_raw"]).unwrap_err();
        assert!(matches!(err, DrawsError::UnknownVariable(name) if name == "V_raw"));
    }

    #[test]
    fn test_draw_out_of_range() {
        let csv = StanCsv::parse(PATHFINDER_CSV).unwrap();
        let err = csv.draw_json(3, &["v"]).unwrap_err();
        assert!(matches!(err, DrawsError::RowOutOfRange { row: 3, len: 3 }));
    }

    #[test]
    fn test_mixed_index_counts_rejected() {
        let csv = StanCsv::parse("lp__,a.1,a.1.2,b\n-1.0,0.5,0.6,0.7\n").unwrap();
        let err = csv.variables().unwrap_err();
        assert!(matches!(err, DrawsError::InconsistentRank(name) if name == "a"));
        assert!(matches!(csv.draw_json(0, &["b"]), Err(DrawsError::InconsistentRank(_))));

        let ragged = VariableColumns {
            name: "a".to_string(),
            columns: vec![(1, vec![2]), (2, vec![1, 3])],
        };
        assert_eq!(ragged.dims(), vec![2]);
    }

    #[test]
    fn test_nest_tolerates_missing_indices() {
        let inner: &[usize] = &[2, 1];
        let scalar: &[usize] = &[];
        let entries = vec![(inner, 4.0), (scalar, 9.0)];
        assert_eq!(nest(&entries), serde_json::json!([[], [4.0]]));
    }

    #[test]
    fn test_csv_files_skip_profiles() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["output_2.csv", "output_1.csv", "output-profile.csv", "notes.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let files = csv_files_in(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["output_1.csv", "output_2.csv"]);
    }
}
