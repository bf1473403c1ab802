//! 数据集概要（编排器自身的加载结果，也是内置 summary 引擎的产物）
use serde::Serialize;

use crate::loader::{LoadedTable, SizeClass};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub non_empty: usize,
    pub distinct: usize,
    /// 所有非空值都能解析为数字
    pub numeric: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub rows: usize,
    pub columns: usize,
    pub column_names: Vec<String>,
    pub estimated_bytes: u64,
    pub size_class: SizeClass,
    pub chunks_read: usize,
    pub warnings: usize,
    pub column_stats: Vec<ColumnSummary>,
}

impl DatasetSummary {
    pub fn from_loaded(loaded: &LoadedTable) -> Self {
        let table = &loaded.table;
        let column_stats = table
            .headers()
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let values: Vec<&str> = table
                    .rows()
                    .iter()
                    .filter_map(|r| r.get(idx).map(|v| v.trim()))
                    .filter(|v| !v.is_empty())
                    .collect();
                let distinct = values.iter().collect::<std::collections::HashSet<_>>().len();
                let numeric = !values.is_empty() && values.iter().all(|v| v.parse::<f64>().is_ok());
                ColumnSummary { name: name.clone(), non_empty: values.len(), distinct, numeric }
            })
            .collect();

        Self {
            rows: table.row_count(),
            columns: table.column_count(),
            column_names: table.headers().to_vec(),
            estimated_bytes: table.estimated_bytes(),
            size_class: loaded.size_class,
            chunks_read: loaded.chunks_read,
            warnings: loaded.warnings.len(),
            column_stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delimiter::Delimiter;
    use crate::loader::{DatasetLoader, LoadOptions};
    use std::io::Write;

    #[test]
    fn summarizes_columns() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"id;city;temp\n1;Oslo;-3.5\n2;Lima;\n3;Oslo;19\n").unwrap();
        f.flush().unwrap();
        let loaded = DatasetLoader::without_memory_monitoring(LoadOptions::default())
            .load(f.path(), Delimiter::SEMICOLON)
            .unwrap();
        let s = DatasetSummary::from_loaded(&loaded);
        assert_eq!(s.rows, 3);
        assert_eq!(s.column_names, vec!["id", "city", "temp"]);
        assert_eq!(s.size_class, SizeClass::Small);
        let city = &s.column_stats[1];
        assert_eq!((city.non_empty, city.distinct, city.numeric), (3, 2, false));
        let temp = &s.column_stats[2];
        assert_eq!((temp.non_empty, temp.distinct, temp.numeric), (2, 2, true));
        assert!(s.estimated_bytes > 0);
    }
}
