//! Row-addressable tables with 1-based rows and columns, spreadsheet style.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid cell address row={row} column={column}")]
    InvalidAddress { row: usize, column: usize },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed worksheet {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("worksheet unavailable: {0}")]
    Unavailable(String),
}

/// A single table. Implementations provide the raw grid plus two write primitives;
/// lookups are derived from the grid.
#[async_trait]
pub trait Worksheet: Send + Sync {
    fn title(&self) -> &str;

    /// Every row, top to bottom. Rows may be ragged.
    async fn all_values(&self) -> Result<Vec<Vec<String>>, StoreError>;

    async fn update_cell(&self, row: usize, column: usize, value: &str) -> Result<(), StoreError>;

    /// Overwrite cells `1..=values.len()` of `row`, growing the table if needed.
    async fn write_row(&self, row: usize, values: &[String]) -> Result<(), StoreError>;

    /// Values of `column` down to its last non-empty cell.
    async fn col_values(&self, column: usize) -> Result<Vec<String>, StoreError> {
        check_column(column)?;
        let rows = self.all_values().await?;
        let mut values: Vec<String> = rows
            .iter()
            .map(|r| r.get(column - 1).cloned().unwrap_or_default())
            .collect();
        while values.last().is_some_and(|v| v.is_empty()) {
            values.pop();
        }
        Ok(values)
    }

    async fn row_values(&self, row: usize) -> Result<Vec<String>, StoreError> {
        check_row(row)?;
        let rows = self.all_values().await?;
        Ok(rows.get(row - 1).cloned().unwrap_or_default())
    }

    async fn cell(&self, row: usize, column: usize) -> Result<String, StoreError> {
        check_column(column)?;
        let values = self.row_values(row).await?;
        Ok(values.get(column - 1).cloned().unwrap_or_default())
    }

    /// First row whose cell in `column` equals `value` exactly.
    async fn find_in_column(&self, column: usize, value: &str) -> Result<Option<usize>, StoreError> {
        check_column(column)?;
        let rows = self.all_values().await?;
        Ok(rows
            .iter()
            .position(|r| r.get(column - 1).is_some_and(|cell| cell == value))
            .map(|idx| idx + 1))
    }
}

fn check_row(row: usize) -> Result<(), StoreError> {
    if row == 0 {
        return Err(StoreError::InvalidAddress { row, column: 1 });
    }
    Ok(())
}

fn check_column(column: usize) -> Result<(), StoreError> {
    if column == 0 {
        return Err(StoreError::InvalidAddress { row: 1, column });
    }
    Ok(())
}

fn set_cell(rows: &mut Vec<Vec<String>>, row: usize, column: usize, value: &str) -> Result<(), StoreError> {
    if row == 0 || column == 0 {
        return Err(StoreError::InvalidAddress { row, column });
    }
    if rows.len() < row {
        rows.resize_with(row, Vec::new);
    }
    let cells = &mut rows[row - 1];
    if cells.len() < column {
        cells.resize(column, String::new());
    }
    cells[column - 1] = value.to_string();
    Ok(())
}

fn set_row(rows: &mut Vec<Vec<String>>, row: usize, values: &[String]) -> Result<(), StoreError> {
    check_row(row)?;
    for (idx, value) in values.iter().enumerate() {
        set_cell(rows, row, idx + 1, value)?;
    }
    Ok(())
}

/// Worksheet held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryWorksheet {
    title: String,
    rows: StdMutex<Vec<Vec<String>>>,
}

impl MemoryWorksheet {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            rows: StdMutex::new(Vec::new()),
        }
    }

    pub fn with_rows(title: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            title: title.into(),
            rows: StdMutex::new(rows),
        }
    }

    /// Single-column sheet, one value per row.
    pub fn from_column<I, S>(title: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_rows(title, values.into_iter().map(|v| vec![v.into()]).collect())
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<String>>> {
        // A poisoned grid is still a consistent grid: every mutation is a single assignment.
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Worksheet for MemoryWorksheet {
    fn title(&self) -> &str {
        &self.title
    }

    async fn all_values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self.rows())
    }

    async fn update_cell(&self, row: usize, column: usize, value: &str) -> Result<(), StoreError> {
        set_cell(&mut self.lock(), row, column, value)
    }

    async fn write_row(&self, row: usize, values: &[String]) -> Result<(), StoreError> {
        set_row(&mut self.lock(), row, values)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorksheetFile {
    title: String,
    #[serde(default)]
    rows: Vec<Vec<String>>,
}

/// Worksheet persisted as a JSON document, re-read on every access so edits made
/// outside the process are observed. Writes go through a temp file and an atomic rename.
///
/// A missing file reads as an empty table and is created by the first write, unless
/// the worksheet was built with [`FileWorksheet::required`].
#[derive(Debug)]
pub struct FileWorksheet {
    title: String,
    path: PathBuf,
    required: bool,
    write_lock: Mutex<()>,
}

impl FileWorksheet {
    pub fn new(title: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            path: path.into(),
            required: false,
            write_lock: Mutex::new(()),
        }
    }

    /// Treat a missing file as an unavailable worksheet instead of an empty one.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    async fn load(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if self.required {
                    return Err(StoreError::Unavailable(format!(
                        "worksheet '{}' not found at {}",
                        self.title,
                        self.path.display()
                    )));
                }
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let file: WorksheetFile =
            serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        Ok(file.rows)
    }

    async fn store(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;

        let bytes = serde_json::to_vec_pretty(&WorksheetFile {
            title: self.title.clone(),
            rows,
        })
        .map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Worksheet for FileWorksheet {
    fn title(&self) -> &str {
        &self.title
    }

    async fn all_values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        self.load().await
    }

    async fn update_cell(&self, row: usize, column: usize, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self.load().await?;
        set_cell(&mut rows, row, column, value)?;
        self.store(rows).await
    }

    async fn write_row(&self, row: usize, values: &[String]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self.load().await?;
        set_row(&mut rows, row, values)?;
        self.store(rows).await
    }
}

/// A directory of worksheets, one `<title>.json` file each.
#[derive(Debug, Clone)]
pub struct Workbook {
    root: PathBuf,
}

impl Workbook {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Worksheet `title`, created on first write if it does not exist yet.
    pub fn worksheet(&self, title: &str) -> FileWorksheet {
        FileWorksheet::new(title, self.root.join(format!("{title}.json")))
    }

    /// Worksheet `title`, which must already exist when it is read.
    pub fn existing_worksheet(&self, title: &str) -> FileWorksheet {
        self.worksheet(title).required()
    }
}
