//! Store master data loaded once at worker start-up.

use std::collections::HashMap;
use std::path::Path;

use crate::models::store::{ReferenceDataSet, StoreRecord};

const STORE_ID_COLUMN: &str = "StoreID";
const STORE_NAME_COLUMN: &str = "StoreName";
const AREA_CODE_COLUMN: &str = "AreaCode";

/// Read and parse the store master CSV file.
pub async fn load(path: impl AsRef<Path>) -> Result<ReferenceDataSet, ReferenceDataError> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ReferenceDataError::Io(path.display().to_string(), e))?;

    let data = parse(&contents)?;
    tracing::info!(path = %path.display(), stores = data.len(), "Loaded store reference data");
    Ok(data)
}

/// Parse CSV text with a header row. Columns may appear in any order;
/// blank lines are skipped and later rows win on duplicate store ids.
pub fn parse(contents: &str) -> Result<ReferenceDataSet, ReferenceDataError> {
    let mut lines = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header) = lines.next().ok_or(ReferenceDataError::Empty)?;
    let header = split_row(header.trim_start_matches('\u{feff}'));
    let column = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ReferenceDataError::MissingColumn(name.to_string()))
    };
    let id_idx = column(STORE_ID_COLUMN)?;
    let name_idx = column(STORE_NAME_COLUMN)?;
    let area_idx = column(AREA_CODE_COLUMN)?;

    let mut stores = HashMap::new();
    for (line_no, line) in lines {
        let fields = split_row(line);
        let field = |idx: usize| {
            fields
                .get(idx)
                .cloned()
                .ok_or(ReferenceDataError::ShortRow(line_no + 1))
        };

        let store_id = field(id_idx)?;
        if store_id.is_empty() {
            continue;
        }
        stores.insert(
            store_id,
            StoreRecord {
                store_name: field(name_idx)?,
                area_code: field(area_idx)?,
            },
        );
    }

    Ok(ReferenceDataSet::new(stores))
}

/// Split one CSV row, honouring double-quoted fields and `""` escapes.
fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

#[derive(Debug, thiserror::Error)]
pub enum ReferenceDataError {
    #[error("Failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("Reference data is empty")]
    Empty,

    #[error("Missing column {0}")]
    MissingColumn(String),

    #[error("Line {0} has too few columns")]
    ShortRow(usize),
}
