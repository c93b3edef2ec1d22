use std::collections::HashMap;

use crate::error::IngestError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    ExternalId,
    RollClass,
    PctPresent,
    Email,
}

impl Column {
    pub fn name(self) -> &'static str {
        match self {
            Column::ExternalId => "externalId",
            Column::RollClass => "rollClass",
            Column::PctPresent => "pctPresent",
            Column::Email => "email",
        }
    }

    fn synonyms(self) -> &'static [&'static str] {
        match self {
            Column::ExternalId => &[
                "externalid",
                "studentid",
                "sentralid",
                "studentnumber",
                "studentno",
                "studentcode",
            ],
            Column::RollClass => &[
                "rollclass",
                "rollgroup",
                "rollclassname",
                "roll",
                "rollid",
                "homegroup",
                "homeroom",
            ],
            Column::PctPresent => &[
                "pctpresent",
                "percentpresent",
                "attendance",
                "attendancepct",
                "attendancepercent",
                "attendancepercentage",
                "attendancerate",
                "wholedayattendance",
                "percentage",
                "percent",
                "pct",
            ],
            Column::Email => &["email", "emailaddress", "studentemail"],
        }
    }

    /// Generic names, used only when no header matches [`Column::synonyms`].
    fn fallbacks(self) -> &'static [&'static str] {
        match self {
            Column::ExternalId => &["student", "id"],
            Column::RollClass => &["class"],
            Column::PctPresent => &["present"],
            Column::Email => &["mail"],
        }
    }
}

pub fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    indices: HashMap<Column, usize>,
}

impl ColumnMap {
    pub fn get(&self, column: Column) -> Option<usize> {
        self.indices.get(&column).copied()
    }

    pub(crate) fn field<'r>(&self, record: &'r csv::StringRecord, column: Column) -> &'r str {
        self.get(column)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .unwrap_or("")
    }
}

/// Resolve header positions. The first header matching a specific synonym
/// wins, then the first matching a fallback.
pub fn match_columns(
    headers: &csv::StringRecord,
    required: &[Column],
    optional: &[Column],
) -> Result<ColumnMap, IngestError> {
    let normalized: Vec<String> = headers.iter().map(normalize_header).collect();
    let position = |names: &'static [&'static str]| {
        normalized
            .iter()
            .position(|header| names.iter().any(|name| header == name))
    };

    let mut map = ColumnMap::default();
    for column in required.iter().chain(optional) {
        if let Some(idx) = position(column.synonyms()).or_else(|| position(column.fallbacks())) {
            map.indices.insert(*column, idx);
        }
    }

    if required.iter().any(|column| map.get(*column).is_none()) {
        return Err(IngestError::MissingColumns {
            required: required.iter().map(|c| c.name().to_string()).collect(),
            found: headers
                .iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
        });
    }
    Ok(map)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub external_id: String,
    pub roll_class: String,
    pub pct_present: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub rows: Vec<NormalizedRow>,
    pub input_rows: usize,
}

impl Normalized {
    pub fn dropped(&self) -> usize {
        self.input_rows - self.rows.len()
    }
}

/// Rows with an empty identifier or roll class or a non-finite percentage
/// are dropped without error.
pub fn normalize_attendance(bytes: &[u8]) -> Result<Normalized, IngestError> {
    let mut reader = reader(bytes);
    let headers = reader.headers()?.clone();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestError::EmptyInput);
    }
    let columns = match_columns(
        &headers,
        &[Column::ExternalId, Column::RollClass, Column::PctPresent],
        &[],
    )?;

    let mut normalized = Normalized::default();
    for record in reader.records() {
        let record = record?;
        normalized.input_rows += 1;

        let external_id = columns.field(&record, Column::ExternalId);
        let roll_class = columns.field(&record, Column::RollClass);
        if external_id.is_empty() || roll_class.is_empty() {
            continue;
        }
        let Some(pct) = parse_percentage(columns.field(&record, Column::PctPresent)) else {
            continue;
        };

        normalized.rows.push(NormalizedRow {
            external_id: external_id.to_string(),
            roll_class: roll_class.to_string(),
            pct_present: clamp_percentage(pct),
        });
    }

    if normalized.input_rows == 0 {
        return Err(IngestError::EmptyInput);
    }
    Ok(normalized)
}

pub fn parse_percentage(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let value = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn clamp_percentage(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

pub fn storage_key(external_id: &str) -> String {
    external_id.trim().replace(['/', '\\'], "_")
}

pub(crate) fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes)
}
