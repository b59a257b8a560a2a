use thiserror::Error;

use crate::session::{Row, SourceRow};

pub const REQUIRED_COLUMNS: &[&str] = &["name", "email", "company"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ImportError {
    #[error("CSV file is empty")]
    Empty,

    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

fn split_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse CSV text into rows keyed by lower-cased header.
///
/// Rows whose field count differs from the header are dropped.
pub fn parse_csv(text: &str) -> Result<Vec<SourceRow>, ImportError> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let headers: Vec<String> = match lines.next() {
        Some(header) => split_line(header)
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect(),
        None => return Err(ImportError::Empty),
    };

    let mut table = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let values = split_line(line);
        if values.len() != headers.len() {
            log::warn!(
                "Skipping CSV line {}: expected {} fields, found {}",
                line_no + 2,
                headers.len(),
                values.len()
            );
            continue;
        }
        let row: SourceRow = headers
            .iter()
            .cloned()
            .zip(values.iter().map(|v| v.trim().replace('"', "")))
            .collect();
        table.push(row);
    }

    if table.is_empty() {
        return Err(ImportError::Empty);
    }

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|col| !headers.iter().any(|h| h.as_str() == **col))
        .map(|col| col.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MissingColumns(missing));
    }

    Ok(table)
}

/// Build session rows from the source table, one per table row.
pub fn rows_from_table(table: &[SourceRow]) -> Vec<Row> {
    let field = |row: &SourceRow, key: &str| row.get(key).cloned().unwrap_or_default();
    table
        .iter()
        .enumerate()
        .map(|(row_index, source)| Row {
            name: field(source, "name"),
            email: field(source, "email"),
            company: field(source, "company"),
            row_index,
            ..Row::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_fields_and_lowercases_headers() {
        let csv = "Name,Email,Company,Notes\n\
                   Al,a@x.com,Acme,\"likes, commas\"\n\
                   \n\
                   \"Bo\",\"b@y.com, c@y.com\",Beta,none\n";
        let table = parse_csv(csv).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table[0]["name"], "Al");
        assert_eq!(table[0]["notes"], "likes, commas");
        assert_eq!(table[1]["name"], "Bo");
        assert_eq!(table[1]["email"], "b@y.com, c@y.com");
    }

    #[test]
    fn drops_rows_with_wrong_field_count() {
        let csv = "name,email,company\nAl,a@x.com,Acme\nbroken,row\n";
        assert_eq!(parse_csv(csv).unwrap().len(), 1);
    }

    #[test]
    fn reports_missing_columns() {
        let err = parse_csv("name,mail\nAl,a@x.com\n").unwrap_err();
        assert_eq!(
            err,
            ImportError::MissingColumns(vec!["email".to_string(), "company".to_string()])
        );
        assert_eq!(err.to_string(), "Missing required columns: email, company");
    }

    #[test]
    fn quoted_header_keeps_its_commas() {
        let csv = "name,email,company,\"Notes, misc\"\nAl,a@x.com,Acme,\"likes, commas\"\n";
        let table = parse_csv(csv).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table[0]["notes, misc"], "likes, commas");
    }

    #[test]
    fn header_only_is_empty() {
        assert_eq!(parse_csv("name,email,company\n"), Err(ImportError::Empty));
        assert_eq!(parse_csv(""), Err(ImportError::Empty));
    }

    #[test]
    fn rows_keep_table_position() {
        let table = parse_csv("name,email,company\nAl,a@x.com,Acme\nBo,,Beta\n").unwrap();
        let rows = rows_from_table(&table);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].row_index, 1);
        assert_eq!(rows[1].company, "Beta");
        assert!(rows[1].email.is_empty());
    }
}
