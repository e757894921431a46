// Comma separated files with a header row, read and written through `csv`.

use serde::{de::DeserializeOwned, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum TableError {

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected header: {0}")]
    Header(String),

}

pub type Result<T> = std::result::Result<T, TableError>;

// A serde record with a fixed column layout.
// HEADER lists the serialized field names in declaration order.
pub trait Record: Serialize + DeserializeOwned {
    const HEADER: &'static [&'static str];
}

// Decodes every row as `R`. Blank lines are ignored, an empty input has no rows.
pub fn from_csv<R: Record>(data: &[u8]) -> Result<Vec<R>> {
    let mut reader = csv::ReaderBuilder::new().from_reader(data);
    let header = reader.headers()?.clone();
    if header.is_empty() {
        return Ok(Vec::new());
    }
    if header.iter().ne(R::HEADER.iter().copied()) {
        return Err(TableError::Header(header.iter().collect::<Vec<_>>().join(",")));
    }

    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}

// The header is always written, even without rows.
pub fn to_csv<R: Record>(records: &[R]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(R::HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.into_inner().map_err(|e| TableError::Io(e.into_error()))
}

// Derived tables whose columns depend on the data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {

    pub header: Vec<String>,

    pub rows: Vec<Vec<String>>,

}

impl Table {

    pub fn new<S: Into<String>>(header: impl IntoIterator<Item = S>) -> Self {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.header.len(), "row width does not match header");
        self.rows.push(row);
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.into_inner().map_err(|e| TableError::Io(e.into_error()))
    }

}

// Undefined statistics are written as empty cells.
pub fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde_derive::Serialize, serde_derive::Deserialize)]
    struct Note {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "Count")]
        count: u32,
    }

    impl Record for Note {
        const HEADER: &'static [&'static str] = &["Id", "Count"];
    }

    #[test]
    fn test_quoting() {
        let notes = vec![
            Note { id: "a,b".into(), count: 1 },
            Note { id: "say \"hi\"\ntwice".into(), count: 2 },
        ];
        let csv = to_csv(&notes).unwrap();
        assert_eq!(
            String::from_utf8(csv.clone()).unwrap(),
            "Id,Count\n\"a,b\",1\n\"say \"\"hi\"\"\ntwice\",2\n"
        );
        assert_eq!(from_csv::<Note>(&csv).unwrap(), notes);
    }

    #[test]
    fn test_blank_lines_and_crlf() {
        let notes: Vec<Note> = from_csv(b"Id,Count\r\nx,1\r\n\r\n\ny,2\n\n").unwrap();
        assert_eq!(notes, vec![Note { id: "x".into(), count: 1 }, Note { id: "y".into(), count: 2 }]);
    }

    #[test]
    fn test_empty_input() {
        assert!(from_csv::<Note>(b"").unwrap().is_empty());
        assert_eq!(String::from_utf8(to_csv::<Note>(&[]).unwrap()).unwrap(), "Id,Count\n");
    }

    #[test]
    fn test_foreign_header_rejected() {
        let err = from_csv::<Note>(b"something,else\n1,2\n").unwrap_err();
        assert!(matches!(err, TableError::Header(h) if h == "something,else"));
    }

    #[test]
    fn test_ragged_row_rejected() {
        assert!(matches!(from_csv::<Note>(b"Id,Count\n1,2,3\n"), Err(TableError::Csv(_))));
        assert!(from_csv::<Note>(b"Id,Count\nx,many\n").is_err());
    }

    #[test]
    fn test_table_empty_cells() {
        let mut table = Table::new(["a", "b", "c"]);
        table.push(vec!["1".into(), fmt_opt(None), fmt_opt(Some(0.5))]);
        assert_eq!(String::from_utf8(table.to_csv().unwrap()).unwrap(), "a,b,c\n1,,0.5\n");
    }
}
