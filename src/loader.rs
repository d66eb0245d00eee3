use csv::{ReaderBuilder, StringRecord};
use tracing::info;

use crate::dto::{LinkageConfig, Mode};
use crate::error::{LinkageError, Result};
use crate::record::{Record, RecordId, Side};

/// Original cell values of one input row, exactly as read.
pub type RawRow = Vec<String>;

///
/// One loaded input file: its header, the normalized records used for
/// comparison, and the untouched raw rows used for output. Both vectors are
/// indexed by ordinal position, so `records[i]` and `raw_rows[i]` describe
/// the same line.
///
#[derive(Clone, Debug)]
pub struct Dataset {
    header: Vec<String>,
    records: Vec<Record>,
    raw_rows: Vec<RawRow>,
    side: Option<Side>,
}

impl Dataset {
    ///
    /// Parses delimited text whose first line is the header.
    ///
    /// ## Arguments
    ///
    /// * `raw_text` - Already-cleaned file contents.
    /// * `delimiter` - Field delimiter byte.
    /// * `match_fields` - Fields that must be present in the header.
    /// * `side` - Side tag for link mode; `None` yields bare ordinal ids.
    ///
    pub fn load<S: AsRef<str>>(
        raw_text: &str,
        delimiter: u8,
        match_fields: &[S],
        side: Option<Side>,
    ) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(raw_text.as_bytes());
        let header: Vec<String> = reader
            .headers()
            .map_err(|err| LinkageError::input(format!("unable to read header: {err}")))?
            .iter()
            .map(str::to_string)
            .collect();
        let source = side.map_or("input", |s| s.tag());
        for field in match_fields {
            if !header.iter().any(|h| h == field.as_ref()) {
                return Err(LinkageError::missing_field(field.as_ref(), source));
            }
        }

        let mut records = Vec::new();
        let mut raw_rows = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| LinkageError::input(format!("{source}: {err}")))?;
            records.push(normalize_row(&header, &row));
            raw_rows.push(row.iter().map(str::to_string).collect());
        }
        info!(source, rows = records.len(), columns = header.len(), "dataset loaded");
        Ok(Dataset {
            header,
            records,
            raw_rows,
            side,
        })
    }

    ///
    /// Renames normalized record fields positionally from `from` to `to`,
    /// leaving raw rows and the header untouched. Used to project a second
    /// file's column names onto the first file's comparison schema.
    ///
    pub fn with_renamed_fields<S: AsRef<str>>(mut self, from: &[S], to: &[S]) -> Result<Self> {
        if from.len() != to.len() {
            return Err(LinkageError::config(format!(
                "cannot map {} fields onto {} fields",
                from.len(),
                to.len()
            )));
        }
        for record in self.records.iter_mut() {
            let mut renamed = Record::new();
            for (old, new) in from.iter().zip(to) {
                let value = record.remove(old.as_ref()).flatten();
                renamed.insert(new.as_ref(), value);
            }
            for (field, value) in record.fields() {
                if !renamed.contains_field(field) {
                    renamed.insert(field, value.map(str::to_string));
                }
            }
            *record = renamed;
        }
        Ok(self)
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn side(&self) -> Option<Side> {
        self.side
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn id(&self, ordinal: usize) -> RecordId {
        RecordId::new(self.side, ordinal)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Records paired with their ids, in file order.
    pub fn entries(&self) -> impl Iterator<Item = (RecordId, &Record)> {
        self.records
            .iter()
            .enumerate()
            .map(move |(ordinal, record)| (self.id(ordinal), record))
    }

    pub fn record(&self, id: RecordId) -> Option<&Record> {
        self.owns(id).then(|| &self.records[id.ordinal()])
    }

    pub fn raw_row(&self, id: RecordId) -> Option<&RawRow> {
        self.owns(id).then(|| &self.raw_rows[id.ordinal()])
    }

    pub fn raw_rows(&self) -> &[RawRow] {
        &self.raw_rows
    }

    /// Whether `id` names a row of this dataset.
    pub fn owns(&self, id: RecordId) -> bool {
        id.side() == self.side && id.ordinal() < self.records.len()
    }
}

fn normalize_row(header: &[String], row: &StringRecord) -> Record {
    let mut record = Record::new();
    for (i, field) in header.iter().enumerate() {
        match row.get(i) {
            Some(raw) => record.insert_raw(field, raw),
            None => record.insert(field, None),
        }
    }
    record
}

/// Datasets for one run, shaped by mode.
#[derive(Clone, Debug)]
pub enum Inputs {
    Dedup(Dataset),
    Link(Dataset, Dataset),
}

impl Inputs {
    ///
    /// Loads the raw texts for `mode`: one for dedup, two for link.
    ///
    /// In link mode the second file is checked against `secondaryFields`
    /// when configured, and its records are renamed onto the match fields
    /// so both sides share one comparison schema.
    ///
    pub fn load(config: &LinkageConfig, mode: Mode, texts: &[String]) -> Result<Self> {
        let delimiter = config.delimiter_byte()?;
        let fields = config.match_fields();
        match (mode, texts) {
            (Mode::Dedup, [text]) => Ok(Inputs::Dedup(Dataset::load(text, delimiter, &fields, None)?)),
            (Mode::Link, [text_a, text_b]) => {
                let a = Dataset::load(text_a, delimiter, &fields, Some(Side::A))?;
                let b = match &config.secondary_fields {
                    Some(secondary) => Dataset::load(text_b, delimiter, secondary, Some(Side::B))?
                        .with_renamed_fields(secondary, &fields)?,
                    None => Dataset::load(text_b, delimiter, &fields, Some(Side::B))?,
                };
                Ok(Inputs::Link(a, b))
            }
            (mode, texts) => Err(LinkageError::config(format!(
                "{mode:?} mode takes {} input file(s), got {}",
                if mode == Mode::Dedup { 1 } else { 2 },
                texts.len()
            ))),
        }
    }
}

/// Decodes file bytes as UTF-8, dropping a leading byte-order mark.
pub fn decode_input(bytes: Vec<u8>, source: &str) -> Result<String> {
    let text = String::from_utf8(bytes)
        .map_err(|err| LinkageError::input(format!("{source} is not valid UTF-8: {err}")))?;
    Ok(match text.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::FieldDefinition;

    const SCHOOLS: &str = "School,Town\n\"St Mary's\",Leeds\n  ST   MARY'S ,leeds\nOakwood,\n";

    #[test]
    fn load_assigns_bare_ordinals_in_file_order() {
        let dataset = Dataset::load(SCHOOLS, b',', &["School"], None).unwrap();
        let ids: Vec<String> = dataset.entries().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
        assert_eq!(dataset.header(), &["School", "Town"]);
    }

    #[test]
    fn load_tags_ids_with_side() {
        let dataset = Dataset::load(SCHOOLS, b',', &["School"], Some(Side::B)).unwrap();
        assert_eq!(dataset.id(2).to_string(), "B|2");
        assert!(dataset.owns(RecordId::tagged(Side::B, 2)));
        assert!(!dataset.owns(RecordId::tagged(Side::A, 2)));
        assert!(!dataset.owns(RecordId::tagged(Side::B, 3)));
    }

    #[test]
    fn raw_rows_are_untouched_and_records_normalized() {
        let dataset = Dataset::load(SCHOOLS, b',', &["School"], None).unwrap();
        let id = RecordId::bare(1);
        assert_eq!(dataset.raw_row(id).unwrap()[0], "  ST   MARY'S ");
        assert_eq!(dataset.record(id).unwrap().get("School"), Some("st mary's"));
        assert_eq!(dataset.record(RecordId::bare(2)).unwrap().get("Town"), None);
    }

    #[test]
    fn missing_match_field_is_reported() {
        let err = Dataset::load(SCHOOLS, b',', &["Postcode"], Some(Side::A)).unwrap_err();
        match err {
            LinkageError::MissingField { field, dataset } => {
                assert_eq!(field, "Postcode");
                assert_eq!(dataset, "A");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn custom_delimiter_and_short_rows() {
        let dataset = Dataset::load("a;b\n1\n", b';', &["a"], None).unwrap();
        let record = dataset.record(RecordId::bare(0)).unwrap();
        assert_eq!(record.get("a"), Some("1"));
        assert!(record.contains_field("b"));
        assert_eq!(record.get("b"), None);
        assert_eq!(dataset.raw_rows()[0], vec!["1".to_string()]);
    }

    #[test]
    fn renamed_fields_follow_position() {
        let dataset = Dataset::load("Name,City\nOakwood,York\n", b',', &["Name"], Some(Side::B))
            .unwrap()
            .with_renamed_fields(&["Name", "City"], &["School", "Town"])
            .unwrap();
        let record = dataset.record(RecordId::tagged(Side::B, 0)).unwrap();
        assert_eq!(record.get("School"), Some("oakwood"));
        assert_eq!(record.get("Town"), Some("york"));
        assert!(!record.contains_field("Name"));
        assert_eq!(dataset.header(), &["Name", "City"]);
    }

    #[test]
    fn link_inputs_project_secondary_columns() {
        let mut config = LinkageConfig::new(vec![FieldDefinition::string("School")]);
        config.secondary_fields = Some(vec!["Name".to_string()]);
        let texts = ["School\nOakwood\n".to_string(), "Name\nOAKWOOD\n".to_string()];
        let Inputs::Link(a, b) = Inputs::load(&config, Mode::Link, &texts).unwrap() else {
            panic!("expected link inputs");
        };
        assert_eq!(a.len(), 1);
        let record = b.record(RecordId::tagged(Side::B, 0)).unwrap();
        assert_eq!(record.get("School"), Some("oakwood"));
    }

    #[test]
    fn input_count_must_fit_mode() {
        let config = LinkageConfig::new(vec![FieldDefinition::string("School")]);
        let err = Inputs::load(&config, Mode::Link, &["School\n".to_string()]).unwrap_err();
        assert!(matches!(err, LinkageError::Config(_)));
    }

    #[test]
    fn decoding_strips_bom_and_rejects_invalid_bytes() {
        let text = decode_input(b"\xef\xbb\xbfa,b\n".to_vec(), "input").unwrap();
        assert_eq!(text, "a,b\n");
        let err = decode_input(vec![0xff, 0xfe], "input").unwrap_err();
        assert!(matches!(err, LinkageError::Input(_)));
    }
}
