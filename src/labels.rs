use std::{borrow::Cow, collections::BTreeMap, fs, path::Path};

use anyhow::Context;

/// Class id to display name mapping, built once from a labels file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
    names: BTreeMap<usize, String>,
}

impl LabelTable {
    /// Parses labels text. A line may start with `"<id>: "` or `"<id> "`;
    /// otherwise its 0-based line number is the id.
    pub fn parse(text: &str) -> Self {
        let mut names = BTreeMap::new();
        for (row, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match split_index(line) {
                Some((id, name)) => names.insert(id, name.to_string()),
                None => names.insert(row, line.to_string()),
            };
        }
        LabelTable { names }
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Name for `id`, or a placeholder when the table has no entry.
    pub fn display_name(&self, id: usize) -> Cow<'_, str> {
        match self.name(id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("id {}", id)),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

pub fn load_labels(path: impl AsRef<Path>) -> anyhow::Result<LabelTable> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read labels file {}", path.display()))?;
    Ok(LabelTable::parse(&text))
}

// "12: traffic light" -> (12, "traffic light")
fn split_index(line: &str) -> Option<(usize, &str)> {
    let sep = line.find(|c: char| c == ':' || c.is_whitespace())?;
    let (head, rest) = line.split_at(sep);
    let rest = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    if head.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id = head.parse().ok()?;
    Some((id, rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn colon_prefix_and_line_number_fallback() {
        let table = LabelTable::parse("0: cat\ndog\n");
        assert_eq!(table.len(), 2);
        assert_eq!(table.name(0), Some("cat"));
        assert_eq!(table.name(1), Some("dog"));
    }

    #[test]
    fn space_prefix_sets_explicit_id() {
        let table = LabelTable::parse("5 person\nbike\n");
        assert_eq!(table.name(5), Some("person"));
        assert_eq!(table.name(1), Some("bike"));
        assert_eq!(table.name(0), None);
    }

    #[test]
    fn unprefixed_multi_word_label_is_kept_whole() {
        let table = LabelTable::parse("person\ntraffic light\n");
        assert_eq!(table.name(1), Some("traffic light"));
    }

    #[test]
    fn later_duplicate_ids_overwrite() {
        let table = LabelTable::parse("3: car\n3: truck\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.name(3), Some("truck"));
    }

    #[test]
    fn blank_lines_keep_numbering() {
        let table = LabelTable::parse("cat\n\n  \nbird\n");
        assert_eq!(table.name(0), Some("cat"));
        assert_eq!(table.name(3), Some("bird"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn index_with_empty_name() {
        let table = LabelTable::parse("cat\n7:\n");
        assert_eq!(table.name(7), Some(""));
        assert_eq!(table.name(1), None);
    }

    #[test]
    fn bare_number_is_a_name() {
        let table = LabelTable::parse("42\n");
        assert_eq!(table.name(0), Some("42"));
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let table = LabelTable::parse("0: cat\n");
        assert_eq!(table.display_name(0), "cat");
        assert_eq!(table.display_name(7), "id 7");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0  person").unwrap();
        writeln!(file, "1:bicycle").unwrap();
        let table = load_labels(file.path()).unwrap();
        assert_eq!(table.name(0), Some("person"));
        assert_eq!(table.name(1), Some("bicycle"));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.txt");
        let err = load_labels(&path).unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }
}
