/// Case-insensitive, insertion ordered header multimap.
///
/// Field names keep the case they were first inserted with, lookups ignore case.
/// Most fields are merged into a single entry, but fields that may legally repeat with distinct
/// meaning (like `Set-Cookie`) can be kept as separate entries with `append_raw`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, appending to an existing entry with a bare `,`.
    pub fn insert_merged(&mut self, field: &str, value: &str) {
        let entry = self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(field));

        match entry {
            Some((_, existing)) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => self.entries.push((field.to_string(), value.to_string())),
        }
    }

    /// Add a separate entry, even if the field already exists.
    pub fn append_raw(&mut self, field: &str, value: &str) {
        self.entries.push((field.to_string(), value.to_string()));
    }

    /// Set a value, replacing every existing entry of the field.
    pub fn replace(&mut self, field: &str, value: &str) {
        self.remove(field);
        self.append_raw(field, value);
    }

    /// Get the first value of a field, or an empty string if it's missing.
    pub fn get(&self, field: &str) -> &str {
        self.get_nth(field, 0)
    }

    /// Get the `index`th separate entry of a field, or an empty string if it's missing.
    pub fn get_nth(&self, field: &str, index: usize) -> &str {
        self.entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(field))
            .nth(index)
            .map(|(_, value)| value.as_str())
            .unwrap_or("")
    }

    /// Get the first value of a field, if present.
    pub fn find(&self, field: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(field))
            .map(|(_, value)| value.as_str())
    }

    /// Get all separate entries of a field.
    pub fn get_all<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(field))
            .map(|(_, value)| value.as_str())
    }

    /// Append text to the last entry of a field, separated by a space.
    ///
    /// Used for obsolete header line folding.
    pub(crate) fn extend_value(&mut self, field: &str, text: &str) -> bool {
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(field));
        let Some((_, value)) = entry else {
            return false;
        };

        value.push(' ');
        value.push_str(text);
        true
    }

    pub fn contains(&self, field: &str) -> bool {
        self.find(field).is_some()
    }

    /// Remove every entry of a field, returning the removed values.
    pub fn remove(&mut self, field: &str) -> Vec<String> {
        let mut removed = Vec::new();

        self.entries.retain(|(key, value)| {
            if key.eq_ignore_ascii_case(field) {
                removed.push(value.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Case-insensitive check if a header value contains `needle`.
pub fn ci_contains(value: &str, needle: &str) -> bool {
    value
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_repeated_fields() {
        let mut headers = Headers::new();
        headers.insert_merged("Field2", "A");
        headers.insert_merged("field2", "B");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("FIELD2"), "A,B");
    }

    #[test]
    fn raw_entries_are_indexed() {
        let mut headers = Headers::new();
        headers.append_raw("Set-Cookie", "a=1");
        headers.append_raw("set-cookie", "b=2");

        assert_eq!(headers.get("set-cookie"), "a=1");
        assert_eq!(headers.get_nth("Set-Cookie", 1), "b=2");
        assert_eq!(headers.get_nth("Set-Cookie", 2), "");
    }

    #[test]
    fn missing_field_is_empty() {
        let headers = Headers::new();

        assert_eq!(headers.get("missing"), "");
        assert!(headers.find("missing").is_none());
    }

    #[test]
    fn replace_and_remove() {
        let mut headers = Headers::new();
        headers.append_raw("A", "1");
        headers.append_raw("B", "2");
        headers.append_raw("a", "3");

        headers.replace("A", "4");
        assert_eq!(headers.get_all("a").collect::<Vec<_>>(), ["4"]);

        assert_eq!(headers.remove("b"), ["2"]);
        assert!(!headers.contains("B"));
    }
}
