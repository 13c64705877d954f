/// One header name with every value received or added for it, in order.
///
/// Names are kept exactly as received; lookups are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub values: Vec<String>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }

    /// Parses a header line without its terminator.
    ///
    /// The line is split on the first `": "`. A line without that separator
    /// becomes a header with no values.
    pub fn parse(line: &str) -> Self {
        match line.split_once(": ") {
            Some((name, value)) => Self::new(name, value),
            None => Self {
                name: line.to_string(),
                values: Vec::new(),
            },
        }
    }

    /// First value, if any.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    pub fn merge(&mut self, other: Header) {
        self.values.extend(other.values);
    }

    /// Renders `Name: v1; v2\r\n`.
    pub fn render(&self) -> String {
        format!("{}: {}\r\n", self.name, self.values.join("; "))
    }
}

/// Headers in first-seen order. Inserting a name that is already present
/// appends its values instead of replacing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, header: Header) {
        match self.entries.iter_mut().find(|h| h.name == header.name) {
            Some(existing) => existing.merge(header),
            None => self.entries.push(header),
        }
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(Header::new(name, value));
    }

    pub fn get(&self, name: &str) -> Option<&Header> {
        self.entries.iter().find(|h| h.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Header::value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    /// `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.value("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.value("Content-Type")
    }

    /// Renders every header line, without the terminating blank line.
    pub fn encode(&self) -> String {
        self.entries.iter().map(Header::render).collect()
    }
}
