/// One labelled span of the decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub protocol: &'static str,
    pub depth: usize,
    pub offset: usize,
    pub length: usize,
    pub label: String,
}

/// Flattened field tree; nesting is expressed through `depth`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FieldTree {
    fields: Vec<Field>,
    depth: usize,
}

impl FieldTree {
    pub fn push(
        &mut self,
        protocol: &'static str,
        offset: usize,
        length: usize,
        label: impl Into<String>,
    ) {
        self.fields.push(Field {
            protocol,
            depth: self.depth,
            offset,
            length,
            label: label.into(),
        });
    }

    /// Pushes a field and makes subsequent fields its children until `close`.
    pub fn open(
        &mut self,
        protocol: &'static str,
        offset: usize,
        length: usize,
        label: impl Into<String>,
    ) {
        self.push(protocol, offset, length, label);
        self.depth += 1;
    }

    pub fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.label.as_str())
    }

    pub fn contains_label(&self, needle: &str) -> bool {
        self.labels().any(|label| label.contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
