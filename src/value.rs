/// Result of a [`Database::lookup`](crate::Database::lookup)
///
/// A DUPSORT database always answers with `Duplicates`, in sorted order,
/// even when the key holds a single value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Single(Vec<u8>),
    Duplicates(Vec<Vec<u8>>),
}

impl Lookup {
    /// The first (or only) value
    pub fn first(&self) -> &[u8] {
        match self {
            Lookup::Single(value) => value,
            Lookup::Duplicates(values) => values.first().map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Lookup::Single(_) => 1,
            Lookup::Duplicates(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<Vec<u8>> {
        match self {
            Lookup::Single(value) => vec![value],
            Lookup::Duplicates(values) => values,
        }
    }
}
