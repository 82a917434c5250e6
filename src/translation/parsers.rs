use std::collections::HashMap;

pub(super) fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Case-insensitive name → bound position map. Names may be given with or
/// without their leading `:`; the first spelling of a duplicate wins.
pub(super) struct NameLookup {
    positions: HashMap<String, usize>,
}

impl NameLookup {
    pub(super) fn new<S: AsRef<str>>(names: &[S]) -> Self {
        let mut positions = HashMap::with_capacity(names.len());
        for (pos, name) in names.iter().enumerate() {
            positions.entry(normalize(name.as_ref())).or_insert(pos);
        }
        Self { positions }
    }

    pub(super) fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(&name.to_lowercase()).copied()
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_start_matches(':').to_lowercase()
}
