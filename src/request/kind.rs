use std::fmt;

/// Kind of schema change, derived from the request body
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScKind {
    Table,
    Restripe,
    Queue,
    Upgrade,
}

impl ScKind {
    pub fn full_name(&self) -> &'static str {
        match self {
            ScKind::Table => "Table",
            ScKind::Restripe => "Restripe",
            ScKind::Queue => "Queue",
            ScKind::Upgrade => "Upgrade",
        }
    }
}

impl fmt::Display for ScKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}
