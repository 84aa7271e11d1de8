use crate::model::EntityKind;

/// What a request URL addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `/<collection>`
    Collection(EntityKind),
    /// `/<collection>/<id>`
    Resource(EntityKind, String),
    /// `/me`
    CurrentUser,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// URL path without the query string.
    pub path: String,
    pub target: Target,
}

impl Route {
    pub fn parse(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let target = match segments.as_slice() {
            ["me"] => Target::CurrentUser,
            [collection] => EntityKind::from_remote_collection(collection)
                .map(Target::Collection)
                .unwrap_or(Target::Other),
            [collection, id] => EntityKind::from_remote_collection(collection)
                .map(|kind| Target::Resource(kind, (*id).to_string()))
                .unwrap_or(Target::Other),
            _ => Target::Other,
        };
        Self {
            path: path.to_string(),
            target,
        }
    }

    pub fn entity(&self) -> Option<EntityKind> {
        match &self.target {
            Target::Collection(kind) | Target::Resource(kind, _) => Some(*kind),
            Target::CurrentUser => Some(EntityKind::User),
            Target::Other => None,
        }
    }
}
