use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};

/// Relation name reserved for terminal subjects.
pub const ELLIPSIS: &str = "...";

/// Object ID reserved for public wildcard subjects.
pub const WILDCARD_OBJECT_ID: &str = "*";

const MIN_IDENTIFIER_LENGTH: usize = 3;
const MAX_IDENTIFIER_LENGTH: usize = 64;
const MIN_OBJECT_ID_LENGTH: usize = 3;
const MAX_OBJECT_ID_LENGTH: usize = 128;

/// An object-and-relation triple, e.g. `document:masterplan#viewer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAndRelation {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
}

impl ObjectAndRelation {
    pub fn new(namespace: &str, object_id: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            relation: relation.to_string(),
        }
    }

    /// An ONR whose relation is the ellipsis, i.e. a terminal subject.
    pub fn terminal(namespace: &str, object_id: &str) -> Self {
        Self::new(namespace, object_id, ELLIPSIS)
    }

    pub fn is_terminal(&self) -> bool {
        self.relation == ELLIPSIS
    }

    /// Validates the triple in resource position: the relation must be a
    /// concrete relation name, never the ellipsis.
    pub fn validate_as_resource(&self) -> Result<()> {
        validate_identifier("namespace", &self.namespace)?;
        validate_object_id(&self.object_id)?;
        validate_identifier("relation", &self.relation)
    }

    /// Validates the triple in subject position, where the ellipsis is
    /// permitted and the wildcard object ID is not.
    pub fn validate_as_subject(&self) -> Result<()> {
        validate_identifier("namespace", &self.namespace)?;
        validate_object_id(&self.object_id)?;
        if self.relation != ELLIPSIS {
            validate_identifier("relation", &self.relation)?;
        }
        Ok(())
    }
}

impl fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.namespace, self.object_id, self.relation)
    }
}

/// The subject side of a relationship: a concrete object (terminal or
/// userset) or the public wildcard for a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    Object(ObjectAndRelation),
    Wildcard { namespace: String },
}

impl Subject {
    pub fn terminal(namespace: &str, object_id: &str) -> Self {
        Subject::Object(ObjectAndRelation::terminal(namespace, object_id))
    }

    pub fn userset(namespace: &str, object_id: &str, relation: &str) -> Self {
        Subject::Object(ObjectAndRelation::new(namespace, object_id, relation))
    }

    pub fn wildcard(namespace: &str) -> Self {
        Subject::Wildcard {
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Subject::Object(onr) => &onr.namespace,
            Subject::Wildcard { namespace } => namespace,
        }
    }

    /// Relation component of the subject; wildcards are always terminal.
    pub fn relation(&self) -> &str {
        match self {
            Subject::Object(onr) => &onr.relation,
            Subject::Wildcard { .. } => ELLIPSIS,
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            Subject::Object(onr) => &onr.object_id,
            Subject::Wildcard { .. } => WILDCARD_OBJECT_ID,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Subject::Wildcard { .. })
    }

    /// Type key grouping subjects of the same namespace and relation.
    pub fn type_key(&self) -> String {
        format!("{}#{}", self.namespace(), self.relation())
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Subject::Object(onr) => onr.validate_as_subject(),
            Subject::Wildcard { namespace } => validate_identifier("namespace", namespace),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Object(onr) if onr.is_terminal() => {
                write!(f, "{}:{}", onr.namespace, onr.object_id)
            }
            Subject::Object(onr) => write!(f, "{onr}"),
            Subject::Wildcard { namespace } => write!(f, "{namespace}:*"),
        }
    }
}

/// Reference to a named caveat with its context bindings, as stored on a
/// relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaveatReference {
    pub caveat_name: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl CaveatReference {
    pub fn new(caveat_name: &str, context: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            caveat_name: caveat_name.to_string(),
            context,
        }
    }
}

/// A relationship tuple: resource has subject under the resource relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub resource: ObjectAndRelation,
    pub subject: Subject,
    pub caveat: Option<CaveatReference>,
}

impl Relationship {
    pub fn new(resource: ObjectAndRelation, subject: Subject) -> Self {
        Self {
            resource,
            subject,
            caveat: None,
        }
    }

    pub fn with_caveat(mut self, caveat: CaveatReference) -> Self {
        self.caveat = Some(caveat);
        self
    }

    /// Unique storage key: (resource, subject, caveat name).
    pub fn key(&self) -> String {
        let caveat_name = self
            .caveat
            .as_ref()
            .map(|c| c.caveat_name.as_str())
            .unwrap_or("");
        format!("{}@{}|{}", self.resource, self.subject, caveat_name)
    }

    pub fn validate(&self) -> Result<()> {
        self.resource.validate_as_resource()?;
        self.subject.validate()
    }

    /// Parses the text form, e.g. `document:masterplan#parent@folder:plans`
    /// or `document:secret#viewer@user:jill[ip_allowlist]`.
    pub fn parse(text: &str) -> Result<Self> {
        let (resource_part, subject_part) = text
            .split_once('@')
            .ok_or_else(|| EngineError::InvalidArgument(format!("malformed relationship `{text}`")))?;

        let resource = parse_onr(resource_part)
            .ok_or_else(|| EngineError::InvalidArgument(format!("malformed resource in `{text}`")))?;

        let (subject_part, caveat_name) = match subject_part.split_once('[') {
            Some((subject, rest)) => {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    EngineError::InvalidArgument(format!("malformed caveat in `{text}`"))
                })?;
                (subject, Some(name))
            }
            None => (subject_part, None),
        };

        let subject = parse_subject(subject_part)
            .ok_or_else(|| EngineError::InvalidArgument(format!("malformed subject in `{text}`")))?;

        let mut relationship = Relationship::new(resource, subject);
        if let Some(name) = caveat_name {
            relationship.caveat = Some(CaveatReference::new(name, serde_json::Map::new()));
        }
        Ok(relationship)
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.subject)?;
        if let Some(caveat) = &self.caveat {
            write!(f, "[{}]", caveat.caveat_name)?;
        }
        Ok(())
    }
}

fn parse_onr(text: &str) -> Option<ObjectAndRelation> {
    let (namespace, rest) = text.split_once(':')?;
    let (object_id, relation) = rest.split_once('#')?;
    if namespace.is_empty() || object_id.is_empty() || relation.is_empty() {
        return None;
    }
    Some(ObjectAndRelation::new(namespace, object_id, relation))
}

fn parse_subject(text: &str) -> Option<Subject> {
    let (namespace, rest) = text.split_once(':')?;
    if namespace.is_empty() || rest.is_empty() {
        return None;
    }
    if rest == WILDCARD_OBJECT_ID {
        return Some(Subject::wildcard(namespace));
    }
    match rest.split_once('#') {
        Some((object_id, relation)) if !object_id.is_empty() && !relation.is_empty() => {
            Some(Subject::userset(namespace, object_id, relation))
        }
        Some(_) => None,
        None => Some(Subject::terminal(namespace, rest)),
    }
}

/// The write operation carried by a relationship mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOperation {
    Create,
    Touch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub operation: UpdateOperation,
    pub relationship: Relationship,
}

impl RelationshipUpdate {
    pub fn create(relationship: Relationship) -> Self {
        Self {
            operation: UpdateOperation::Create,
            relationship,
        }
    }

    pub fn touch(relationship: Relationship) -> Self {
        Self {
            operation: UpdateOperation::Touch,
            relationship,
        }
    }

    pub fn delete(relationship: Relationship) -> Self {
        Self {
            operation: UpdateOperation::Delete,
            relationship,
        }
    }
}

/// Namespace and relation names: lowercase identifier, letter first.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) => {
            value.len() >= MIN_IDENTIFIER_LENGTH
                && value.len() <= MAX_IDENTIFIER_LENGTH
                && first.is_ascii_lowercase()
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(EngineError::InvalidArgument(format!(
            "invalid {kind} `{value}`"
        )));
    }
    Ok(())
}

/// Object IDs: letters, digits, `_`, `-` and `/`, bounded length.
pub fn validate_object_id(value: &str) -> Result<()> {
    let valid = value.len() >= MIN_OBJECT_ID_LENGTH
        && value.len() <= MAX_OBJECT_ID_LENGTH
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/');
    if !valid {
        return Err(EngineError::InvalidArgument(format!(
            "invalid object ID `{value}`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_round_trip() {
        let text = "document:masterplan#parent@folder:plans";
        let relationship = Relationship::parse(text).unwrap();
        assert_eq!(relationship.resource.relation, "parent");
        assert_eq!(relationship.subject, Subject::terminal("folder", "plans"));
        assert_eq!(relationship.to_string(), text);
    }

    #[test]
    fn test_parse_userset_subject() {
        let relationship =
            Relationship::parse("folder:company#viewer@folder:auditors#viewer").unwrap();
        assert_eq!(
            relationship.subject,
            Subject::userset("folder", "auditors", "viewer")
        );
    }

    #[test]
    fn test_parse_wildcard_subject() {
        let relationship = Relationship::parse("document:plan#viewer@user:*").unwrap();
        assert!(relationship.subject.is_wildcard());
        assert_eq!(relationship.to_string(), "document:plan#viewer@user:*");
    }

    #[test]
    fn test_parse_caveated() {
        let relationship =
            Relationship::parse("document:plan#viewer@user:jill[ip_allowlist]").unwrap();
        assert_eq!(relationship.caveat.unwrap().caveat_name, "ip_allowlist");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Relationship::parse(":#@:#").is_err());
        assert!(Relationship::parse("document:plan#viewer").is_err());
        assert!(Relationship::parse("document:plan@user:jill").is_err());
    }

    #[test]
    fn test_object_id_bounds() {
        assert!(validate_object_id("abc").is_ok());
        assert!(validate_object_id("ab").is_err());
        assert!(validate_object_id("with/slash-and_underscore").is_ok());
        assert!(validate_object_id("no spaces").is_err());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("relation", "viewer").is_ok());
        assert!(validate_identifier("relation", "Viewer").is_err());
        assert!(validate_identifier("relation", "").is_err());
        assert!(validate_identifier("relation", "ad").is_err());
        assert!(validate_identifier("relation", "9lives").is_err());
    }

    #[test]
    fn test_subject_type_keys() {
        assert_eq!(Subject::terminal("user", "jill").type_key(), "user#...");
        assert_eq!(
            Subject::userset("folder", "auditors", "viewer").type_key(),
            "folder#viewer"
        );
        assert_eq!(Subject::wildcard("user").type_key(), "user#...");
    }
}
