//! Deterministic emission of canonical schema text from in-memory
//! definitions.
//!
//! The generator is best-effort: malformed definitions still produce
//! text, with the problem marked by a visible issue comment and the
//! returned flag set to false.

use crate::caveats::Predicate;
use crate::schema::{
    AllowedRelation, AllowedTarget, CaveatDefinition, Metadata, NamespaceDefinition, RelationDef,
    SchemaDefinition, SetOperationChild, UsersetRewrite,
};

/// Maximum length for a block comment to stay on a single line.
pub const MAX_SINGLE_LINE_COMMENT_LENGTH: usize = 70;

/// Generates the canonical text for an ordered list of definitions.
/// Returns the text and whether it was produced without issues.
pub fn generate_schema(definitions: &[SchemaDefinition]) -> (String, bool) {
    let mut generated = Vec::with_capacity(definitions.len());
    let mut ok = true;
    for definition in definitions {
        let (source, result) = match definition {
            SchemaDefinition::Namespace(namespace) => generate_namespace_source(namespace),
            SchemaDefinition::Caveat(caveat) => generate_caveat_source(caveat),
        };
        ok = ok && result;
        generated.push(source);
    }
    (generated.join("\n\n"), ok)
}

/// Generates the canonical text for a single object definition.
pub fn generate_namespace_source(namespace: &NamespaceDefinition) -> (String, bool) {
    let mut generator = SourceGenerator::new();
    generator.emit_namespace(namespace);
    (generator.buf, !generator.has_issue)
}

/// Generates the canonical text for a single caveat definition.
pub fn generate_caveat_source(caveat: &CaveatDefinition) -> (String, bool) {
    let mut generator = SourceGenerator::new();
    generator.emit_caveat(caveat);
    (generator.buf, !generator.has_issue)
}

struct SourceGenerator {
    buf: String,
    indentation_level: usize,
    has_newline: bool,
    has_blankline: bool,
    has_new_scope: bool,
    has_issue: bool,
}

impl SourceGenerator {
    fn new() -> Self {
        Self {
            buf: String::new(),
            indentation_level: 0,
            has_newline: true,
            has_blankline: true,
            has_new_scope: true,
            has_issue: false,
        }
    }

    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.has_newline {
            for _ in 0..self.indentation_level {
                self.buf.push('\t');
            }
            self.has_newline = false;
        }
        self.buf.push_str(text);
        self.has_blankline = false;
        self.has_new_scope = false;
    }

    fn append_line(&mut self) {
        if self.has_newline {
            self.has_blankline = true;
        }
        self.buf.push('\n');
        self.has_newline = true;
    }

    fn ensure_blank_line_or_new_scope(&mut self) {
        if !self.has_blankline && !self.has_new_scope {
            if !self.has_newline {
                self.append_line();
            }
            self.append_line();
        }
    }

    fn indent(&mut self) {
        self.indentation_level += 1;
    }

    fn dedent(&mut self) {
        self.indentation_level -= 1;
    }

    fn mark_new_scope(&mut self) {
        self.has_new_scope = true;
    }

    fn append_issue(&mut self, message: &str) {
        self.append(&format!("/* {message} */"));
        self.has_issue = true;
    }

    fn emit_caveat(&mut self, caveat: &CaveatDefinition) {
        self.emit_comments(&caveat.metadata);
        self.append("caveat ");
        self.append(&caveat.name);
        self.append("(");

        // parameter map order is not semantic; emission is by name
        for (index, (name, parameter_type)) in caveat.parameter_types.iter().enumerate() {
            if index > 0 {
                self.append(", ");
            }
            self.append(name);
            self.append(" ");
            self.append(parameter_type.canonical());
        }

        self.append(")");
        self.append(" {");
        self.append_line();
        self.indent();
        self.mark_new_scope();

        match Predicate::deserialize(&caveat.serialized_expression) {
            Ok(predicate) => {
                self.append(predicate.expr_string().trim());
            }
            Err(_) => self.append_issue("invalid caveat expression bytes"),
        }
        self.append_line();

        self.dedent();
        self.append("}");
    }

    fn emit_namespace(&mut self, namespace: &NamespaceDefinition) {
        self.emit_comments(&namespace.metadata);
        self.append("definition ");
        self.append(&namespace.name);

        if namespace.relations.is_empty() {
            self.append(" {}");
            return;
        }

        self.append(" {");
        self.append_line();
        self.indent();
        self.mark_new_scope();

        for relation in &namespace.relations {
            self.emit_relation(relation);
        }

        self.dedent();
        self.append("}");
    }

    fn emit_relation(&mut self, relation: &RelationDef) {
        let is_permission = relation.is_permission();

        self.emit_comments(&relation.metadata);
        if is_permission {
            self.append("permission ");
        } else {
            self.append("relation ");
        }
        self.append(&relation.name);

        if !is_permission {
            self.append(": ");
            let allowed = relation.allowed_direct_relations();
            if allowed.is_empty() {
                self.append_issue("missing allowed types");
            } else {
                for (index, allowed_relation) in allowed.iter().enumerate() {
                    if index > 0 {
                        self.append(" | ");
                    }
                    self.emit_allowed_relation(allowed_relation);
                }
            }
        }

        if let Some(rewrite) = &relation.userset_rewrite {
            self.append(" = ");
            self.emit_rewrite(rewrite);
        }

        self.append_line();
    }

    fn emit_allowed_relation(&mut self, allowed: &AllowedRelation) {
        self.append(&allowed.namespace);
        match &allowed.target {
            AllowedTarget::Ellipsis => {}
            AllowedTarget::Relation(relation) => {
                self.append("#");
                self.append(relation);
            }
            AllowedTarget::PublicWildcard => self.append(":*"),
        }
        if let Some(caveat_name) = &allowed.required_caveat {
            self.append(" with ");
            self.append(caveat_name);
        }
    }

    fn emit_rewrite(&mut self, rewrite: &UsersetRewrite) {
        let operator = match rewrite {
            UsersetRewrite::Union(_) => "+",
            UsersetRewrite::Intersection(_) => "&",
            UsersetRewrite::Exclusion(_) => "-",
        };
        for (index, child) in rewrite.children().iter().enumerate() {
            if index > 0 {
                self.append(&format!(" {operator} "));
            }
            self.emit_set_op_child(child);
        }
    }

    fn emit_set_op_child(&mut self, child: &SetOperationChild) {
        match child {
            SetOperationChild::Rewrite(rewrite) => {
                if is_all_union(rewrite) {
                    self.emit_rewrite(rewrite);
                } else {
                    self.append("(");
                    self.emit_rewrite(rewrite);
                    self.append(")");
                }
            }
            SetOperationChild::This => {
                self.append_issue(
                    "_this unsupported here. Please rewrite into a relation and permission",
                );
            }
            SetOperationChild::Nil => self.append("nil"),
            SetOperationChild::ComputedUserset { relation } => self.append(relation),
            SetOperationChild::TupleToUserset {
                tupleset_relation,
                computed_relation,
            } => {
                self.append(tupleset_relation);
                self.append("->");
                self.append(computed_relation);
            }
        }
    }

    fn emit_comments(&mut self, metadata: &Metadata) {
        if !metadata.comments.is_empty() {
            self.ensure_blank_line_or_new_scope();
        }
        for comment in &metadata.comments {
            self.append_comment(comment);
        }
    }

    fn append_comment(&mut self, comment: &str) {
        let trimmed = comment.trim();
        if let Some(stripped) = trimmed.strip_prefix("/*") {
            let (marker, stripped) = match stripped.strip_prefix('*') {
                Some(rest) => ("/**", rest),
                None => ("/*", stripped),
            };
            self.append(marker);

            let content = stripped.trim_end_matches("*/").trim();
            let requires_multiline =
                content.len() > MAX_SINGLE_LINE_COMMENT_LENGTH || content.contains('\n');

            if requires_multiline {
                self.append_line();
                for line in content.lines() {
                    self.append(" * ");
                    self.append(line.trim().trim_start_matches('*').trim());
                    self.append_line();
                }
                self.append(" */");
                self.append_line();
            } else {
                self.append(" ");
                self.append(content.trim_start_matches('*').trim());
                self.append(" */");
                self.append_line();
            }
        } else if let Some(stripped) = trimmed.strip_prefix("//") {
            self.append("// ");
            self.append(stripped.trim());
            self.append_line();
        }
    }
}

fn is_all_union(rewrite: &UsersetRewrite) -> bool {
    match rewrite {
        UsersetRewrite::Union(children) => children.iter().all(|child| match child {
            SetOperationChild::Rewrite(nested) => is_all_union(nested),
            _ => true,
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caveats::{CompareOp, ParameterType};
    use crate::schema::{Metadata, TypeInformation};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_empty_definition_collapses() {
        let definition = NamespaceDefinition::new("user", vec![]);
        let (source, ok) = generate_namespace_source(&definition);
        assert!(ok);
        assert_eq!(source, "definition user {}");
    }

    #[test]
    fn test_relations_and_permissions() {
        let definition = NamespaceDefinition::new(
            "document",
            vec![
                RelationDef::relation("parent", vec![AllowedRelation::terminal("folder")]),
                RelationDef::relation(
                    "viewer",
                    vec![
                        AllowedRelation::terminal("user"),
                        AllowedRelation::with_relation("group", "member"),
                        AllowedRelation::wildcard("user"),
                    ],
                ),
                RelationDef::permission(
                    "view",
                    UsersetRewrite::union(vec![
                        SetOperationChild::computed("viewer"),
                        SetOperationChild::arrow("parent", "view"),
                    ]),
                ),
            ],
        );
        let (source, ok) = generate_namespace_source(&definition);
        assert!(ok);
        assert_eq!(
            source,
            "definition document {\n\
             \trelation parent: folder\n\
             \trelation viewer: user | group#member | user:*\n\
             \tpermission view = viewer + parent->view\n\
             }"
        );
    }

    #[test]
    fn test_missing_allowed_types_flags_issue() {
        let definition = NamespaceDefinition::new(
            "document",
            vec![RelationDef {
                name: "viewer".to_string(),
                type_information: None,
                userset_rewrite: None,
                metadata: Metadata::default(),
            }],
        );
        let (source, ok) = generate_namespace_source(&definition);
        assert!(!ok);
        assert!(source.contains("/* missing allowed types */"));
    }

    #[test]
    fn test_this_leaf_flags_issue() {
        let definition = NamespaceDefinition::new(
            "document",
            vec![RelationDef {
                name: "viewer".to_string(),
                type_information: Some(TypeInformation {
                    allowed_direct_relations: vec![AllowedRelation::terminal("user")],
                }),
                userset_rewrite: Some(UsersetRewrite::union(vec![
                    SetOperationChild::This,
                    SetOperationChild::computed("owner"),
                ])),
                metadata: Metadata::default(),
            }],
        );
        let (source, ok) = generate_namespace_source(&definition);
        assert!(!ok);
        assert!(source.contains("_this unsupported here"));
    }

    #[test]
    fn test_exclusion_is_left_to_right() {
        let definition = NamespaceDefinition::new(
            "document",
            vec![RelationDef::permission(
                "allowed",
                UsersetRewrite::exclusion(vec![
                    SetOperationChild::computed("viewer"),
                    SetOperationChild::computed("banned"),
                    SetOperationChild::computed("suspended"),
                ]),
            )],
        );
        let (source, _) = generate_namespace_source(&definition);
        assert!(source.contains("permission allowed = viewer - banned - suspended"));
    }

    #[test]
    fn test_non_union_child_is_parenthesized() {
        let definition = NamespaceDefinition::new(
            "document",
            vec![RelationDef::permission(
                "view",
                UsersetRewrite::union(vec![
                    SetOperationChild::computed("owner"),
                    SetOperationChild::Rewrite(UsersetRewrite::exclusion(vec![
                        SetOperationChild::computed("viewer"),
                        SetOperationChild::computed("banned"),
                    ])),
                    SetOperationChild::Rewrite(UsersetRewrite::union(vec![
                        SetOperationChild::computed("editor"),
                        SetOperationChild::Nil,
                    ])),
                ]),
            )],
        );
        let (source, ok) = generate_namespace_source(&definition);
        assert!(ok);
        assert!(source.contains("permission view = owner + (viewer - banned) + editor + nil"));
    }

    #[test]
    fn test_caveat_emission_sorts_parameters() {
        let mut parameters = BTreeMap::new();
        parameters.insert("second_param".to_string(), ParameterType::String);
        parameters.insert("first_param".to_string(), ParameterType::Int);

        let predicate = Predicate::compare(
            CompareOp::Eq,
            Predicate::param("first_param"),
            Predicate::literal(json!(42)),
        );
        let caveat = CaveatDefinition::new("only_on_tuesday", parameters, &predicate).unwrap();

        let (source, ok) = generate_caveat_source(&caveat);
        assert!(ok);
        assert_eq!(
            source,
            "caveat only_on_tuesday(first_param int, second_param string) {\n\
             \tfirst_param == 42\n\
             }"
        );
    }

    #[test]
    fn test_short_block_comment_stays_single_line() {
        let content = "a".repeat(MAX_SINGLE_LINE_COMMENT_LENGTH);
        let mut definition = NamespaceDefinition::new("user", vec![]);
        definition.metadata = Metadata::with_comment(&format!("/* {content} */"));

        let (source, _) = generate_namespace_source(&definition);
        assert_eq!(source, format!("/* {content} */\ndefinition user {{}}"));
    }

    #[test]
    fn test_long_block_comment_becomes_multiline() {
        let content = "a".repeat(MAX_SINGLE_LINE_COMMENT_LENGTH + 1);
        let mut definition = NamespaceDefinition::new("user", vec![]);
        definition.metadata = Metadata::with_comment(&format!("/* {content} */"));

        let (source, _) = generate_namespace_source(&definition);
        assert_eq!(
            source,
            format!("/*\n * {content}\n */\ndefinition user {{}}")
        );
    }

    #[test]
    fn test_line_comments_are_normalized() {
        let mut definition = NamespaceDefinition::new("user", vec![]);
        definition.metadata = Metadata::with_comment("//   some note   ");

        let (source, _) = generate_namespace_source(&definition);
        assert_eq!(source, "// some note\ndefinition user {}");
    }

    #[test]
    fn test_relation_comment_preceded_by_blank_line() {
        let definition = NamespaceDefinition::new(
            "document",
            vec![
                RelationDef::relation("owner", vec![AllowedRelation::terminal("user")]),
                RelationDef::relation("viewer", vec![AllowedRelation::terminal("user")])
                    .with_metadata(Metadata::with_comment("// read access")),
            ],
        );
        let (source, _) = generate_namespace_source(&definition);
        assert_eq!(
            source,
            "definition document {\n\
             \trelation owner: user\n\
             \n\
             \t// read access\n\
             \trelation viewer: user\n\
             }"
        );
    }

    #[test]
    fn test_schema_joins_definitions_with_blank_line() {
        let definitions = vec![
            SchemaDefinition::Namespace(NamespaceDefinition::new("user", vec![])),
            SchemaDefinition::Namespace(NamespaceDefinition::new(
                "folder",
                vec![RelationDef::relation(
                    "viewer",
                    vec![AllowedRelation::terminal("user")],
                )],
            )),
        ];
        let (source, ok) = generate_schema(&definitions);
        assert!(ok);
        assert_eq!(
            source,
            "definition user {}\n\ndefinition folder {\n\trelation viewer: user\n}"
        );
    }

    #[test]
    fn test_allowed_relation_with_required_caveat() {
        let definition = NamespaceDefinition::new(
            "document",
            vec![RelationDef::relation(
                "viewer",
                vec![AllowedRelation::terminal("user").with_caveat("ip_allowlist")],
            )],
        );
        let (source, ok) = generate_namespace_source(&definition);
        assert!(ok);
        assert!(source.contains("relation viewer: user with ip_allowlist"));
    }
}
