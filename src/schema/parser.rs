//! Declaration DSL parser and second-pass linker.

use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;

use super::{
    BackrefPolicy, EntitySchema, FieldKind, ParsedField, ParsedSchema, PrimitiveType,
    RelationOperator, RelationshipDescriptor, DEFAULT_FUZZY_THRESHOLD,
};
use crate::error::{EntigraphError, Result};

/// Parse a schema definition with default settings.
pub fn parse_schema(definition: &Value) -> Result<ParsedSchema> {
    SchemaParser::new().parse(definition)
}

/// Parse a YAML (`.yaml`/`.yml`) or JSON schema file.
pub fn parse_schema_file(path: &Path) -> Result<ParsedSchema> {
    SchemaParser::new().parse_file(path)
}

/// Schema parser. Holds the compiled DSL grammar and linking policy.
pub struct SchemaParser {
    relation_re: Regex,
    pascal_re: Regex,
    ident_re: Regex,
    default_threshold: f32,
    backref_policy: BackrefPolicy,
}

#[derive(Debug, Default, Clone, Copy)]
struct Modifiers {
    array: bool,
    optional: bool,
    required: bool,
    indexed: bool,
    unique: bool,
}

impl Default for SchemaParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaParser {
    pub fn new() -> Self {
        let relation_re = Regex::new(
            r"(?s)^(?P<prompt>.*?)\s*(?P<op>->|~>|<-|<~)\s*(?P<targets>[A-Za-z_][A-Za-z0-9_]*(?:\s*\|\s*[A-Za-z_][A-Za-z0-9_]*)*)(?:\.(?P<backref>[A-Za-z_][A-Za-z0-9_]*))?\s*(?:\((?P<threshold>[^)]*)\))?\s*(?P<array>\[\])?\s*(?P<optional>\?)?\s*$",
        )
        .expect("Invalid regex pattern");
        let pascal_re = Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("Invalid regex pattern");
        let ident_re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex pattern");

        Self {
            relation_re,
            pascal_re,
            ident_re,
            default_threshold: DEFAULT_FUZZY_THRESHOLD,
            backref_policy: BackrefPolicy::default(),
        }
    }

    pub fn with_default_threshold(mut self, threshold: f32) -> Self {
        self.default_threshold = threshold;
        self
    }

    pub fn with_backref_policy(mut self, policy: BackrefPolicy) -> Self {
        self.backref_policy = policy;
        self
    }

    pub fn parse_file(&self, path: &Path) -> Result<ParsedSchema> {
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let definition: Value = match extension.as_str() {
            "yaml" | "yml" => serde_yaml_ng::from_str(&content).map_err(|e| {
                EntigraphError::Parse(format!("YAML parse error in {}: {}", path.display(), e))
            })?,
            "json" => serde_json::from_str(&content).map_err(|e| {
                EntigraphError::Parse(format!("JSON parse error in {}: {}", path.display(), e))
            })?,
            other => {
                return Err(EntigraphError::Parse(format!(
                    "unsupported schema file extension '{}' ({})",
                    other,
                    path.display()
                )))
            }
        };

        self.parse(&definition)
    }

    /// Parse and link a whole schema. Every validation error surfaces here.
    pub fn parse(&self, definition: &Value) -> Result<ParsedSchema> {
        let root = definition.as_object().ok_or_else(|| {
            EntigraphError::Schema("schema must be a map of entity types".to_string())
        })?;

        let mut entities = Vec::with_capacity(root.len());
        for (type_name, declarations) in root {
            entities.push(self.parse_entity(type_name, declarations)?);
        }

        self.link(&mut entities)?;

        log::debug!("Parsed schema with {} entity types", entities.len());
        Ok(ParsedSchema::from_entities(entities))
    }

    fn parse_entity(&self, type_name: &str, declarations: &Value) -> Result<EntitySchema> {
        if !self.ident_re.is_match(type_name) {
            return Err(EntigraphError::Schema(format!(
                "invalid entity type name '{}'",
                type_name
            )));
        }

        let declarations = declarations.as_object().ok_or_else(|| {
            EntigraphError::Schema(format!("{}: declarations must be a map", type_name))
        })?;

        let mut entity = EntitySchema {
            name: type_name.to_string(),
            fields: Vec::new(),
            instructions: None,
            context_types: Vec::new(),
            metadata: Map::new(),
            disabled: Vec::new(),
        };

        for (key, declaration) in declarations {
            if let Some(meta) = key.strip_prefix('$') {
                match meta {
                    "instructions" => {
                        entity.instructions = declaration.as_str().map(str::to_string);
                    }
                    "context" => {
                        entity.context_types = string_list(declaration);
                    }
                    _ => {
                        entity.metadata.insert(key.clone(), declaration.clone());
                    }
                }
                continue;
            }

            match self.parse_field(type_name, key, declaration)? {
                Some(field) => entity.fields.push(field),
                None => entity.disabled.push(key.clone()),
            }
        }

        Ok(entity)
    }

    /// Parse one declaration. `None` means the field is disabled (`null`).
    fn parse_field(
        &self,
        type_name: &str,
        name: &str,
        declaration: &Value,
    ) -> Result<Option<ParsedField>> {
        let (text, wrapped_array) = match declaration {
            Value::Null => return Ok(None),
            Value::String(s) => (s.as_str(), false),
            Value::Array(items) if items.len() == 1 => match &items[0] {
                Value::String(s) => (s.as_str(), true),
                _ => {
                    return Err(EntigraphError::Schema(format!(
                        "{}.{}: array declaration must wrap a string",
                        type_name, name
                    )))
                }
            },
            _ => {
                return Err(EntigraphError::Schema(format!(
                    "{}.{}: unsupported declaration {}",
                    type_name, name, declaration
                )))
            }
        };

        if let Some(field) = self.parse_relationship(type_name, name, text, wrapped_array)? {
            return Ok(Some(field));
        }

        Ok(Some(self.parse_primitive(name, text, wrapped_array)))
    }

    fn parse_relationship(
        &self,
        type_name: &str,
        name: &str,
        text: &str,
        wrapped_array: bool,
    ) -> Result<Option<ParsedField>> {
        let trimmed = text.trim();
        let Some(caps) = self.relation_re.captures(trimmed) else {
            if ["->", "~>", "<-", "<~"].iter().any(|t| trimmed.starts_with(t)) {
                return Err(EntigraphError::Schema(format!(
                    "{}.{}: malformed relationship declaration '{}'",
                    type_name, name, text
                )));
            }
            return Ok(None);
        };

        let operator = RelationOperator::from_token(&caps["op"])
            .ok_or_else(|| EntigraphError::Schema(format!("unknown operator in '{}'", text)))?;

        let target_types: Vec<String> = caps["targets"]
            .split('|')
            .map(|t| t.trim().to_string())
            .collect();

        let threshold = match caps.name("threshold") {
            Some(raw) => {
                if !operator.is_fuzzy() {
                    return Err(EntigraphError::Schema(format!(
                        "{}.{}: threshold is only valid on fuzzy operators ('{}')",
                        type_name, name, text
                    )));
                }
                let value: f32 = raw.as_str().trim().parse().map_err(|_| {
                    EntigraphError::Schema(format!(
                        "{}.{}: invalid threshold '{}'",
                        type_name,
                        name,
                        raw.as_str()
                    ))
                })?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(EntigraphError::Schema(format!(
                        "{}.{}: threshold {} outside [0, 1]",
                        type_name, name, value
                    )));
                }
                Some(value)
            }
            None if operator.is_fuzzy() => Some(self.default_threshold),
            None => None,
        };

        let prompt = caps
            .name("prompt")
            .map(|p| p.as_str().trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        let descriptor = RelationshipDescriptor {
            operator,
            source_type: type_name.to_string(),
            source_field: name.to_string(),
            target_types,
            backref_field: caps.name("backref").map(|b| b.as_str().to_string()),
            threshold,
        };

        // Backward exact fields are reverse queries and therefore always lists.
        let is_array = wrapped_array
            || caps.name("array").is_some()
            || operator == RelationOperator::BackwardExact;

        Ok(Some(ParsedField {
            name: name.to_string(),
            kind: FieldKind::Relationship(descriptor),
            is_array,
            is_optional: caps.name("optional").is_some(),
            is_required: false,
            indexed: false,
            unique: false,
            prompt,
            declaration: text.to_string(),
            synthesized: false,
        }))
    }

    fn parse_primitive(&self, name: &str, text: &str, wrapped_array: bool) -> ParsedField {
        let (base, mods) = strip_modifiers(text.trim());

        let typed = PrimitiveType::from_name(base).or_else(|| {
            if base.contains('|') {
                let members: Vec<String> = base.split('|').map(|m| m.trim().to_string()).collect();
                if members.iter().all(|m| self.pascal_re.is_match(m)) {
                    Some(PrimitiveType::Enum(members))
                } else {
                    None
                }
            } else if self.pascal_re.is_match(base) {
                Some(PrimitiveType::Marker(base.to_string()))
            } else {
                None
            }
        });

        match typed {
            Some(primitive) => ParsedField {
                name: name.to_string(),
                kind: FieldKind::Primitive(primitive),
                is_array: wrapped_array || mods.array,
                is_optional: mods.optional,
                is_required: mods.required,
                indexed: mods.indexed,
                unique: mods.unique,
                prompt: None,
                declaration: text.to_string(),
                synthesized: false,
            },
            // Anything else is a free-text generation prompt.
            None => ParsedField {
                name: name.to_string(),
                kind: FieldKind::Primitive(PrimitiveType::String),
                is_array: wrapped_array,
                is_optional: false,
                is_required: false,
                indexed: false,
                unique: false,
                prompt: Some(text.trim().to_string()),
                declaration: text.to_string(),
                synthesized: false,
            },
        }
    }

    /// Second pass: validate targets, synthesize declared backrefs and pair
    /// backward fields with their forward counterparts.
    fn link(&self, entities: &mut [EntitySchema]) -> Result<()> {
        let known: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();

        for entity in entities.iter() {
            for (field, rel) in entity.relationships() {
                for target in &rel.target_types {
                    if !known.contains(target) {
                        return Err(EntigraphError::Schema(format!(
                            "{}.{}: unknown relationship target type '{}'",
                            entity.name, field.name, target
                        )));
                    }
                }
            }
        }

        self.synthesize_backrefs(entities)?;
        self.pair_backward_fields(entities)?;
        Ok(())
    }

    fn synthesize_backrefs(&self, entities: &mut [EntitySchema]) -> Result<()> {
        // (target type, backref name, source type, source field)
        let mut wanted: Vec<(String, String, String, String)> = Vec::new();
        for entity in entities.iter() {
            for (field, rel) in entity.relationships() {
                if !rel.operator.is_forward() {
                    continue;
                }
                if let Some(backref) = &rel.backref_field {
                    for target in &rel.target_types {
                        wanted.push((
                            target.clone(),
                            backref.clone(),
                            entity.name.clone(),
                            field.name.clone(),
                        ));
                    }
                }
            }
        }

        for (target_type, backref, source_type, source_field) in wanted {
            let target = entities
                .iter_mut()
                .find(|e| e.name == target_type)
                .ok_or_else(|| {
                    EntigraphError::Schema(format!("unknown entity type '{}'", target_type))
                })?;

            match target.field_mut(&backref) {
                None => {
                    log::debug!(
                        "Synthesizing {}.{} <- {}.{}",
                        target_type,
                        backref,
                        source_type,
                        source_field
                    );
                    target.fields.push(ParsedField {
                        name: backref.clone(),
                        kind: FieldKind::Relationship(RelationshipDescriptor {
                            operator: RelationOperator::BackwardExact,
                            source_type: target_type.clone(),
                            source_field: backref.clone(),
                            target_types: vec![source_type.clone()],
                            backref_field: Some(source_field.clone()),
                            threshold: None,
                        }),
                        is_array: true,
                        is_optional: true,
                        is_required: false,
                        indexed: false,
                        unique: false,
                        prompt: None,
                        declaration: format!("<-{}.{}", source_type, source_field),
                        synthesized: true,
                    });
                }
                Some(existing) => match &mut existing.kind {
                    FieldKind::Primitive(_) => {
                        return Err(EntigraphError::Schema(format!(
                            "{}.{} is declared as backref of {}.{} but is not a relationship",
                            target_type, backref, source_type, source_field
                        )));
                    }
                    // Two stored forward fields naming each other are allowed.
                    FieldKind::Relationship(rel) if rel.operator.is_forward() => {}
                    FieldKind::Relationship(rel) => {
                        if !rel.target_types.contains(&source_type) {
                            return Err(EntigraphError::Schema(format!(
                                "{}.{} is declared as backref of {}.{} but targets {:?}",
                                target_type, backref, source_type, source_field, rel.target_types
                            )));
                        }
                        let paired = rel.backref_field.clone();
                        match paired {
                            None => rel.backref_field = Some(source_field.clone()),
                            Some(existing) if existing == source_field => {}
                            Some(existing) => {
                                return Err(EntigraphError::Schema(format!(
                                    "{}.{} pairs with {}.{} but {}.{} claims it as backref",
                                    target_type,
                                    backref,
                                    source_type,
                                    existing,
                                    source_type,
                                    source_field
                                )));
                            }
                        }
                    }
                },
            }
        }

        Ok(())
    }

    fn pair_backward_fields(&self, entities: &mut [EntitySchema]) -> Result<()> {
        // (entity index, field name, resolved backref)
        let mut resolved: Vec<(usize, String, String)> = Vec::new();

        for (idx, entity) in entities.iter().enumerate() {
            for (field, rel) in entity.relationships() {
                if rel.operator.is_forward() {
                    continue;
                }

                if let Some(backref) = &rel.backref_field {
                    // Every target queried through the backref must point back here.
                    // `<~` may also ground against a primitive field.
                    for target_name in &rel.target_types {
                        let target = find_entity(entities, target_name)?;
                        let problem = match target.field(backref).map(|f| &f.kind) {
                            Some(FieldKind::Relationship(candidate_rel))
                                if candidate_rel.operator.is_forward()
                                    && candidate_rel.target_types.contains(&entity.name) =>
                            {
                                None
                            }
                            Some(FieldKind::Relationship(_)) => Some(format!(
                                "'{}.{}' is not a forward relationship to {}",
                                target_name, backref, entity.name
                            )),
                            Some(FieldKind::Primitive(_)) if rel.operator.is_fuzzy() => None,
                            None if rel.operator.is_fuzzy() => None,
                            _ => Some(format!(
                                "'{}' is not a relationship field of {}",
                                backref, target_name
                            )),
                        };
                        if let Some(problem) = problem {
                            return Err(EntigraphError::Schema(format!(
                                "{}.{}: {}",
                                entity.name, field.name, problem
                            )));
                        }
                    }
                    continue;
                }

                let mut candidates: Vec<(String, String)> = Vec::new();
                for target_name in &rel.target_types {
                    let target = find_entity(entities, target_name)?;
                    for (candidate, candidate_rel) in target.relationships() {
                        if candidate_rel.operator.is_forward()
                            && candidate_rel.target_types.contains(&entity.name)
                        {
                            candidates.push((target_name.clone(), candidate.name.clone()));
                        }
                    }
                }

                match candidates.len() {
                    0 if rel.operator == RelationOperator::BackwardExact => {
                        return Err(EntigraphError::Schema(format!(
                            "{}.{}: no forward relationship on {} points back to {}",
                            entity.name,
                            field.name,
                            rel.target_type(),
                            entity.name
                        )));
                    }
                    0 => {}
                    1 => resolved.push((idx, field.name.clone(), candidates[0].1.clone())),
                    _ => match self.backref_policy {
                        BackrefPolicy::FirstDeclared => {
                            log::warn!(
                                "{}.{}: ambiguous backref, candidates {:?}; using first declared '{}.{}'",
                                entity.name,
                                field.name,
                                candidates,
                                candidates[0].0,
                                candidates[0].1
                            );
                            resolved.push((idx, field.name.clone(), candidates[0].1.clone()));
                        }
                        BackrefPolicy::Reject => {
                            return Err(EntigraphError::Schema(format!(
                                "{}.{}: ambiguous backref, candidates {:?}; declare it explicitly",
                                entity.name, field.name, candidates
                            )));
                        }
                    },
                }
            }
        }

        for (idx, field_name, backref) in resolved {
            if let Some(FieldKind::Relationship(rel)) =
                entities[idx].field_mut(&field_name).map(|f| &mut f.kind)
            {
                rel.backref_field = Some(backref);
            }
        }

        Ok(())
    }
}

fn find_entity<'a>(entities: &'a [EntitySchema], name: &str) -> Result<&'a EntitySchema> {
    entities
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| EntigraphError::Schema(format!("unknown entity type '{}'", name)))
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Strip trailing `[]`, `##`, `#`, `!`, `?` in any order.
fn strip_modifiers(text: &str) -> (&str, Modifiers) {
    let mut mods = Modifiers::default();
    let mut base = text;
    loop {
        if let Some(rest) = base.strip_suffix("[]") {
            mods.array = true;
            base = rest.trim_end();
        } else if let Some(rest) = base.strip_suffix("##") {
            mods.unique = true;
            mods.indexed = true;
            base = rest.trim_end();
        } else if let Some(rest) = base.strip_suffix('#') {
            mods.indexed = true;
            base = rest.trim_end();
        } else if let Some(rest) = base.strip_suffix('!') {
            mods.required = true;
            base = rest.trim_end();
        } else if let Some(rest) = base.strip_suffix('?') {
            mods.optional = true;
            base = rest.trim_end();
        } else {
            break;
        }
    }
    (base, mods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blog() -> Value {
        json!({
            "Author": {
                "$instructions": "A technical blogger",
                "name": "string!",
                "bio": "A two sentence biography",
                "posts": "<-Post.author",
            },
            "Post": {
                "title": "string##",
                "status": "Draft | Published",
                "author": "->Author",
                "tags": ["->Tag"],
                "category": "~>Category(0.8)",
                "createdAt": null,
            },
            "Tag": { "name": "string#" },
            "Category": { "name": "string" },
        })
    }

    #[test]
    fn test_parse_primitives_and_modifiers() {
        let schema = parse_schema(&blog()).unwrap();
        let post = schema.entity("Post").unwrap();

        let title = post.field("title").unwrap();
        assert_eq!(title.primitive(), Some(&PrimitiveType::String));
        assert!(title.unique && title.indexed);

        let name = schema.entity("Author").unwrap().field("name").unwrap();
        assert!(name.is_required);

        let status = post.field("status").unwrap();
        assert_eq!(
            status.primitive(),
            Some(&PrimitiveType::Enum(vec!["Draft".into(), "Published".into()]))
        );
    }

    #[test]
    fn test_free_text_prompt() {
        let schema = parse_schema(&blog()).unwrap();
        let bio = schema.entity("Author").unwrap().field("bio").unwrap();
        assert_eq!(bio.primitive(), Some(&PrimitiveType::String));
        assert_eq!(bio.prompt.as_deref(), Some("A two sentence biography"));
    }

    #[test]
    fn test_prompt_with_question_mark_is_not_optional() {
        let schema = parse_schema(&json!({
            "Idea": { "problem": "What problem does it solve?" }
        }))
        .unwrap();
        let field = schema.entity("Idea").unwrap().field("problem").unwrap();
        assert!(!field.is_optional);
        assert_eq!(field.prompt.as_deref(), Some("What problem does it solve?"));
    }

    #[test]
    fn test_marker_token() {
        let schema = parse_schema(&json!({ "Task": { "action": "Approve" } })).unwrap();
        let field = schema.entity("Task").unwrap().field("action").unwrap();
        assert_eq!(field.primitive(), Some(&PrimitiveType::Marker("Approve".into())));
    }

    #[test]
    fn test_relationship_operators() {
        let schema = parse_schema(&blog()).unwrap();

        let author = schema.descriptor("Post", "author").unwrap();
        assert_eq!(author.operator, RelationOperator::ForwardExact);
        assert_eq!(author.target_type(), "Author");
        assert_eq!(author.threshold, None);

        let tags = schema.entity("Post").unwrap().field("tags").unwrap();
        assert!(tags.is_array);

        let category = schema.descriptor("Post", "category").unwrap();
        assert_eq!(category.operator, RelationOperator::ForwardFuzzy);
        assert_eq!(category.threshold, Some(0.8));

        let posts = schema.descriptor("Author", "posts").unwrap();
        assert_eq!(posts.operator, RelationOperator::BackwardExact);
        assert_eq!(posts.backref_field.as_deref(), Some("author"));
    }

    #[test]
    fn test_fuzzy_default_threshold() {
        let schema = parse_schema(&json!({
            "Person": { "occupation": "<~Occupation" },
            "Occupation": { "title": "string" },
        }))
        .unwrap();
        let rel = schema.descriptor("Person", "occupation").unwrap();
        assert_eq!(rel.threshold, Some(DEFAULT_FUZZY_THRESHOLD));
        assert_eq!(rel.backref_field, None);
    }

    #[test]
    fn test_union_targets() {
        let schema = parse_schema(&json!({
            "Task": { "tool": "<~Tool|Software(0.7)" },
            "Tool": { "name": "string" },
            "Software": { "name": "string" },
        }))
        .unwrap();
        let rel = schema.descriptor("Task", "tool").unwrap();
        assert_eq!(rel.target_types, vec!["Tool".to_string(), "Software".to_string()]);
        assert_eq!(rel.threshold, Some(0.7));
    }

    #[test]
    fn test_disabled_auto_field() {
        let schema = parse_schema(&blog()).unwrap();
        let post = schema.entity("Post").unwrap();
        assert!(post.field("createdAt").is_none());
        assert!(!post.auto_field_enabled("createdAt"));
        assert!(post.auto_field_enabled("updatedAt"));
    }

    #[test]
    fn test_metadata_keys() {
        let schema = parse_schema(&json!({
            "Author": {
                "$instructions": "A technical blogger",
                "$context": ["Topic"],
                "$icon": "pen",
                "name": "string",
            },
            "Topic": { "name": "string" },
        }))
        .unwrap();
        let author = schema.entity("Author").unwrap();
        assert_eq!(author.instructions.as_deref(), Some("A technical blogger"));
        assert_eq!(author.context_types, vec!["Topic".to_string()]);
        assert_eq!(author.metadata.get("$icon"), Some(&json!("pen")));
        assert_eq!(author.fields.len(), 1);
    }

    #[test]
    fn test_unknown_target_fails_at_parse_time() {
        let err = parse_schema(&json!({
            "Post": { "author": "->Autor" },
            "Author": { "name": "string" },
        }))
        .unwrap_err();
        assert!(matches!(err, EntigraphError::Schema(_)));
        assert!(err.to_string().contains("Autor"));
    }

    #[test]
    fn test_threshold_validation() {
        let out_of_range = parse_schema(&json!({
            "A": { "b": "~>B(1.5)" },
            "B": { "name": "string" },
        }));
        assert!(out_of_range.is_err());

        let on_exact = parse_schema(&json!({
            "A": { "b": "->B(0.5)" },
            "B": { "name": "string" },
        }));
        assert!(on_exact.is_err());

        let garbage = parse_schema(&json!({
            "A": { "b": "~>B(high)" },
            "B": { "name": "string" },
        }));
        assert!(garbage.is_err());
    }

    #[test]
    fn test_relationship_prompt_prefix() {
        let schema = parse_schema(&json!({
            "Startup": { "idea": "What is the core idea? ~>Idea" },
            "Idea": { "summary": "string" },
        }))
        .unwrap();
        let field = schema.entity("Startup").unwrap().field("idea").unwrap();
        assert_eq!(field.prompt.as_deref(), Some("What is the core idea?"));
        assert_eq!(field.relationship().unwrap().operator, RelationOperator::ForwardFuzzy);
    }

    #[test]
    fn test_backward_without_field_resolves_forward() {
        let schema = parse_schema(&json!({
            "Author": { "posts": "<-Post" },
            "Post": { "writer": "->Author" },
        }))
        .unwrap();
        let rel = schema.descriptor("Author", "posts").unwrap();
        assert_eq!(rel.backref_field.as_deref(), Some("writer"));
    }

    #[test]
    fn test_backward_without_candidate_fails() {
        let err = parse_schema(&json!({
            "Author": { "posts": "<-Post" },
            "Post": { "title": "string" },
        }))
        .unwrap_err();
        assert!(err.to_string().contains("points back"));
    }

    #[test]
    fn test_ambiguous_backref_first_declared() {
        let definition = json!({
            "Person": { "authored": "<-Book" },
            "Book": { "author": "->Person", "editor": "->Person" },
        });
        let schema = parse_schema(&definition).unwrap();
        let rel = schema.descriptor("Person", "authored").unwrap();
        assert_eq!(rel.backref_field.as_deref(), Some("author"));

        let strict = SchemaParser::new().with_backref_policy(BackrefPolicy::Reject);
        assert!(strict.parse(&definition).is_err());
    }

    #[test]
    fn test_forward_backref_synthesizes_reverse_field() {
        let schema = parse_schema(&json!({
            "Post": { "author": "->Author.posts" },
            "Author": { "name": "string" },
        }))
        .unwrap();
        let posts = schema.entity("Author").unwrap().field("posts").unwrap();
        assert!(posts.synthesized);
        assert!(posts.is_array);
        let rel = posts.relationship().unwrap();
        assert_eq!(rel.operator, RelationOperator::BackwardExact);
        assert_eq!(rel.target_type(), "Post");
        assert_eq!(rel.backref_field.as_deref(), Some("author"));
    }

    #[test]
    fn test_backref_on_primitive_fails() {
        let err = parse_schema(&json!({
            "Post": { "author": "->Author.name" },
            "Author": { "name": "string" },
        }))
        .unwrap_err();
        assert!(err.to_string().contains("not a relationship"));
    }

    #[test]
    fn test_explicit_backref_must_point_back() {
        let err = parse_schema(&json!({
            "Author": { "posts": "<-Post.tags" },
            "Post": { "author": "->Author", "tags": ["->Tag"] },
            "Tag": { "name": "string" },
        }))
        .unwrap_err();
        assert!(err.to_string().contains("not a forward relationship to Author"));

        let backward = parse_schema(&json!({
            "Author": { "posts": "<-Post.fans" },
            "Post": { "fans": "<-Author" },
        }));
        assert!(backward.is_err());

        let ok = parse_schema(&json!({
            "Author": { "posts": "<-Post.author" },
            "Post": { "author": "->Author" },
        }))
        .unwrap();
        assert_eq!(ok.descriptor("Author", "posts").unwrap().backref_field.as_deref(), Some("author"));
    }

    #[test]
    fn test_explicit_backref_checks_every_union_target() {
        let err = parse_schema(&json!({
            "Author": { "works": "<-Post|Page.author" },
            "Post": { "author": "->Author" },
            "Page": { "title": "string" },
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Page"));

        let schema = parse_schema(&json!({
            "Author": { "works": "<-Post|Page.author" },
            "Post": { "author": "->Author" },
            "Page": { "author": "->Author" },
        }))
        .unwrap();
        assert_eq!(schema.descriptor("Author", "works").unwrap().target_types, vec!["Post", "Page"]);
    }

    #[test]
    fn test_cyclic_schema_parses() {
        let schema = parse_schema(&json!({
            "A": { "b": "->B" },
            "B": { "a": "->A" },
        }))
        .unwrap();
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn test_malformed_relationship() {
        let err = parse_schema(&json!({ "A": { "b": "->" } })).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_declaration_order_preserved() {
        let schema = parse_schema(&blog()).unwrap();
        let names: Vec<_> = schema
            .entity("Post")
            .unwrap()
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["title", "status", "author", "tags", "category"]);
    }

    #[test]
    fn test_parse_yaml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("schema.yaml");
        std::fs::write(
            &path,
            "Author:\n  name: string\nPost:\n  title: string\n  author: ->Author.posts\n",
        )
        .unwrap();
        let schema = parse_schema_file(&path).unwrap();
        assert!(schema.entity("Author").unwrap().field("posts").is_some());
    }
}
