//! Schema and scoring-space construction.
//!
//! Turns a [`ColumnMapping`] into a [`SchemaDef`] (the record field list) and
//! one [`Space`] per constructible column. Column descriptors are a tagged
//! union, [`SpaceKind`], carrying the role-specific parameters.

use serde::{Deserialize, Serialize};

use crate::config::SpacesConfig;
use crate::error::{RagError, RagResult};
use crate::models::{Categories, ColumnMapping, Role, SpaceWeights};
use crate::table::ID_COLUMN;

/// Direction a number space rewards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberMode {
    Maximum,
}

/// Role-specific parameters of one scoring space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpaceKind {
    TextSimilarity {
        chunk_size: usize,
        chunk_overlap: usize,
        model: String,
    },
    Recency {
        period_days: u32,
        negative_filter: f64,
    },
    Number {
        min: f64,
        max: f64,
        mode: NumberMode,
    },
    Category {
        categories: Vec<String>,
        negative_filter: f64,
        uncategorized_as_category: bool,
    },
}

impl SpaceKind {
    pub fn role(&self) -> Role {
        match self {
            SpaceKind::TextSimilarity { .. } => Role::TextSimilarity,
            SpaceKind::Recency { .. } => Role::Recency,
            SpaceKind::Number { .. } => Role::Number,
            SpaceKind::Category { .. } => Role::Category,
        }
    }
}

/// One scoring dimension bound to a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    /// `{column}_space`
    pub name: String,
    pub column: String,
    #[serde(flatten)]
    pub kind: SpaceKind,
    pub default_weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    /// Integer epoch seconds.
    Timestamp,
    Float,
}

impl FieldType {
    fn for_role(role: Role) -> Self {
        match role {
            Role::TextSimilarity | Role::Category => FieldType::String,
            Role::Recency => FieldType::Timestamp,
            Role::Number => FieldType::Float,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

/// Record definition built at request time from a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    pub id_field: String,
    pub fields: Vec<FieldDef>,
}

/// Output of [`build_spaces`].
#[derive(Debug, Clone)]
pub struct SpaceSet {
    pub schema: SchemaDef,
    pub spaces: Vec<Space>,
    /// Position in `spaces` of the first text space in mapping order.
    pub anchor: Option<usize>,
}

impl SpaceSet {
    pub fn anchor_space(&self) -> Option<&Space> {
        self.anchor.and_then(|i| self.spaces.get(i))
    }

    pub fn default_weights(&self) -> SpaceWeights {
        self.spaces
            .iter()
            .map(|s| (s.column.clone(), s.default_weight))
            .collect()
    }
}

/// Build the schema and one space per mapped column.
///
/// `weights` replace the configured per-role default weight for the columns
/// they name. A category column without any extracted values gets no space
/// (a warning is logged). Fails with [`RagError::NoValidSpaces`] when no
/// space at all could be built.
pub fn build_spaces(
    index_name: &str,
    mapping: &ColumnMapping,
    categories: &Categories,
    weights: &SpaceWeights,
    config: &SpacesConfig,
    model: &str,
) -> RagResult<SpaceSet> {
    let schema = SchemaDef {
        name: format!("{}_schema", index_name),
        id_field: ID_COLUMN.to_string(),
        fields: mapping
            .iter()
            .map(|(column, role)| FieldDef {
                name: column.to_string(),
                field_type: FieldType::for_role(role),
            })
            .collect(),
    };

    for column in weights.keys().filter(|c| !mapping.contains(c)) {
        tracing::warn!(column = %column, "weight given for unmapped column; ignored");
    }

    let mut spaces = Vec::with_capacity(mapping.len());
    let mut anchor = None;

    for (column, role) in mapping.iter() {
        let kind = match role {
            Role::TextSimilarity => SpaceKind::TextSimilarity {
                chunk_size: config.chunk_size,
                chunk_overlap: config.chunk_overlap,
                model: model.to_string(),
            },
            Role::Recency => SpaceKind::Recency {
                period_days: config.recency_period_days,
                negative_filter: config.recency_negative_filter,
            },
            Role::Number => SpaceKind::Number {
                min: config.number_min,
                max: config.number_max,
                mode: NumberMode::Maximum,
            },
            Role::Category => match categories.get(column) {
                Some(values) if !values.is_empty() => SpaceKind::Category {
                    categories: values.clone(),
                    negative_filter: config.category_negative_filter,
                    uncategorized_as_category: true,
                },
                _ => {
                    tracing::warn!(column, "no categories extracted; category space omitted");
                    continue;
                }
            },
        };

        let default_weight = weights
            .get(column)
            .copied()
            .unwrap_or_else(|| role_default_weight(role, config));

        if role == Role::TextSimilarity && anchor.is_none() {
            anchor = Some(spaces.len());
        }
        tracing::debug!(column, role = %role, weight = default_weight, "built space");
        spaces.push(Space {
            name: format!("{}_space", column),
            column: column.to_string(),
            kind,
            default_weight,
        });
    }

    if spaces.is_empty() {
        return Err(RagError::NoValidSpaces);
    }

    Ok(SpaceSet {
        schema,
        spaces,
        anchor,
    })
}

pub fn role_default_weight(role: Role, config: &SpacesConfig) -> f64 {
    match role {
        Role::TextSimilarity => config.text_weight,
        Role::Recency => config.recency_weight,
        Role::Number => config.number_weight,
        Role::Category => config.category_weight,
    }
}
