//! Summary support: JSON projections, slug derivation and parent-GRN
//! tracking around a kind-specific summary.

use grn::Grn;

use crate::error::Result;
use crate::kind::{EntityErrorInfo, EntitySummary};

/// A summary plus everything the write path derives from it once.
#[derive(Debug, Clone)]
pub struct SummarySupport {
    pub model: EntitySummary,
    /// JSON projections, serialised once and reused for the entity row
    /// and the search index rows. None when the source is empty.
    pub labels: Option<String>,
    pub fields: Option<String>,
    pub errors: Option<String>,
    /// Whole-summary JSON, echoed on write responses.
    pub marshaled: Vec<u8>,
    pub folder: String,
    /// For a top-level entity this is its own GRN (used to derive the
    /// children's); for a nested child it is the containing entity's.
    pub parent_grn: Option<Grn>,
    pub is_nested: bool,
}

impl SummarySupport {
    pub fn new(model: EntitySummary) -> Result<Self> {
        let labels = if model.labels.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&model.labels)?)
        };
        let fields = if model.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&model.fields)?)
        };
        let errors = match &model.error {
            Some(e) => Some(serde_json::to_string(e)?),
            None => None,
        };
        let marshaled = serde_json::to_vec(&model)?;
        Ok(Self {
            model,
            labels,
            fields,
            errors,
            marshaled,
            folder: String::new(),
            parent_grn: None,
            is_nested: false,
        })
    }

    /// Re-serialise the labels projection after a merge.
    pub fn refresh_labels(&mut self) -> Result<()> {
        self.labels = if self.model.labels.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&self.model.labels)?)
        };
        Ok(())
    }

    /// Empty for top-level entities; the containing entity's serialised
    /// GRN for nested children.
    pub fn parent_grn_string(&self) -> String {
        if self.is_nested {
            self.parent_grn
                .as_ref()
                .map(|g| g.to_grn_string())
                .unwrap_or_default()
        } else {
            String::new()
        }
    }
}

/// Rebuild a summary from the projections stored on an entity row.
pub fn summary_from_projections(
    name: String,
    slug: String,
    description: Option<String>,
    labels: Option<String>,
    fields: Option<String>,
    errors: Option<String>,
) -> Result<EntitySummary> {
    let mut summary = EntitySummary {
        name,
        slug,
        description: description.unwrap_or_default(),
        ..Default::default()
    };
    if let Some(labels) = labels {
        summary.labels = serde_json::from_str(&labels)?;
    }
    if let Some(fields) = fields {
        summary.fields = serde_json::from_str(&fields)?;
    }
    if let Some(errors) = errors {
        summary.error = Some(serde_json::from_str::<EntityErrorInfo>(&errors)?);
    }
    Ok(summary)
}

/// Lowercase, alphanumeric, dash-separated.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    out
}
